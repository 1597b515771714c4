use std::fmt::{Display, Formatter};

use crate::error::TransportError;

/// The bit that distinguishes group ids from socket ids. Valid ids are positive
///  `i32` values below this bit, so the sign bit stays clear and `0` / `-1` remain
///  available as reserved sentinels at the API boundary.
pub const GROUP_MASK: i32 = 1 << 30;

/// Largest raw value the generator hands out for the socket part of an id.
pub const MAX_SOCKET_VAL: i32 = GROUP_MASK - 1;

/// Opaque identifier of a connection or a group. Non-zero; the group bit is part
///  of the value, so a group id and the socket id it was derived from compare
///  unequal.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SocketId(i32);

impl Display for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_group() {
            write!(f, "${}", self.0 & !GROUP_MASK)
        }
        else {
            write!(f, "@{}", self.0)
        }
    }
}

impl SocketId {
    pub fn from_raw(value: i32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> i32 {
        self.0
    }

    pub fn is_group(&self) -> bool {
        self.0 & GROUP_MASK != 0
    }

    /// The id with the group bit cleared, i.e. the raw counter value it was
    ///  allocated from.
    pub fn base(&self) -> i32 {
        self.0 & !GROUP_MASK
    }
}

/// Identifier of a multiplexer table entry. By convention this is the raw id
///  of the socket whose bind created the entry.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MuxId(i32);

impl Display for MuxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "mux:{}", self.0)
    }
}

impl MuxId {
    pub fn from_socket(id: SocketId) -> Self {
        Self(id.to_raw())
    }

    pub fn to_raw(&self) -> i32 {
        self.0
    }
}

/// Allocator for socket and group ids.
///
/// Ids are allocated by decrement from a random starting point, wrapping around
///  at [`MAX_SOCKET_VAL`]. Before the counter returns to its starting point for
///  the first time every value is known to be fresh and allocation is O(1).
///  From then on each candidate is checked against the live registry (via the
///  `in_use` probe supplied by the caller), and a full fruitless cycle reports
///  resource exhaustion.
///
/// Group allocation shares the counter; only the returned value carries the
///  group bit.
pub struct IdGenerator {
    next: i32,
    /// The initial random value; `None` once the counter has wrapped past it and
    ///  probing became mandatory.
    fresh_until: Option<i32>,
    /// Wrap-around point. Always [`MAX_SOCKET_VAL`] in production.
    ceiling: i32,
}

impl IdGenerator {
    pub fn new() -> IdGenerator {
        let start = rand::Rng::gen_range(&mut rand::thread_rng(), 1..=MAX_SOCKET_VAL);
        Self::starting_at(start)
    }

    pub fn starting_at(start: i32) -> IdGenerator {
        assert!(start >= 1 && start <= MAX_SOCKET_VAL);
        IdGenerator {
            next: start,
            fresh_until: Some(start),
            ceiling: MAX_SOCKET_VAL,
        }
    }

    fn decrement(&self, value: i32) -> i32 {
        if value <= 1 {
            self.ceiling
        }
        else {
            value - 1
        }
    }

    /// Allocate the next id, probing `in_use` once the value space has been
    ///  traversed completely at least once.
    pub fn generate(
        &mut self,
        for_group: bool,
        mut in_use: impl FnMut(SocketId) -> bool,
    ) -> Result<SocketId, TransportError> {
        let first = self.decrement(self.next);

        if Some(first) == self.fresh_until {
            // the counter has come full circle: from now on every candidate must
            //  be checked against ids still alive from the previous cycle
            self.fresh_until = None;
        }

        let mut candidate = first;
        if self.fresh_until.is_none() {
            loop {
                if !in_use(Self::compose(candidate, for_group)) {
                    break;
                }
                candidate = self.decrement(candidate);
                if candidate == first {
                    // walked the whole space without finding a free value; leave
                    //  the counter where it is so the next call fails the same way
                    self.next = candidate;
                    return Err(TransportError::Resource);
                }
            }
        }

        self.next = candidate;
        Ok(Self::compose(candidate, for_group))
    }

    fn compose(value: i32, for_group: bool) -> SocketId {
        if for_group {
            SocketId(value | GROUP_MASK)
        }
        else {
            SocketId(value)
        }
    }
}
