use std::time::Duration;

/// Recognised per-socket option keys. The core does not interpret most of
///  them; they are passed through to the connection engine, and a group stores
///  them as an overlay that is replayed onto every member it creates.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum SocketOption {
    Mss,
    SndSyn,
    RcvSyn,
    Rendezvous,
    ReuseAddr,
    Ttl,
    Tos,
    Ipv6Only,
    Linger,
    SndBuf,
    RcvBuf,
    UdpSndBuf,
    UdpRcvBuf,
    ConnTimeo,
    GroupConnect,
}

#[derive(Clone, PartialEq, Debug)]
pub enum OptionValue {
    Bool(bool),
    Int(i32),
    Duration(Duration),
}

impl OptionValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            OptionValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// An option overlay: key/value pairs applied in insertion order. Used by
///  groups to configure member sockets created during a group connect.
#[derive(Default, Clone, Debug)]
pub struct OptionOverlay {
    entries: Vec<(SocketOption, OptionValue)>,
}

impl OptionOverlay {
    /// Record a value, replacing an earlier entry for the same key so the
    ///  overlay never grows beyond the number of distinct keys.
    pub fn set(&mut self, key: SocketOption, value: OptionValue) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        }
        else {
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: SocketOption) -> Option<&OptionValue> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(SocketOption, OptionValue)> {
        self.entries.iter()
    }
}
