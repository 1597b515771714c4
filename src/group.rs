//! Connection groups: several connections presented behind one identifier,
//!  sharing a sequence space and an option overlay.

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use crate::engine::SeqNumber;
use crate::options::{OptionOverlay, OptionValue, SocketOption};
use crate::socket::SocketStatus;
use crate::socket_id::SocketId;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GroupType {
    /// Every member carries the full stream; the fastest delivery wins.
    Broadcast,
    /// One active member, the others stand by as failover paths.
    Backup,
}

/// Per-direction state of a member within its group.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MemberState {
    /// Connection initiated but not yet usable.
    Pending,
    /// Connected, not yet exercised in this direction.
    Idle,
    /// Actively carrying traffic.
    Running,
    Broken,
}

#[derive(Clone, Debug)]
pub struct GroupMember {
    pub id: SocketId,
    pub peer: Option<SocketAddr>,
    /// Source address the member was bound to, if one was requested.
    pub agent: Option<SocketAddr>,
    pub snd_state: MemberState,
    pub rcv_state: MemberState,
    pub last_status: SocketStatus,
}

/// Snapshot of one member, as reported to the application.
#[derive(Clone, Debug)]
pub struct GroupMemberData {
    pub id: SocketId,
    pub peer: Option<SocketAddr>,
    pub status: SocketStatus,
    pub snd_state: MemberState,
    pub rcv_state: MemberState,
}

pub struct GroupState {
    /// A managed group creates member connections itself during a group
    ///  connect. Adding a pre-existing socket clears this permanently.
    pub managed: bool,
    pub members: Vec<GroupMember>,
    /// The initial sequence number imposed on members after the first, so all
    ///  members share one sequence space.
    pub sched_isn: Option<SeqNumber>,
    pub options: OptionOverlay,
    /// Set once the first connect has been issued on the group.
    pub open: bool,
    /// Whether group connect blocks until a member is usable.
    pub blocking: bool,
}

pub struct Group {
    pub id: SocketId,
    pub kind: GroupType,
    state: Mutex<GroupState>,
    /// Signalled on every member state change; blocking group connects wait
    ///  on this.
    pub notify: Notify,
}

impl Group {
    pub fn new(id: SocketId, kind: GroupType) -> Group {
        assert!(id.is_group());
        Group {
            id,
            kind,
            state: Mutex::new(GroupState {
                managed: true,
                members: Vec::new(),
                sched_isn: None,
                options: OptionOverlay::default(),
                open: false,
                blocking: true,
            }),
            notify: Notify::new(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().expect("group lock poisoned")
    }

    /// Admit a pre-existing socket. Only possible while the group is empty;
    ///  doing so converts the group to non-managed for good.
    pub fn add_explicit(&self, member: GroupMember) -> Result<(), ()> {
        let mut state = self.state();
        if state.managed && !state.members.is_empty() {
            return Err(());
        }
        if state.managed {
            debug!("{}: explicit member added, clearing managed flag", self.id);
            state.managed = false;
        }
        state.members.push(member);
        Ok(())
    }

    /// Add a member created by the group itself during a managed connect.
    pub fn add_managed(&self, member: GroupMember) {
        let mut state = self.state();
        state.open = true;
        state.members.push(member);
    }

    pub fn remove_member(&self, id: SocketId) -> bool {
        let mut state = self.state();
        let before = state.members.len();
        state.members.retain(|m| m.id != id);
        let removed = state.members.len() != before;
        if removed {
            self.notify.notify_waiters();
        }
        removed
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.state().members.iter().any(|m| m.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.state().members.is_empty()
    }

    /// Update a member's sub-states, signalling any blocked group operation.
    pub fn update_member(
        &self,
        id: SocketId,
        f: impl FnOnce(&mut GroupMember),
    ) -> bool {
        let mut state = self.state();
        let found = match state.members.iter_mut().find(|m| m.id == id) {
            Some(member) => {
                f(member);
                true
            }
            None => false,
        };
        drop(state);
        if found {
            self.notify.notify_waiters();
        }
        found
    }

    /// Record the option on the overlay for future members.
    pub fn set_option(&self, key: SocketOption, value: OptionValue) {
        self.state().options.set(key, value);
    }

    pub fn get_option(&self, key: SocketOption) -> Option<OptionValue> {
        self.state().options.get(key).cloned()
    }

    /// Whether any member is usable in at least one direction.
    pub fn any_member_usable(&self) -> bool {
        self.state().members.iter().any(|m| {
            matches!(m.snd_state, MemberState::Idle | MemberState::Running)
                || matches!(m.rcv_state, MemberState::Idle | MemberState::Running)
        })
    }

    /// Whether every member has failed.
    pub fn all_members_broken(&self) -> bool {
        let state = self.state();
        !state.members.is_empty()
            && state
                .members
                .iter()
                .all(|m| m.snd_state == MemberState::Broken && m.rcv_state == MemberState::Broken)
    }

    pub fn member_data(&self) -> Vec<GroupMemberData> {
        self.state()
            .members
            .iter()
            .map(|m| GroupMemberData {
                id: m.id,
                peer: m.peer,
                status: m.last_status,
                snd_state: m.snd_state,
                rcv_state: m.rcv_state,
            })
            .collect()
    }
}
