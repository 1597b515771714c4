//! The per-connection record: everything the registry tracks about one
//!  connection, separated from the protocol engine that drives it.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::Notify;
use tracing::debug;

use crate::engine::{ConnectionEngine, SeqNumber};
use crate::socket_id::{MuxId, SocketId};

/// Externally visible lifecycle states of a connection.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SocketStatus {
    Init,
    Opened,
    Listening,
    Connecting,
    Connected,
    Broken,
    Closed,
    Nonexist,
}

/// The `(peer id, peer initial sequence number)` pair a handshake advertises;
///  used to recognize repeated handshakes from the same origin.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PeerSpec {
    pub peer_id: SocketId,
    pub peer_isn: SeqNumber,
}

/// Mutable control state, guarded by the record's control lock.
///
/// Lock discipline: the control lock is a leaf below the registry lock. It is
///  taken either on its own or nested inside the registry lock, and it is
///  never held while acquiring the registry lock or while awaiting the engine.
pub struct SocketControl {
    pub status: SocketStatus,
    pub peer_addr: Option<SocketAddr>,
    pub self_addr: Option<SocketAddr>,
    pub peer_spec: Option<PeerSpec>,
    /// Listener this record was synthesized by, if any.
    pub listen_parent: Option<SocketId>,
    pub mux_id: Option<MuxId>,
    /// Group this record belongs to, if any.
    pub group: Option<SocketId>,
    /// Time of the last state transition; drives collector timing.
    pub timestamp: Instant,
    /// Collector hysteresis: a broken record with undelivered receive data
    ///  survives this many passes.
    pub broken_counter: u32,
}

/// Listener-only state, guarded by the accept lock (coupled with the accept
///  condition). Allocated on the transition to `Listening` and kept until the
///  record is reclaimed.
pub struct ListenerState {
    pub backlog: usize,
    /// Fully handshaken connections awaiting `accept`.
    pub queued: BTreeSet<SocketId>,
    /// Connections already returned to the caller.
    pub accepted: BTreeSet<SocketId>,
}

pub struct SocketRecord {
    pub id: SocketId,
    pub engine: Arc<dyn ConnectionEngine>,
    control: Mutex<SocketControl>,
    listener: Mutex<Option<ListenerState>>,
    /// Signalled when a connection is queued on this listener or the listener
    ///  stops listening.
    pub accept_notify: Notify,
    /// Set when the core declares the record broken independently of the
    ///  engine (listener close, global shutdown).
    force_broken: AtomicBool,
}

impl SocketRecord {
    pub fn new(
        id: SocketId,
        engine: Arc<dyn ConnectionEngine>,
        broken_counter: u32,
    ) -> Arc<SocketRecord> {
        Arc::new(SocketRecord {
            id,
            engine,
            control: Mutex::new(SocketControl {
                status: SocketStatus::Init,
                peer_addr: None,
                self_addr: None,
                peer_spec: None,
                listen_parent: None,
                mux_id: None,
                group: None,
                timestamp: Instant::now(),
                broken_counter,
            }),
            listener: Mutex::new(None),
            accept_notify: Notify::new(),
            force_broken: AtomicBool::new(false),
        })
    }

    pub fn control(&self) -> MutexGuard<'_, SocketControl> {
        self.control.lock().expect("socket control lock poisoned")
    }

    pub fn listener(&self) -> MutexGuard<'_, Option<ListenerState>> {
        self.listener.lock().expect("accept lock poisoned")
    }

    /// Whether the connection is effectively broken, regardless of the stored
    ///  status.
    pub fn broken(&self) -> bool {
        self.force_broken.load(Ordering::Acquire) || self.engine.is_broken()
    }

    pub fn set_broken(&self) {
        self.force_broken.store(true, Ordering::Release);
    }

    /// The externally visible status. The engine's view overrides the stored
    ///  status in two cases: an engine-reported break, and a `Connecting`
    ///  record whose connection attempt silently expired (neither connecting
    ///  nor connected any more, e.g. after a handshake TTL ran out).
    pub fn get_status(&self) -> SocketStatus {
        if self.broken() {
            return SocketStatus::Broken;
        }

        let status = self.control().status;
        if status == SocketStatus::Connecting
            && !self.engine.is_connecting()
            && !self.engine.is_connected()
        {
            return SocketStatus::Broken;
        }
        status
    }

    /// Read readiness: deliverable data on a connected socket, a pending
    ///  connection on a listener, or a broken connection (so the caller can
    ///  observe the error).
    pub fn read_ready(&self) -> bool {
        if self.engine.is_connected() && self.engine.rcv_data_ready() {
            return true;
        }
        if self.control().status == SocketStatus::Listening {
            let listener = self.listener();
            return listener
                .as_ref()
                .map(|l| !l.queued.is_empty())
                .unwrap_or(false);
        }
        self.broken()
    }

    /// Write readiness: send-buffer headroom on a connected socket, or broken.
    pub fn write_ready(&self) -> bool {
        (self.engine.is_connected()
            && self.engine.snd_buffer_len() < self.engine.snd_buffer_capacity())
            || self.broken()
    }

    /// Idempotent local teardown: mark broken, close the engine, stamp the
    ///  transition. Group detachment is the registry's job since it owns the
    ///  group table.
    pub fn make_closed(&self) {
        debug!("{} closing", self.id);
        self.set_broken();
        self.engine.close();

        let mut control = self.control();
        control.status = SocketStatus::Closed;
        control.timestamp = Instant::now();
    }
}
