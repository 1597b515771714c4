//! The multiplexer table entry: one shared UDP endpoint plus its queue
//!  workers, reference-counted by the sockets bound to it.

use std::sync::Arc;

use tracing::debug;

use crate::channel::{AddrFamily, UdpChannel};
use crate::engine::BindParams;
use crate::queues::{RecvQueue, SendQueue};
use crate::socket_id::MuxId;

pub(crate) struct Multiplexer {
    pub id: MuxId,
    pub family: AddrFamily,
    pub port: u16,

    // bind parameters a socket must match to share this entry
    pub mss: u32,
    pub ttl: u32,
    pub tos: u32,
    pub v6only: Option<bool>,
    pub reusable: bool,

    /// Number of live socket records carrying this entry's id. Mutated only
    ///  under the registry lock.
    pub refcount: usize,

    pub channel: Arc<dyn UdpChannel>,
    pub snd_queue: Arc<SendQueue>,
    pub rcv_queue: Arc<RecvQueue>,
}

impl Multiplexer {
    /// Whether a bind with these parameters may attach to this entry instead
    ///  of creating a fresh channel.
    pub fn matches(&self, family: AddrFamily, port: u16, params: &BindParams) -> bool {
        self.reusable
            && self.family == family
            && self.port == port
            && self.mss == params.mss
            && self.ttl == params.ttl
            && self.tos == params.tos
            && self.v6only == params.v6only
    }

    /// Tear the entry down after the last socket released it. The queues are
    ///  silenced first so any operation still blocked on them drains with an
    ///  error before the channel goes away.
    pub fn shutdown(&self) {
        debug!("{} lost its last socket - closing channel on port {}", self.id, self.port);
        self.snd_queue.set_closing();
        self.rcv_queue.set_closing();
        self.channel.close();
    }
}
