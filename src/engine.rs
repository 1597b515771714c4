//! Contracts between the connection core and its collaborators: the
//!  per-connection protocol engine (congestion control, retransmission,
//!  buffering, handshake processing) and the factory that creates engines.
//!
//! The core never looks inside these; it drives lifecycle transitions and
//!  multiplexing, and everything protocol-level crosses one of these traits.

use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::error::TransportError;
use crate::options::{OptionValue, SocketOption};
use crate::queues::{RecvQueue, SendQueue};
use crate::socket_id::{MuxId, SocketId};

/// Initial sequence number advertised in a handshake and coordinated across
///  group members.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SeqNumber(i32);

impl Display for SeqNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNumber {
    pub fn from_raw(value: i32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> i32 {
        self.0
    }
}

/// The handshake fields the core reads and rewrites. The full wire form stays
///  inside [`HandshakePacket::payload`] and is the codec's business.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    /// In a request this is the peer's socket id; a rewritten response carries
    ///  the local id instead.
    pub socket_id: SocketId,
    pub isn: SeqNumber,
    pub mss: u32,
    pub flight_flag_size: u32,
}

/// The raw datagram a handshake arrived in, passed through to
///  [`ConnectionEngine::accept_and_respond`] untouched.
#[derive(Clone, Debug)]
pub struct HandshakePacket {
    pub src: SocketAddr,
    pub payload: Bytes,
}

/// Result of dispatching an inbound handshake to a listener.
#[derive(Debug)]
pub enum AcceptOutcome {
    /// A repeated handshake matched an existing working connection; the
    ///  response was adapted to that record and no new id was allocated.
    Duplicate(Handshake),
    /// A fresh connection was registered and queued on the listener.
    Fresh { id: SocketId },
    /// The handshake was not honored.
    Refused(RejectReason),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RejectReason {
    UnknownListener,
    BacklogFull,
    IdExhausted,
    Internal,
}

/// Per-message delivery options for message-mode transfer, passed through to
///  the engine unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageControl {
    /// Give up on delivering the message after this long; the receiver skips
    ///  over it instead of stalling.
    pub ttl: Option<Duration>,
    /// Deliver only in order relative to other in-order messages.
    pub in_order: bool,
    /// Message number; assigned by the engine on receive.
    pub msg_no: Option<i32>,
}

/// Bind-relevant engine configuration, snapshotted when a socket attaches to a
///  multiplexer. Entries with equal parameters (plus port and family) may
///  share one multiplexer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BindParams {
    pub mss: u32,
    pub ttl: u32,
    pub tos: u32,
    /// `None` leaves the OS default untouched.
    pub v6only: Option<bool>,
    pub reuse_addr: bool,
}

/// The per-connection protocol engine, as consumed by the core.
///
/// NB: The engine owns all protocol state; the core calls these in response to
///  API operations and inbound dispatch, and observes the `is_*` flags from
///  the registry and the collector without additional synchronization, so the
///  flags must be safe to read concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionEngine: Send + Sync + 'static {
    /// Prepare the engine for I/O; called before the socket attaches to a
    ///  multiplexer.
    fn open(&self) -> Result<(), TransportError>;

    /// Enter listen mode. Failing leaves the socket `Opened`.
    fn set_listen_state(&self) -> Result<(), TransportError>;

    /// Detach from the receive path immediately so the port can be rebound
    ///  before the record itself is collected.
    fn not_listening(&self);

    /// Idempotent teardown of protocol state.
    fn close(&self);

    /// Start connecting to `target`. In blocking mode this returns once the
    ///  handshake concluded or failed; in non-blocking mode it returns after
    ///  initiating and the core observes completion separately.
    async fn start_connect(
        &self,
        target: SocketAddr,
        forced_isn: Option<SeqNumber>,
    ) -> Result<(), TransportError>;

    /// Conclude an inbound handshake on a freshly derived engine: consume the
    ///  request, send the response through the attached queues.
    async fn accept_and_respond(
        &self,
        peer: SocketAddr,
        hs: &Handshake,
        pkt: &HandshakePacket,
    ) -> Result<(), TransportError>;

    fn is_broken(&self) -> bool;
    fn is_connecting(&self) -> bool;
    fn is_connected(&self) -> bool;

    fn isn(&self) -> SeqNumber;
    fn mss(&self) -> u32;
    fn flight_flag_size(&self) -> u32;

    fn bind_params(&self) -> BindParams;
    fn is_rendezvous(&self) -> bool;

    /// Whether send / receive oriented operations block for this socket.
    fn is_sync_sending(&self) -> bool;
    fn is_sync_recving(&self) -> bool;

    /// Whether an accepted connection may be reported by its group id.
    fn group_connect_enabled(&self) -> bool;

    /// Receive data ready for the application right now.
    fn rcv_data_ready(&self) -> bool;
    /// Any buffered receive data at all, delivered or not yet deliverable.
    fn rcv_data_available(&self) -> bool;

    fn snd_buffer_len(&self) -> usize;
    fn snd_buffer_capacity(&self) -> usize;

    /// Deadline of a pending linger, computed by the engine when it first
    ///  observed the connection break.
    fn linger_deadline(&self) -> Option<Instant>;
    fn clear_linger(&self);

    /// Mark the engine as closing so in-flight operations drain with an error.
    fn set_closing(&self);

    /// Whether the engine is still hooked into its multiplexer's receive
    ///  dispatch. Reclamation waits for this to clear.
    fn on_receive_list(&self) -> bool;

    /// Hand the engine the queue endpoints of the multiplexer it was bound to.
    fn attach_queues(&self, snd: Arc<SendQueue>, rcv: Arc<RecvQueue>);

    async fn send(&self, data: &[u8]) -> Result<usize, TransportError>;
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    async fn send_message(
        &self,
        data: &[u8],
        ctrl: &MessageControl,
    ) -> Result<usize, TransportError>;
    async fn recv_message(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, MessageControl), TransportError>;

    fn set_option(&self, key: SocketOption, value: OptionValue) -> Result<(), TransportError>;
    fn get_option(&self, key: SocketOption) -> Result<OptionValue, TransportError>;
}

/// Creates engines for new sockets, and the per-multiplexer datagram sink that
///  feeds them.
#[cfg_attr(test, automock)]
pub trait EngineFactory: Send + Sync + 'static {
    fn new_engine(&self, id: SocketId) -> Arc<dyn ConnectionEngine>;

    /// Clone a listener's configuration into an engine for a connection
    ///  synthesized from an inbound handshake.
    fn derive_engine(
        &self,
        id: SocketId,
        listener: &Arc<dyn ConnectionEngine>,
    ) -> Arc<dyn ConnectionEngine>;

    /// The receive-side demultiplexer for a newly created multiplexer. It
    ///  parses datagrams, routes them to engines, and hands unassociated
    ///  handshakes back to the core's listener dispatch.
    fn new_sink(&self, mux_id: MuxId) -> Arc<dyn crate::queues::DatagramSink>;
}
