//! Connection lifecycle and multiplexing core of a reliable, low-latency
//!  transport protocol over UDP, aimed at live media delivery.
//!
//! This crate is the *core* of such a transport: it owns the process-wide
//!  socket registry and everything around it, while the per-connection
//!  protocol machinery (congestion control, retransmission, buffering,
//!  handshake processing) stays behind the [`engine::ConnectionEngine`]
//!  contract.
//!
//! ## What the core does
//!
//! * Allocates opaque 32-bit connection and group identifiers from a shared,
//!   decrementing counter with wrap-around protection
//! * Tracks every connection in a registry behind one coarse lock: a live
//!   table, a closed table (records awaiting reclamation), a peer index for
//!   duplicate-handshake recognition, a group table and a multiplexer table
//! * Shares one UDP endpoint across many logical connections through
//!   reference-counted multiplexer entries, each with its own send and
//!   receive worker
//! * Turns inbound handshakes into fully registered connections *before* user
//!   code observes them, with backlog limits, adaptation of repeated
//!   handshakes and eviction of broken predecessors
//! * Bundles connections into groups that share a sequence space and an
//!   option overlay
//! * Provides an epoll-like readiness service over protocol sockets and
//!   plain OS sockets
//! * Defers all teardown to a background collector, so a close returns
//!   quickly while concurrent dispatchers still holding a reference stay safe
//!
//! ## What the core does not do
//!
//! No congestion control, no retransmission, no buffering, no cryptography,
//!  no wire format. Those are the engine's business; the core only calls the
//!  narrow contracts in [`engine`] and [`channel`].
//!
//! ## Lifecycle
//!
//! ```ascii
//!  Init --bind--> Opened --listen--> Listening
//!    \              \
//!     \              +--connect--> Connecting --> Connected
//!      +--connect (implicit bind)--^                  |
//!                                                   Broken
//!                                                     |
//!              close / collector:  ... --> Closed --> (reclaimed)
//! ```
//!
//! A closed record stays observable (status `Closed`) for a quiescence delay
//!  before the collector reclaims it; from then on the id reports `Nonexist`
//!  and may eventually be reused.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod group;
pub mod options;
pub mod queues;
pub mod readiness;
pub mod socket;
pub mod socket_id;
pub mod stack;

mod collector;
mod multiplexer;
mod registry;

pub use crate::config::CudpConfig;
pub use crate::error::TransportError;
pub use crate::registry::GroupConnectResult;
pub use crate::socket::SocketStatus;
pub use crate::socket_id::SocketId;
pub use crate::stack::Stack;
