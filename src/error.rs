use std::io;

use thiserror::Error;

/// Failure taxonomy of the transport core.
///
/// Every externally visible operation returns one of these instead of storing
///  a per-thread error slot; internal paths carry them as typed values and the
///  facade hands them straight to the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Platform or channel initialization failed (socket creation, bind, IP
    ///  option setup).
    #[error("platform setup failed: {0}")]
    Setup(#[from] io::Error),

    /// The operation requires a connected socket.
    #[error("socket is not connected")]
    NotConnected,

    /// The id does not refer to a live socket or group.
    #[error("unknown socket id")]
    InvalidSocketId,

    /// Malformed argument (zero backlog, family mismatch, wrong id class).
    #[error("invalid argument: {0}")]
    InvalidParam(&'static str),

    /// The operation requires a bound (`Opened`) socket.
    #[error("socket is not bound")]
    Unbound,

    /// The socket is already connected or connecting.
    #[error("socket is already connected")]
    AlreadyConnected,

    /// The operation is not available in rendezvous mode.
    #[error("operation not allowed on a rendezvous socket")]
    Rendezvous,

    /// A rendezvous connect requires an explicit bind first.
    #[error("rendezvous connect requires a bound socket")]
    RendezvousUnbound,

    /// The socket is not listening, or the listener was closed while waiting.
    #[error("socket is not listening")]
    NotListening,

    /// Non-blocking operation would have to wait.
    #[error("operation would block")]
    Again,

    /// Allocation failure or id-space exhaustion.
    #[error("resource exhaustion")]
    Resource,

    /// Catch-all for failures that have no dedicated classification.
    #[error("unexpected failure")]
    Unknown,
}
