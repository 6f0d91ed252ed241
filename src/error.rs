//! Error kinds surfaced at the session boundary.

use thiserror::Error;

/// Errors produced by the session state machine and its collaborators.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The transport could not bind the requested UDP port.
    #[error("failed to bind transport on port {port}")]
    BindFailed {
        port: u16,
        #[source]
        source: anyhow::Error,
    },

    /// `create`/`join` did not reach `Ready` within the caller's timeout.
    #[error("handshake timed out after {elapsed_ms}ms")]
    HandshakeTimeout { elapsed_ms: u64 },

    /// The host replied `Deny` to a join request.
    #[error("join request was rejected by the host")]
    HandshakeRejected,

    /// `set`/`get` were called while the session was not `Ready`, or a
    /// `get` caller was unblocked by `shutdown()`.
    #[error("operation invalid in current session state")]
    InvalidState,

    /// The codec could not decode an inbound datagram.
    #[error("malformed control message: {0}")]
    MalformedMessage(String),

    /// An error reported by the transport's own error handler. Logged,
    /// not fatal: the handshake's own timeout decides when to give up.
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
