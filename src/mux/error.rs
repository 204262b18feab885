//! Mux errors

use thiserror::Error;

/// Errors from the mux framing and session layer
#[derive(Debug, Error)]
pub enum MuxError {
    /// A frame failed to decode; fatal to the whole client
    #[error("Invalid mux frame: {0}")]
    InvalidFrame(String),

    /// Session cap (32) reached on this client
    #[error("Mux client is full")]
    ClientFull,

    /// The client's carrier connection is gone
    #[error("Mux client closed")]
    ClientClosed,

    /// Monotonic stream ids ran out; the client refuses rather than wrap
    #[error("Mux stream ids exhausted")]
    StreamIdsExhausted,

    /// The session was closed by the peer or the client
    #[error("Mux session closed")]
    SessionClosed,
}

impl MuxError {
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame(reason.into())
    }
}
