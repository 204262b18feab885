//! Transport errors

use std::io;

use thiserror::Error;

/// Errors establishing or upgrading a transport connection
///
/// All of these are per-flow fatal: the flow aborts, the stack is
/// unaffected, and the local peer's own retransmission is the only retry.
#[derive(Debug, Error)]
pub enum TransportError {
    /// DNS resolution of the server address failed
    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// TCP connect failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// Connect or upgrade exceeded its deadline
    #[error("Connection timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Reality handshake failed
    #[error("Reality handshake failed: {0}")]
    Reality(#[from] crate::reality::RealityError),

    /// WebSocket upgrade failed
    #[error("WebSocket upgrade failed: {0}")]
    WebSocketUpgrade(String),

    /// HTTP-Upgrade response was not a valid 101
    #[error("HTTP upgrade failed: {0}")]
    HttpUpgrade(String),

    /// XHTTP (HTTP/2) layer failure
    #[error("XHTTP error: {0}")]
    Xhttp(String),

    /// I/O during connect or upgrade
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn connect(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    pub fn resolve(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolve {
            host: host.into(),
            reason: reason.into(),
        }
    }

    pub fn ws_upgrade(reason: impl Into<String>) -> Self {
        Self::WebSocketUpgrade(reason.into())
    }

    pub fn http_upgrade(reason: impl Into<String>) -> Self {
        Self::HttpUpgrade(reason.into())
    }

    pub fn xhttp(reason: impl Into<String>) -> Self {
        Self::Xhttp(reason.into())
    }
}
