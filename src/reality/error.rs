//! Reality errors

use std::io;

use thiserror::Error;

/// Errors from the Reality handshake and record layer
#[derive(Debug, Error)]
pub enum RealityError {
    /// The server closed or answered garbage during the handshake
    #[error("Reality handshake failed: {0}")]
    HandshakeFailed(String),

    /// No ServerHello with an x25519 key share was found
    #[error("ServerHello missing or malformed")]
    BadServerHello,

    /// The server picked a cipher suite outside the supported pair
    #[error("Unsupported cipher suite: {0:#06x}")]
    UnsupportedCipherSuite(u16),

    /// AEAD open failed; key mismatch or tampered record
    #[error("Record decryption failed")]
    DecryptFailed,

    /// AEAD seal failed
    #[error("Record encryption failed")]
    EncryptFailed,

    /// A record did not fit the TLS length field
    #[error("Record too large: {0} bytes")]
    RecordTooLarge(usize),

    /// The inner plaintext was all zeros (no content type byte)
    #[error("Record unpadding failed")]
    BadInnerPlaintext,

    /// The peer sent a fatal alert
    #[error("TLS alert received: {0}")]
    AlertReceived(u8),

    /// I/O on the underlying socket
    #[error("Reality I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RealityError {
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed(reason.into())
    }
}
