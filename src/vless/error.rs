//! VLESS protocol errors

use std::io;

use thiserror::Error;

/// Errors produced by the VLESS codec and client
#[derive(Debug, Error)]
pub enum VlessError {
    /// Response version byte was not 0
    #[error("Invalid VLESS version: {0}")]
    InvalidVersion(u8),

    /// Command byte outside {1, 2}
    #[error("Invalid VLESS command: {0:#04x}")]
    InvalidCommand(u8),

    /// Address type byte outside {1, 2, 3}
    #[error("Invalid address type: {0:#04x}")]
    InvalidAddressType(u8),

    /// Domain address with zero length
    #[error("Empty domain in address")]
    EmptyDomain,

    /// Domain longer than 255 bytes
    #[error("Domain too long: {0} bytes (max 255)")]
    DomainTooLong(usize),

    /// Domain bytes were not valid UTF-8
    #[error("Invalid domain encoding: {0}")]
    InvalidDomainEncoding(String),

    /// Addons blob failed to encode
    #[error("Addons encode error: {0}")]
    AddonsEncode(String),

    /// Addons blob failed to parse
    #[error("Addons parse error: {0}")]
    AddonsParse(String),

    /// UDP payload exceeding the u16 length prefix
    #[error("UDP payload too large: {0} bytes (max 65535)")]
    DatagramTooLarge(usize),

    /// The stream ended in the middle of a length-prefixed datagram
    #[error("Truncated UDP frame: expected {expected} payload bytes, got {got}")]
    TruncatedDatagram { expected: usize, got: usize },

    /// The outbound stream closed before the response header arrived
    #[error("Connection closed during handshake")]
    ClosedDuringHandshake,

    /// I/O on the underlying transport
    #[error("VLESS I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VlessError {
    pub fn addons_encode(reason: impl Into<String>) -> Self {
        Self::AddonsEncode(reason.into())
    }

    pub fn addons_parse(reason: impl Into<String>) -> Self {
        Self::AddonsParse(reason.into())
    }
}
