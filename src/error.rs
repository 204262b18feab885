//! Error types for rust-tunnel
//!
//! This module defines the error hierarchy for the tunnel data plane.
//! Errors are categorized by subsystem; protocol modules (`vless`, `vision`,
//! `reality`, `transport`, `mux`) define their own error enums and convert
//! into [`TunnelError`] at the boundary.

use std::io;

use thiserror::Error;

use crate::mux::MuxError;
use crate::reality::RealityError;
use crate::transport::TransportError;
use crate::vision::VisionError;
use crate::vless::VlessError;

/// Top-level error type for rust-tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration errors (URL parsing, dictionary validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Routing rule errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// DNS interception errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// Userspace stack errors
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    /// Transport dial and upgrade errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// VLESS protocol errors
    #[error("VLESS error: {0}")]
    Vless(#[from] VlessError),

    /// Vision flow errors
    #[error("Vision error: {0}")]
    Vision(#[from] VisionError),

    /// Reality handshake and record errors
    #[error("Reality error: {0}")]
    Reality(#[from] RealityError),

    /// Mux framing and session errors
    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Check whether this error is fatal to a single flow only.
    ///
    /// Everything except configuration and stack errors is scoped to the
    /// flow (or mux client) it occurred on; the stack itself keeps running.
    #[must_use]
    pub fn is_flow_scoped(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Stack(_))
    }
}

/// Configuration-related errors
///
/// Surfaced at admission time; a config that produced one of these never
/// reaches the data path.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Malformed share URL
    #[error("Invalid share URL: {0}")]
    InvalidUrl(String),

    /// Missing required field in a serialized config
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Field present but with an unusable value
    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Unknown enum tag (transport, security, fingerprint, ...)
    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    /// JSON document error
    #[error("Failed to parse document: {0}")]
    ParseError(String),

    /// I/O error while reading shared state
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    pub fn invalid_url(reason: impl Into<String>) -> Self {
        Self::InvalidUrl(reason.into())
    }

    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub fn unknown_variant(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.into(),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::ParseError(e.to_string())
    }
}

/// Routing rule errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// A proxy rule references a config UUID that is not in the document
    #[error("Rule references unknown config: {0}")]
    UnknownConfig(uuid::Uuid),

    /// Keyword automaton construction failed
    #[error("Failed to build keyword matcher: {0}")]
    MatcherBuild(String),

    /// GeoIP database is malformed
    #[error("GeoIP database error: {0}")]
    GeoIpFormat(String),
}

/// DNS interception errors
#[derive(Debug, Error)]
pub enum DnsError {
    /// The query could not be parsed (truncated, compressed QNAME, ...)
    #[error("Malformed DNS query: {0}")]
    MalformedQuery(&'static str),

    /// Response would not fit the provided buffer
    #[error("DNS response too large")]
    ResponseTooLarge,
}

/// Userspace stack errors
#[derive(Debug, Error)]
pub enum StackError {
    /// The stack task has shut down; the handle is stale
    #[error("Stack is not running")]
    NotRunning,

    /// The flow id does not refer to a live flow
    #[error("Unknown flow: {0}")]
    UnknownFlow(u32),

    /// Inbound-to-local overflow buffer exceeded its cap
    #[error("Flow {0} exceeded the overflow buffer cap")]
    BackpressureOverflow(u32),

    /// The socket set is exhausted
    #[error("Socket set full")]
    SocketSetFull,
}
