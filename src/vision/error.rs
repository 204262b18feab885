//! Vision flow errors

use thiserror::Error;

/// Errors produced by the Vision padding codec
#[derive(Debug, Error)]
pub enum VisionError {
    /// The inbound byte stream does not line up with either a padding
    /// frame or a TLS record; the flow cannot recover.
    #[error("Vision stream desynchronized: {0}")]
    Desync(String),

    /// A frame header declared more payload than the codec allows
    #[error("Vision frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

impl VisionError {
    pub fn desync(reason: impl Into<String>) -> Self {
        Self::Desync(reason.into())
    }
}
