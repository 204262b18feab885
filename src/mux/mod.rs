//! Stream multiplexing and XUDP
//!
//! Carries many virtual connections over one VLESS connection. See
//! [`frame`] for the wire format, [`client`] for the session machinery
//! and [`xudp`] for global-ID derivation.

mod client;
mod error;
pub mod frame;
mod manager;
pub mod xudp;

pub use client::{MuxClient, MuxSession, KEEPALIVE_PERIOD, MAX_SESSIONS};
pub use error::MuxError;
pub use frame::{FrameDecoder, MuxFrame, MuxNetwork};
pub use manager::MuxManager;
pub use xudp::global_id;
