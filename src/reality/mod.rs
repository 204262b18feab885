//! Reality TLS 1.3 emulation
//!
//! Looks to a passive observer exactly like a vanilla TLS 1.3 handshake
//! to the covered SNI while authenticating with a static X25519 key:
//!
//! - [`fingerprint`]: browser ClientHello layouts
//! - [`hello`]: ClientHello build / ServerHello parse
//! - [`auth`]: the 8-byte authenticator embedded in the client random
//! - [`keys`]: the RFC 8446 HKDF schedule
//! - [`record`]: the AES-GCM record layer
//! - [`stream`]: the handshake driver and the established stream

pub mod auth;
mod error;
pub mod fingerprint;
pub mod hello;
pub mod keys;
pub mod record;
mod stream;

pub use error::RealityError;
pub use fingerprint::FingerprintProfile;
pub use keys::{CipherSuite, TLS_AES_128_GCM_SHA256, TLS_AES_256_GCM_SHA384};
pub use record::RecordCrypter;
pub use stream::{connect, RealityStream};
