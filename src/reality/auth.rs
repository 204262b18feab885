//! Reality authenticator
//!
//! Eight bytes of the ClientHello random prove knowledge of the server's
//! static X25519 key while leaving the hello indistinguishable from a
//! vanilla one. The value is the truncated AES-128-GCM sealing of
//!
//! ```text
//! short_id (8, zero padded) || timestamp_u32_be || sha256(ecdh_shared)
//! ```
//!
//! keyed on the first 16 bytes of `sha256(server_public || client_public)`
//! with a zero nonce. The timestamp rounds down to the nearest 8 seconds,
//! giving the server a verification window without a clock exchange.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use sha2::{Digest, Sha256};

use super::error::RealityError;

/// Size of the authenticator embedded in `client_random`
pub const AUTHENTICATOR_LEN: usize = 8;

/// Timestamp granularity in seconds
pub const TIMESTAMP_STEP: u64 = 8;

/// Compute the authenticator.
///
/// `shared_secret` is the X25519 agreement between the client ephemeral
/// and the server's static public key. `short_id` is 0 to 8 bytes and is
/// zero padded on the right.
///
/// # Errors
///
/// Returns `RealityError::EncryptFailed` if the AEAD rejects the input
/// (which cannot happen for well-formed keys).
pub fn compute_authenticator(
    server_public: &[u8; 32],
    client_public: &[u8; 32],
    shared_secret: &[u8; 32],
    short_id: &[u8],
    unix_secs: u64,
) -> Result<[u8; AUTHENTICATOR_LEN], RealityError> {
    debug_assert!(short_id.len() <= 8);

    let mut key_input = [0u8; 64];
    key_input[..32].copy_from_slice(server_public);
    key_input[32..].copy_from_slice(client_public);
    let key_hash = Sha256::digest(key_input);
    let cipher = Aes128Gcm::new_from_slice(&key_hash[..16])
        .map_err(|_| RealityError::EncryptFailed)?;

    let timestamp = ((unix_secs / TIMESTAMP_STEP) * TIMESTAMP_STEP) as u32;

    let mut plaintext = Vec::with_capacity(8 + 4 + 32);
    let mut padded_id = [0u8; 8];
    padded_id[..short_id.len()].copy_from_slice(short_id);
    plaintext.extend_from_slice(&padded_id);
    plaintext.extend_from_slice(&timestamp.to_be_bytes());
    plaintext.extend_from_slice(&Sha256::digest(shared_secret));

    let nonce = [0u8; 12];
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| RealityError::EncryptFailed)?;

    let mut out = [0u8; AUTHENTICATOR_LEN];
    out.copy_from_slice(&sealed[..AUTHENTICATOR_LEN]);
    Ok(out)
}
