//! TLS 1.3 key schedule (RFC 8446 §7.1)
//!
//! Implements the HKDF chain the client needs after the emulated
//! handshake: Early Secret, Handshake Secret, Master Secret, the client
//! and server traffic keys/IVs for each epoch, and the client Finished
//! `verify_data`. The hash is chosen by the server's cipher suite:
//!
//! | Suite | Hash | hash_len | key_len |
//! |---|---|---|---|
//! | `TLS_AES_128_GCM_SHA256` | SHA-256 | 32 | 16 |
//! | `TLS_AES_256_GCM_SHA384` | SHA-384 | 48 | 32 |

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

use super::error::RealityError;

/// `TLS_AES_128_GCM_SHA256`
pub const TLS_AES_128_GCM_SHA256: u16 = 0x1301;
/// `TLS_AES_256_GCM_SHA384`
pub const TLS_AES_256_GCM_SHA384: u16 = 0x1302;

/// Negotiated AEAD suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
}

impl CipherSuite {
    /// Decode the ServerHello cipher suite.
    ///
    /// # Errors
    ///
    /// Returns `RealityError::UnsupportedCipherSuite` outside the pair.
    pub fn from_u16(value: u16) -> Result<Self, RealityError> {
        match value {
            TLS_AES_128_GCM_SHA256 => Ok(Self::Aes128GcmSha256),
            TLS_AES_256_GCM_SHA384 => Ok(Self::Aes256GcmSha384),
            other => Err(RealityError::UnsupportedCipherSuite(other)),
        }
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Aes128GcmSha256 => TLS_AES_128_GCM_SHA256,
            Self::Aes256GcmSha384 => TLS_AES_256_GCM_SHA384,
        }
    }

    #[must_use]
    pub const fn hash_len(self) -> usize {
        match self {
            Self::Aes128GcmSha256 => 32,
            Self::Aes256GcmSha384 => 48,
        }
    }

    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128GcmSha256 => 16,
            Self::Aes256GcmSha384 => 32,
        }
    }
}

/// AEAD IV length (both suites)
pub const IV_LEN: usize = 12;

fn hmac_hash(suite: CipherSuite, key: &[u8], chunks: &[&[u8]]) -> Vec<u8> {
    match suite {
        CipherSuite::Aes128GcmSha256 => {
            let mut mac =
                <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
            for c in chunks {
                mac.update(c);
            }
            mac.finalize().into_bytes().to_vec()
        }
        CipherSuite::Aes256GcmSha384 => {
            let mut mac =
                <Hmac<Sha384> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
            for c in chunks {
                mac.update(c);
            }
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Hash of the transcript bytes under the suite's digest
#[must_use]
pub fn transcript_hash(suite: CipherSuite, messages: &[u8]) -> Vec<u8> {
    match suite {
        CipherSuite::Aes128GcmSha256 => Sha256::digest(messages).to_vec(),
        CipherSuite::Aes256GcmSha384 => Sha384::digest(messages).to_vec(),
    }
}

/// HKDF-Extract; an empty salt means a zero salt of hash length
fn hkdf_extract(suite: CipherSuite, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
    if salt.is_empty() {
        let zero_salt = vec![0u8; suite.hash_len()];
        hmac_hash(suite, &zero_salt, &[ikm])
    } else {
        hmac_hash(suite, salt, &[ikm])
    }
}

/// HKDF-Expand: `T(1) || T(2) || ...` truncated to `length`
fn hkdf_expand(suite: CipherSuite, prk: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(length);
    let mut t: Vec<u8> = Vec::new();
    let mut counter = 1u8;
    while out.len() < length {
        t = hmac_hash(suite, prk, &[&t, info, &[counter]]);
        let take = (length - out.len()).min(t.len());
        out.extend_from_slice(&t[..take]);
        counter += 1;
    }
    out
}

/// HKDF-Expand-Label(Secret, Label, Context, Length)
///
/// Info layout: `length(2) | label_len(1) | "tls13 " + label | ctx_len(1) | ctx`.
#[must_use]
pub fn hkdf_expand_label(
    suite: CipherSuite,
    secret: &[u8],
    label: &str,
    context: &[u8],
    length: usize,
) -> Vec<u8> {
    let full_label_len = 6 + label.len();
    let mut info = Vec::with_capacity(4 + full_label_len + context.len());
    info.extend_from_slice(&(length as u16).to_be_bytes());
    info.push(full_label_len as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label.as_bytes());
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    hkdf_expand(suite, secret, &info, length)
}

/// Derive-Secret(Secret, Label, Messages)
fn derive_secret(suite: CipherSuite, secret: &[u8], label: &str, messages: &[u8]) -> Vec<u8> {
    let hash = transcript_hash(suite, messages);
    hkdf_expand_label(suite, secret, label, &hash, suite.hash_len())
}

/// Key + IV pair for one direction
#[derive(Debug, Clone)]
pub struct TrafficKeys {
    pub key: Vec<u8>,
    pub iv: [u8; IV_LEN],
}

fn traffic_keys(suite: CipherSuite, traffic_secret: &[u8]) -> TrafficKeys {
    let key = hkdf_expand_label(suite, traffic_secret, "key", &[], suite.key_len());
    let iv_bytes = hkdf_expand_label(suite, traffic_secret, "iv", &[], IV_LEN);
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&iv_bytes);
    TrafficKeys { key, iv }
}

/// Secrets and keys after the handshake flight
#[derive(Debug)]
pub struct HandshakeKeys {
    /// Handshake Secret, needed again for the application schedule
    pub handshake_secret: Vec<u8>,
    /// client_handshake_traffic_secret, needed for the Finished key
    pub client_traffic_secret: Vec<u8>,
    pub client: TrafficKeys,
    pub server: TrafficKeys,
}

/// Derive the handshake-epoch keys from the ECDH shared secret and the
/// transcript through ServerHello.
#[must_use]
pub fn derive_handshake_keys(
    suite: CipherSuite,
    shared_secret: &[u8],
    transcript: &[u8],
) -> HandshakeKeys {
    let zero_ikm = vec![0u8; suite.hash_len()];

    let early_secret = hkdf_extract(suite, &[], &zero_ikm);
    let derived = derive_secret(suite, &early_secret, "derived", &[]);
    let handshake_secret = hkdf_extract(suite, &derived, shared_secret);

    let client_traffic_secret =
        derive_secret(suite, &handshake_secret, "c hs traffic", transcript);
    let server_traffic_secret =
        derive_secret(suite, &handshake_secret, "s hs traffic", transcript);

    HandshakeKeys {
        client: traffic_keys(suite, &client_traffic_secret),
        server: traffic_keys(suite, &server_traffic_secret),
        client_traffic_secret,
        handshake_secret,
    }
}

/// Application-epoch keys
#[derive(Debug)]
pub struct ApplicationKeys {
    pub client: TrafficKeys,
    pub server: TrafficKeys,
}

/// Derive the application-epoch keys from the Handshake Secret and the
/// transcript through the server Finished.
#[must_use]
pub fn derive_application_keys(
    suite: CipherSuite,
    handshake_secret: &[u8],
    transcript: &[u8],
) -> ApplicationKeys {
    let zero_ikm = vec![0u8; suite.hash_len()];

    let derived = derive_secret(suite, handshake_secret, "derived", &[]);
    let master_secret = hkdf_extract(suite, &derived, &zero_ikm);

    let client_secret = derive_secret(suite, &master_secret, "c ap traffic", transcript);
    let server_secret = derive_secret(suite, &master_secret, "s ap traffic", transcript);

    ApplicationKeys {
        client: traffic_keys(suite, &client_secret),
        server: traffic_keys(suite, &server_secret),
    }
}

/// `verify_data = HMAC(finished_key, Hash(transcript))`
#[must_use]
pub fn compute_finished(
    suite: CipherSuite,
    traffic_secret: &[u8],
    transcript: &[u8],
) -> Vec<u8> {
    let finished_key =
        hkdf_expand_label(suite, traffic_secret, "finished", &[], suite.hash_len());
    let th = transcript_hash(suite, transcript);
    hmac_hash(suite, &finished_key, &[&th])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_params() {
        let s = CipherSuite::from_u16(TLS_AES_128_GCM_SHA256).unwrap();
        assert_eq!(s.hash_len(), 32);
        assert_eq!(s.key_len(), 16);
        let s = CipherSuite::from_u16(TLS_AES_256_GCM_SHA384).unwrap();
        assert_eq!(s.hash_len(), 48);
        assert_eq!(s.key_len(), 32);
        assert!(CipherSuite::from_u16(0x1303).is_err());
    }

    #[test]
    fn test_early_secret_known_answer() {
        // HKDF-Extract(zero salt, zero IKM) with SHA-256, per RFC 8448 §3
        let zero = [0u8; 32];
        let early = hkdf_extract(CipherSuite::Aes128GcmSha256, &[], &zero);
        assert_eq!(
            hex::encode(early),
            "33ad0a1c607ec03b09e6cd9893680ce210adf300aa1f2660e1b22e10f170f92a"
        );
    }

    #[test]
    fn test_expand_label_info_shape() {
        // Length, label and context all reflected deterministically
        let secret = [7u8; 32];
        let a = hkdf_expand_label(CipherSuite::Aes128GcmSha256, &secret, "key", &[], 16);
        let b = hkdf_expand_label(CipherSuite::Aes128GcmSha256, &secret, "key", &[], 16);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let c = hkdf_expand_label(CipherSuite::Aes128GcmSha256, &secret, "iv", &[], 12);
        assert_eq!(c.len(), 12);
        assert_ne!(a[..12], c[..]);

        let d = hkdf_expand_label(CipherSuite::Aes128GcmSha256, &secret, "key", &[1], 16);
        assert_ne!(a, d);
    }

    #[test]
    fn test_handshake_key_derivation_shape() {
        let shared = [0x42u8; 32];
        let transcript = b"client hello || server hello";
        for suite in [CipherSuite::Aes128GcmSha256, CipherSuite::Aes256GcmSha384] {
            let keys = derive_handshake_keys(suite, &shared, transcript);
            assert_eq!(keys.handshake_secret.len(), suite.hash_len());
            assert_eq!(keys.client_traffic_secret.len(), suite.hash_len());
            assert_eq!(keys.client.key.len(), suite.key_len());
            assert_eq!(keys.server.key.len(), suite.key_len());
            assert_ne!(keys.client.key, keys.server.key);
            assert_ne!(keys.client.iv, keys.server.iv);
        }
    }

    #[test]
    fn test_application_keys_differ_from_handshake_keys() {
        let shared = [0x42u8; 32];
        let transcript = b"transcript";
        let suite = CipherSuite::Aes128GcmSha256;
        let hs = derive_handshake_keys(suite, &shared, transcript);
        let app = derive_application_keys(suite, &hs.handshake_secret, transcript);
        assert_ne!(hs.client.key, app.client.key);
        assert_ne!(hs.server.key, app.server.key);
    }

    #[test]
    fn test_finished_is_deterministic_and_keyed() {
        let suite = CipherSuite::Aes128GcmSha256;
        let secret = [9u8; 32];
        let a = compute_finished(suite, &secret, b"messages");
        let b = compute_finished(suite, &secret, b"messages");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        let c = compute_finished(suite, &secret, b"other messages");
        assert_ne!(a, c);
        let d = compute_finished(suite, &[8u8; 32], b"messages");
        assert_ne!(a, d);
    }

    #[test]
    fn test_hkdf_expand_multi_block() {
        // Lengths above one hash block exercise the T(n) chain
        let out = hkdf_expand(CipherSuite::Aes128GcmSha256, &[1u8; 32], b"info", 80);
        assert_eq!(out.len(), 80);
        // Prefix property: a shorter expand is a prefix of a longer one
        let short = hkdf_expand(CipherSuite::Aes128GcmSha256, &[1u8; 32], b"info", 32);
        assert_eq!(out[..32], short[..]);
    }
}
