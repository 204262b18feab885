//! TLS 1.3 AEAD record layer
//!
//! AES-GCM records with the standard nonce construction: the 12-byte IV
//! XOR-ed with the big-endian 64-bit sequence number, right-aligned.
//! Sequence numbers start at 0 per (direction, key epoch). The AAD is the
//! 5-byte record header; the inner plaintext is
//! `content || content_type || zero_padding` and unwrapping scans for the
//! last non-zero byte.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};

use super::error::RealityError;
use super::keys::{CipherSuite, TrafficKeys, IV_LEN};

/// GCM tag length
pub const TAG_LEN: usize = 16;

/// Largest inner plaintext we will seal into one record
pub const MAX_PLAINTEXT: usize = 16_384;

/// XOR the nonce with the sequence number, right-aligned
pub fn xor_nonce_with_seq(nonce: &mut [u8; IV_LEN], seq: u64) {
    for (i, byte) in seq.to_be_bytes().iter().enumerate() {
        nonce[4 + i] ^= byte;
    }
}

/// Scan for the content type: index of the last non-zero byte
///
/// Returns `(content_type, content_len)`.
fn unwrap_inner(plaintext: &[u8]) -> Result<(u8, usize), RealityError> {
    let idx = plaintext
        .iter()
        .rposition(|&b| b != 0)
        .ok_or(RealityError::BadInnerPlaintext)?;
    Ok((plaintext[idx], idx))
}

enum SuiteCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

/// One direction of the record layer
pub struct RecordCrypter {
    cipher: SuiteCipher,
    iv: [u8; IV_LEN],
    seq: u64,
}

impl std::fmt::Debug for RecordCrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCrypter").field("seq", &self.seq).finish()
    }
}

impl RecordCrypter {
    /// Build a crypter from derived traffic keys; the sequence restarts
    /// at 0, which is what a key-epoch change requires.
    #[must_use]
    pub fn new(suite: CipherSuite, keys: &TrafficKeys) -> Self {
        let cipher = match suite {
            CipherSuite::Aes128GcmSha256 => SuiteCipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(&keys.key).expect("key length checked by suite"),
            )),
            CipherSuite::Aes256GcmSha384 => SuiteCipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(&keys.key).expect("key length checked by suite"),
            )),
        };
        Self {
            cipher,
            iv: keys.iv,
            seq: 0,
        }
    }

    /// Current sequence number (records processed so far)
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn next_nonce(&mut self) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        xor_nonce_with_seq(&mut nonce, self.seq);
        self.seq += 1;
        nonce
    }

    /// Seal `content` with the given inner content type into a full
    /// record (header included).
    ///
    /// # Errors
    ///
    /// Returns `RealityError` when the content exceeds the record size or
    /// the AEAD fails.
    pub fn seal_record(&mut self, content_type: u8, content: &[u8]) -> Result<Vec<u8>, RealityError> {
        if content.len() > MAX_PLAINTEXT {
            return Err(RealityError::RecordTooLarge(content.len()));
        }
        let mut inner = Vec::with_capacity(content.len() + 1);
        inner.extend_from_slice(content);
        inner.push(content_type);

        let record_len = inner.len() + TAG_LEN;
        let header = [
            0x17,
            0x03,
            0x03,
            (record_len >> 8) as u8,
            (record_len & 0xFF) as u8,
        ];

        let nonce = self.next_nonce();
        let payload = Payload {
            msg: &inner,
            aad: &header,
        };
        let ciphertext = match &self.cipher {
            SuiteCipher::Aes128(c) => c.encrypt(Nonce::from_slice(&nonce), payload),
            SuiteCipher::Aes256(c) => c.encrypt(Nonce::from_slice(&nonce), payload),
        }
        .map_err(|_| RealityError::EncryptFailed)?;

        let mut record = Vec::with_capacity(5 + ciphertext.len());
        record.extend_from_slice(&header);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Open one record given its header and ciphertext.
    ///
    /// Returns `(content_type, content)` with the zero padding stripped.
    ///
    /// # Errors
    ///
    /// Returns `RealityError::DecryptFailed` on AEAD failure and
    /// `RealityError::BadInnerPlaintext` for all-zero plaintexts.
    pub fn open_record(
        &mut self,
        header: &[u8; 5],
        ciphertext: &[u8],
    ) -> Result<(u8, Vec<u8>), RealityError> {
        let nonce = self.next_nonce();
        let payload = Payload {
            msg: ciphertext,
            aad: header,
        };
        let plaintext = match &self.cipher {
            SuiteCipher::Aes128(c) => c.decrypt(Nonce::from_slice(&nonce), payload),
            SuiteCipher::Aes256(c) => c.decrypt(Nonce::from_slice(&nonce), payload),
        }
        .map_err(|_| RealityError::DecryptFailed)?;

        let (content_type, content_len) = unwrap_inner(&plaintext)?;
        Ok((content_type, plaintext[..content_len].to_vec()))
    }
}
