//! UDP-over-VLESS length framing
//!
//! Each datagram is prefixed with its length as a `u16` big-endian and
//! the frames are concatenated on the stream. The decoder is incremental:
//! it accepts arbitrary byte chunks and yields whole datagrams, keeping a
//! partial prefix or payload across calls.

use bytes::{Buf, BytesMut};

use super::error::VlessError;

/// Maximum payload carried by one frame
pub const MAX_DATAGRAM: usize = u16::MAX as usize;

/// Frame one datagram.
///
/// # Errors
///
/// Returns `VlessError::DatagramTooLarge` beyond 65535 bytes.
pub fn encode_datagram(payload: &[u8]) -> Result<Vec<u8>, VlessError> {
    if payload.len() > MAX_DATAGRAM {
        return Err(VlessError::DatagramTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Frame one datagram into an existing buffer.
///
/// # Errors
///
/// Returns `VlessError::DatagramTooLarge` beyond 65535 bytes.
pub fn encode_datagram_into(payload: &[u8], out: &mut Vec<u8>) -> Result<(), VlessError> {
    if payload.len() > MAX_DATAGRAM {
        return Err(VlessError::DatagramTooLarge(payload.len()));
    }
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Incremental decoder for the inverse direction
#[derive(Debug, Default)]
pub struct DatagramDecoder {
    buf: BytesMut,
}

impl DatagramDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk from the stream
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next whole datagram, if one is buffered.
    ///
    /// Zero-length datagrams are legal and yielded as empty vectors.
    pub fn next(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        self.buf.advance(2);
        let payload = self.buf.split_to(len);
        Some(payload.to_vec())
    }

    /// Bytes buffered but not yet yielded
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Check stream end: a clean EOF must not land inside a frame.
    ///
    /// # Errors
    ///
    /// Returns `VlessError::TruncatedDatagram` when a partial frame
    /// remains buffered.
    pub fn finish(&self) -> Result<(), VlessError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let expected = if self.buf.len() >= 2 {
            u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize
        } else {
            0
        };
        Err(VlessError::TruncatedDatagram {
            expected,
            got: self.buf.len().saturating_sub(2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let payloads: Vec<Vec<u8>> = vec![
            b"hello".to_vec(),
            Vec::new(),
            vec![0xAB; 1500],
            b"x".to_vec(),
        ];
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend_from_slice(&encode_datagram(p).unwrap());
        }

        let mut decoder = DatagramDecoder::new();
        decoder.push(&stream);
        for p in &payloads {
            assert_eq!(decoder.next().unwrap(), *p);
        }
        assert!(decoder.next().is_none());
        decoder.finish().unwrap();
    }

    #[test]
    fn test_partial_prefix_recoverable() {
        let frame = encode_datagram(b"datagram").unwrap();
        let mut decoder = DatagramDecoder::new();

        // One byte at a time
        for &b in &frame[..frame.len() - 1] {
            decoder.push(&[b]);
            assert!(decoder.next().is_none());
        }
        decoder.push(&[frame[frame.len() - 1]]);
        assert_eq!(decoder.next().unwrap(), b"datagram");
    }

    #[test]
    fn test_split_across_chunks() {
        let a = encode_datagram(b"first").unwrap();
        let b = encode_datagram(b"second").unwrap();
        let mut stream = a;
        stream.extend_from_slice(&b);

        let mut decoder = DatagramDecoder::new();
        let (left, right) = stream.split_at(4);
        decoder.push(left);
        assert!(decoder.next().is_none());
        decoder.push(right);
        assert_eq!(decoder.next().unwrap(), b"first");
        assert_eq!(decoder.next().unwrap(), b"second");
    }

    #[test]
    fn test_too_large_rejected() {
        let payload = vec![0u8; MAX_DATAGRAM + 1];
        assert!(matches!(
            encode_datagram(&payload),
            Err(VlessError::DatagramTooLarge(_))
        ));
        // At the limit is fine
        assert!(encode_datagram(&vec![0u8; MAX_DATAGRAM]).is_ok());
    }

    #[test]
    fn test_truncated_on_finish() {
        let frame = encode_datagram(b"abc").unwrap();
        let mut decoder = DatagramDecoder::new();
        decoder.push(&frame[..3]);
        assert!(decoder.next().is_none());
        assert!(matches!(
            decoder.finish(),
            Err(VlessError::TruncatedDatagram { expected: 3, got: 1 })
        ));
    }
}
