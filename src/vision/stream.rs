//! Vision adaptive padding codec
//!
//! While the tunneled connection is in its (inner) TLS handshake, the
//! writer disguises traffic shape by wrapping application chunks in
//! padding frames:
//!
//! ```text
//! +---------+-------------+---------+---------+---------+
//! | command | content_len | pad_len | content | padding |
//! +---------+-------------+---------+---------+---------+
//! |   1B    |    2B BE    |  2B BE  |   var   |  zeros  |
//! +---------+-------------+---------+---------+---------+
//! ```
//!
//! Commands: `0` continue, `1` padding ends, `2` padding ends and the
//! stream goes direct. Chunks that are themselves TLS handshake or
//! change-cipher-spec records pass through unwrapped; the command byte
//! space (0..=2) and the TLS content-type space (20..=23) are disjoint,
//! which is what lets the reader restore boundaries.
//!
//! The schedule comes from the seed `[content_threshold, long_max,
//! long_base, short_max]`: each padded chunk takes a short random pad and
//! decrements the threshold; at zero one long pad
//! (`long_base + uniform(0, long_max)`) is emitted and padding stops for
//! that direction. The reader flips to direct copy on an end command or
//! on sniffing the first inbound application-data record (the server's
//! post-Finished traffic), whichever comes first.

use bytes::{Buf, BytesMut};
use rand::Rng;

use super::detector::{
    is_handshake_or_ccs, parse_tls_record_header, TLS_APPLICATION_DATA, TLS_RECORD_HEADER_SIZE,
};
use super::error::VisionError;
use crate::config::VisionSeed;

const FRAME_HEADER: usize = 5;

/// Largest content slice carried by a single frame
const MAX_FRAME_CONTENT: usize = u16::MAX as usize;

const COMMAND_CONTINUE: u8 = 0;
const COMMAND_PADDING_END: u8 = 1;
const COMMAND_DIRECT: u8 = 2;

/// Outbound padding state for one direction
#[derive(Debug)]
pub struct VisionWriter {
    content_remaining: u32,
    long_max: u32,
    long_base: u32,
    short_max: u32,
    direct: bool,
}

impl VisionWriter {
    #[must_use]
    pub fn new(seed: VisionSeed) -> Self {
        Self {
            content_remaining: seed.content_threshold,
            long_max: seed.long_max,
            long_base: seed.long_base,
            short_max: seed.short_max,
            direct: false,
        }
    }

    /// True once padding has ended and chunks pass through untouched
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Seal one outbound chunk.
    ///
    /// Returns the bytes to write to the transport. In direct mode, and
    /// for handshake/CCS records, this is the chunk itself.
    pub fn seal(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.seal_with_rng(chunk, &mut rand::thread_rng())
    }

    /// Seal with an explicit RNG; tests pass a seeded generator.
    pub fn seal_with_rng<R: Rng>(&mut self, chunk: &[u8], rng: &mut R) -> Vec<u8> {
        if self.direct || is_handshake_or_ccs(chunk) {
            return chunk.to_vec();
        }

        let mut out = Vec::with_capacity(chunk.len() + FRAME_HEADER + 64);
        let mut rest = chunk;
        loop {
            let take = rest.len().min(MAX_FRAME_CONTENT);
            let (content, remainder) = rest.split_at(take);
            let last_slice = remainder.is_empty();

            let (command, pad_len) = if self.content_remaining > 0 {
                self.content_remaining -= 1;
                (COMMAND_CONTINUE, rng.gen_range(0..=self.short_max))
            } else {
                // Threshold exhausted: one long pad, then direct
                self.direct = true;
                let pad = self.long_base + rng.gen_range(0..=self.long_max);
                (COMMAND_DIRECT, pad)
            };
            // Padding rides inside the u16 length field
            let pad_len = pad_len.min(u16::MAX as u32) as u16;

            out.push(command);
            out.extend_from_slice(&(content.len() as u16).to_be_bytes());
            out.extend_from_slice(&pad_len.to_be_bytes());
            out.extend_from_slice(content);
            out.extend(std::iter::repeat(0u8).take(pad_len as usize));

            if last_slice || self.direct {
                if self.direct && !last_slice {
                    // Padding ended mid-chunk: the rest goes out raw
                    out.extend_from_slice(remainder);
                }
                break;
            }
            rest = remainder;
        }
        out
    }
}

/// Inbound unpadding state for one direction
#[derive(Debug, Default)]
pub struct VisionReader {
    buf: BytesMut,
    direct: bool,
}

impl VisionReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the stream passed its transcript point
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Feed transport bytes; whole content is appended to `out`.
    ///
    /// Partial frames stay buffered until the next call.
    ///
    /// # Errors
    ///
    /// Returns `VisionError::Desync` when the stream lines up with
    /// neither a padding frame nor a TLS record.
    pub fn open(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<(), VisionError> {
        if self.direct && self.buf.is_empty() {
            out.extend_from_slice(chunk);
            return Ok(());
        }
        self.buf.extend_from_slice(chunk);

        loop {
            if self.direct {
                out.extend_from_slice(&self.buf);
                self.buf.clear();
                return Ok(());
            }
            if self.buf.is_empty() {
                return Ok(());
            }

            let first = self.buf[0];
            match first {
                COMMAND_CONTINUE | COMMAND_PADDING_END | COMMAND_DIRECT => {
                    if self.buf.len() < FRAME_HEADER {
                        return Ok(());
                    }
                    let content_len =
                        u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
                    let pad_len = u16::from_be_bytes([self.buf[3], self.buf[4]]) as usize;
                    let total = FRAME_HEADER + content_len + pad_len;
                    if self.buf.len() < total {
                        return Ok(());
                    }
                    out.extend_from_slice(&self.buf[FRAME_HEADER..FRAME_HEADER + content_len]);
                    self.buf.advance(total);
                    if first != COMMAND_CONTINUE {
                        self.direct = true;
                    }
                }
                _ => {
                    // Expect a raw TLS record (handshake, CCS or the first
                    // application data of the tunneled connection)
                    if self.buf.len() < TLS_RECORD_HEADER_SIZE {
                        return Ok(());
                    }
                    let Some((content_type, record_len)) =
                        parse_tls_record_header(&self.buf)
                    else {
                        return Err(VisionError::desync(format!(
                            "unexpected byte {first:#04x} at frame boundary"
                        )));
                    };
                    let total = TLS_RECORD_HEADER_SIZE + record_len as usize;
                    if self.buf.len() < total {
                        return Ok(());
                    }
                    out.extend_from_slice(&self.buf[..total]);
                    self.buf.advance(total);
                    if content_type == TLS_APPLICATION_DATA {
                        // Transcript point: everything after is raw
                        self.direct = true;
                    }
                }
            }
        }
    }
}

/// Both directions of the Vision state for one connection
#[derive(Debug)]
pub struct VisionState {
    pub writer: VisionWriter,
    pub reader: VisionReader,
}

impl VisionState {
    #[must_use]
    pub fn new(seed: VisionSeed) -> Self {
        Self {
            writer: VisionWriter::new(seed),
            reader: VisionReader::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn tls_record(content_type: u8, len: usize) -> Vec<u8> {
        let mut r = vec![content_type, 0x03, 0x03];
        r.extend_from_slice(&(len as u16).to_be_bytes());
        r.extend((0..len).map(|i| i as u8));
        r
    }

    fn seed(content_threshold: u32) -> VisionSeed {
        VisionSeed {
            content_threshold,
            ..VisionSeed::default()
        }
    }

    #[test]
    fn test_handshake_records_pass_unwrapped() {
        let mut writer = VisionWriter::new(seed(900));
        let record = tls_record(0x16, 50);
        assert_eq!(writer.seal(&record), record);
        let ccs = tls_record(0x14, 1);
        assert_eq!(writer.seal(&ccs), ccs);
        assert!(!writer.is_direct());
    }

    #[test]
    fn test_short_padding_then_long_padding() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut writer = VisionWriter::new(seed(2));

        // Two chunks take short padding
        let sealed = writer.seal_with_rng(b"one", &mut rng);
        assert_eq!(sealed[0], COMMAND_CONTINUE);
        let pad = u16::from_be_bytes([sealed[3], sealed[4]]) as u32;
        assert!(pad <= 256);
        assert!(!writer.is_direct());

        let _ = writer.seal_with_rng(b"two", &mut rng);
        assert!(!writer.is_direct());

        // Third chunk exhausts the threshold: long pad, direct command
        let sealed = writer.seal_with_rng(b"three", &mut rng);
        assert_eq!(sealed[0], COMMAND_DIRECT);
        let pad = u16::from_be_bytes([sealed[3], sealed[4]]) as u32;
        assert!((900..=1400).contains(&pad));
        assert!(writer.is_direct());

        // Afterwards chunks are untouched
        assert_eq!(writer.seal_with_rng(b"raw", &mut rng), b"raw");
    }

    #[test]
    fn test_roundtrip_through_reader() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut writer = VisionWriter::new(seed(3));
        let mut reader = VisionReader::new();

        let chunks: &[&[u8]] = &[b"alpha", b"beta", b"gamma", b"delta", b"epsilon"];
        let mut wire = Vec::new();
        for c in chunks {
            wire.extend_from_slice(&writer.seal_with_rng(c, &mut rng));
        }

        let mut out = Vec::new();
        reader.open(&wire, &mut out).unwrap();
        let expected: Vec<u8> = chunks.concat();
        assert_eq!(out, expected);
        assert!(reader.is_direct());
    }

    #[test]
    fn test_roundtrip_byte_at_a_time() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut writer = VisionWriter::new(seed(1));
        let mut reader = VisionReader::new();

        let mut wire = Vec::new();
        wire.extend_from_slice(&writer.seal_with_rng(b"first", &mut rng));
        wire.extend_from_slice(&writer.seal_with_rng(b"second goes long", &mut rng));
        wire.extend_from_slice(&writer.seal_with_rng(b"direct now", &mut rng));

        let mut out = Vec::new();
        for b in wire {
            reader.open(&[b], &mut out).unwrap();
        }
        assert_eq!(out, b"firstsecond goes longdirect now");
    }

    #[test]
    fn test_reader_passes_tls_records_and_sniffs_appdata() {
        let mut reader = VisionReader::new();
        let mut out = Vec::new();

        // Handshake record passes through intact, no direct flip
        let hs = tls_record(0x16, 40);
        reader.open(&hs, &mut out).unwrap();
        assert_eq!(out, hs);
        assert!(!reader.is_direct());

        // First application-data record flips to direct
        let app = tls_record(0x17, 20);
        reader.open(&app, &mut out).unwrap();
        assert!(reader.is_direct());

        // Subsequent arbitrary bytes pass through
        reader.open(b"\x00\x01\x02raw", &mut out).unwrap();
        let mut expected = hs.clone();
        expected.extend_from_slice(&app);
        expected.extend_from_slice(b"\x00\x01\x02raw");
        assert_eq!(out, expected);
    }

    #[test]
    fn test_reader_desync() {
        let mut reader = VisionReader::new();
        let mut out = Vec::new();
        // 0x42 is neither a command nor a TLS content type
        assert!(reader.open(&[0x42, 0, 0, 0, 0], &mut out).is_err());
    }

    #[test]
    fn test_zero_threshold_goes_long_immediately() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut writer = VisionWriter::new(seed(0));
        let sealed = writer.seal_with_rng(b"data", &mut rng);
        assert_eq!(sealed[0], COMMAND_DIRECT);
        assert!(writer.is_direct());
    }

    #[test]
    fn test_large_chunk_splits_frames() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut writer = VisionWriter::new(seed(10));
        let mut reader = VisionReader::new();

        let big = vec![0xA5u8; MAX_FRAME_CONTENT + 1000];
        let wire = writer.seal_with_rng(&big, &mut rng);
        let mut out = Vec::new();
        reader.open(&wire, &mut out).unwrap();
        assert_eq!(out, big);
    }

    #[test]
    fn test_schedule_is_per_direction() {
        // The reader has no counter of its own; it follows the frames.
        // Seal with one seed, open with a reader fresh from another: the
        // content must still round-trip because frames are self-describing.
        let mut rng = StdRng::seed_from_u64(3);
        let mut writer = VisionWriter::new(seed(2));
        let mut reader = VisionReader::new();
        let mut out = Vec::new();
        for chunk in [&b"a"[..], b"b", b"c", b"d"] {
            let wire = writer.seal_with_rng(chunk, &mut rng);
            reader.open(&wire, &mut out).unwrap();
        }
        assert_eq!(out, b"abcd");
    }
}
