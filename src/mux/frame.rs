//! Mux wire frames
//!
//! Every frame is a 4-byte header followed by the stream id and payload:
//!
//! ```text
//! +------+----------+--------+-----------+---------+
//! | kind | reserved | length | stream_id | payload |
//! +------+----------+--------+-----------+---------+
//! |  1B  |    1B    | 2B BE  |   2B BE   |   var   |
//! +------+----------+--------+-----------+---------+
//! ```
//!
//! `length` counts the stream id plus the payload. Kinds:
//!
//! | kind | name | payload |
//! |---|---|---|
//! | 0x01 | New | `network | port | atyp | addr | [global_id 8]` |
//! | 0x02 | Keep | raw data (length-prefixed datagrams for UDP) |
//! | 0x03 | End | `err:u8` |
//! | 0x04 | KeepAlive | empty, stream id 0 |

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BytesMut};

use super::error::MuxError;
use crate::vless::{address_type, VlessAddress};

pub const KIND_NEW: u8 = 0x01;
pub const KIND_KEEP: u8 = 0x02;
pub const KIND_END: u8 = 0x03;
pub const KIND_KEEPALIVE: u8 = 0x04;

/// Network of a `New` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxNetwork {
    Tcp = 0x01,
    Udp = 0x02,
}

impl MuxNetwork {
    fn from_byte(b: u8) -> Result<Self, MuxError> {
        match b {
            0x01 => Ok(Self::Tcp),
            0x02 => Ok(Self::Udp),
            other => Err(MuxError::invalid_frame(format!("bad network {other:#04x}"))),
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxFrame {
    New {
        stream_id: u16,
        network: MuxNetwork,
        port: u16,
        address: VlessAddress,
        global_id: Option<[u8; 8]>,
    },
    Keep {
        stream_id: u16,
        payload: Vec<u8>,
    },
    End {
        stream_id: u16,
        error: u8,
    },
    KeepAlive,
}

impl MuxFrame {
    /// Encode to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `MuxError` when the payload exceeds the u16 length field
    /// or the address fails to encode.
    pub fn encode(&self) -> Result<Vec<u8>, MuxError> {
        let (kind, stream_id, payload) = match self {
            Self::New {
                stream_id,
                network,
                port,
                address,
                global_id,
            } => {
                let mut p = Vec::with_capacity(4 + address.encoded_len() + 8);
                p.push(*network as u8);
                p.extend_from_slice(&port.to_be_bytes());
                address
                    .encode_into(&mut p)
                    .map_err(|e| MuxError::invalid_frame(e.to_string()))?;
                if let Some(id) = global_id {
                    p.extend_from_slice(id);
                }
                (KIND_NEW, *stream_id, p)
            }
            Self::Keep { stream_id, payload } => (KIND_KEEP, *stream_id, payload.clone()),
            Self::End { stream_id, error } => (KIND_END, *stream_id, vec![*error]),
            Self::KeepAlive => (KIND_KEEPALIVE, 0, Vec::new()),
        };

        let length = 2 + payload.len();
        if length > u16::MAX as usize {
            return Err(MuxError::invalid_frame(format!(
                "payload too large: {} bytes",
                payload.len()
            )));
        }

        let mut out = Vec::with_capacity(4 + length);
        out.push(kind);
        out.push(0); // reserved
        out.extend_from_slice(&(length as u16).to_be_bytes());
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Stream id this frame addresses (0 for keepalive)
    #[must_use]
    pub fn stream_id(&self) -> u16 {
        match self {
            Self::New { stream_id, .. }
            | Self::Keep { stream_id, .. }
            | Self::End { stream_id, .. } => *stream_id,
            Self::KeepAlive => 0,
        }
    }
}

/// Synchronous address parse for `New` payloads
fn parse_address(payload: &[u8]) -> Result<(VlessAddress, usize), MuxError> {
    let atyp = *payload
        .first()
        .ok_or_else(|| MuxError::invalid_frame("missing address type"))?;
    match atyp {
        address_type::IPV4 => {
            let octets: [u8; 4] = payload
                .get(1..5)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| MuxError::invalid_frame("truncated IPv4"))?;
            Ok((VlessAddress::Ipv4(Ipv4Addr::from(octets)), 5))
        }
        address_type::DOMAIN => {
            let len = *payload
                .get(1)
                .ok_or_else(|| MuxError::invalid_frame("missing domain length"))?
                as usize;
            if len == 0 {
                return Err(MuxError::invalid_frame("empty domain"));
            }
            let bytes = payload
                .get(2..2 + len)
                .ok_or_else(|| MuxError::invalid_frame("truncated domain"))?;
            let domain = String::from_utf8(bytes.to_vec())
                .map_err(|e| MuxError::invalid_frame(format!("bad domain encoding: {e}")))?;
            Ok((VlessAddress::Domain(domain), 2 + len))
        }
        address_type::IPV6 => {
            let octets: [u8; 16] = payload
                .get(1..17)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| MuxError::invalid_frame("truncated IPv6"))?;
            Ok((VlessAddress::Ipv6(Ipv6Addr::from(octets)), 17))
        }
        other => Err(MuxError::invalid_frame(format!(
            "bad address type {other:#04x}"
        ))),
    }
}

fn decode_payload(kind: u8, stream_id: u16, payload: &[u8]) -> Result<MuxFrame, MuxError> {
    match kind {
        KIND_NEW => {
            if payload.len() < 3 {
                return Err(MuxError::invalid_frame("short New payload"));
            }
            let network = MuxNetwork::from_byte(payload[0])?;
            let port = u16::from_be_bytes([payload[1], payload[2]]);
            let (address, consumed) = parse_address(&payload[3..])?;
            let rest = &payload[3 + consumed..];
            let global_id = match rest.len() {
                0 => None,
                8 => Some(rest.try_into().expect("length checked")),
                n => {
                    return Err(MuxError::invalid_frame(format!(
                        "unexpected {n} trailing bytes in New"
                    )));
                }
            };
            Ok(MuxFrame::New {
                stream_id,
                network,
                port,
                address,
                global_id,
            })
        }
        KIND_KEEP => Ok(MuxFrame::Keep {
            stream_id,
            payload: payload.to_vec(),
        }),
        KIND_END => {
            let error = payload.first().copied().unwrap_or(0);
            Ok(MuxFrame::End { stream_id, error })
        }
        KIND_KEEPALIVE => Ok(MuxFrame::KeepAlive),
        other => Err(MuxError::invalid_frame(format!("bad kind {other:#04x}"))),
    }
}

/// Incremental frame decoder over the carrier stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next whole frame.
    ///
    /// # Errors
    ///
    /// A malformed frame is fatal to the whole mux client; the caller
    /// tears down every session.
    pub fn next(&mut self) -> Result<Option<MuxFrame>, MuxError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let kind = self.buf[0];
        let length = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        if length < 2 {
            return Err(MuxError::invalid_frame("length shorter than stream id"));
        }
        if self.buf.len() < 4 + length {
            return Ok(None);
        }
        let stream_id = u16::from_be_bytes([self.buf[4], self.buf[5]]);
        let payload = self.buf[6..4 + length].to_vec();
        self.buf.advance(4 + length);
        decode_payload(kind, stream_id, &payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_kinds() {
        let frames = vec![
            MuxFrame::New {
                stream_id: 1,
                network: MuxNetwork::Tcp,
                port: 443,
                address: VlessAddress::domain("example.com"),
                global_id: None,
            },
            MuxFrame::New {
                stream_id: 2,
                network: MuxNetwork::Udp,
                port: 53,
                address: VlessAddress::ip("8.8.8.8".parse().unwrap()),
                global_id: Some([1, 2, 3, 4, 5, 6, 7, 8]),
            },
            MuxFrame::Keep {
                stream_id: 1,
                payload: b"data chunk".to_vec(),
            },
            MuxFrame::End {
                stream_id: 2,
                error: 0,
            },
            MuxFrame::KeepAlive,
            MuxFrame::New {
                stream_id: 3,
                network: MuxNetwork::Udp,
                port: 8443,
                address: VlessAddress::ip("2001:db8::7".parse().unwrap()),
                global_id: None,
            },
        ];

        let mut wire = Vec::new();
        for f in &frames {
            wire.extend_from_slice(&f.encode().unwrap());
        }

        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        for expected in &frames {
            let got = decoder.next().unwrap().unwrap();
            assert_eq!(&got, expected);
        }
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn test_wire_layout() {
        let frame = MuxFrame::Keep {
            stream_id: 0x0102,
            payload: vec![0xAA, 0xBB],
        };
        let wire = frame.encode().unwrap();
        assert_eq!(wire, vec![0x02, 0x00, 0x00, 0x04, 0x01, 0x02, 0xAA, 0xBB]);

        let keepalive = MuxFrame::KeepAlive.encode().unwrap();
        assert_eq!(keepalive, vec![0x04, 0x00, 0x00, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_incremental_decode() {
        let frame = MuxFrame::Keep {
            stream_id: 7,
            payload: vec![1, 2, 3, 4, 5],
        };
        let wire = frame.encode().unwrap();
        let mut decoder = FrameDecoder::new();
        for &b in &wire[..wire.len() - 1] {
            decoder.push(&[b]);
            assert!(decoder.next().unwrap().is_none());
        }
        decoder.push(&[wire[wire.len() - 1]]);
        assert_eq!(decoder.next().unwrap().unwrap(), frame);
    }

    #[test]
    fn test_invalid_frames() {
        // Unknown kind
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0x09, 0, 0, 2, 0, 1]);
        assert!(decoder.next().is_err());

        // Length below stream id size
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0x02, 0, 0, 1, 0]);
        assert!(decoder.next().is_err());

        // New with trailing garbage
        let mut good = MuxFrame::New {
            stream_id: 1,
            network: MuxNetwork::Tcp,
            port: 80,
            address: VlessAddress::ip("1.2.3.4".parse().unwrap()),
            global_id: None,
        }
        .encode()
        .unwrap();
        good.extend_from_slice(&[0xFF; 3]);
        let len = u16::from_be_bytes([good[2], good[3]]) + 3;
        good[2..4].copy_from_slice(&len.to_be_bytes());
        let mut decoder = FrameDecoder::new();
        decoder.push(&good);
        assert!(decoder.next().is_err());
    }

    #[test]
    fn test_end_error_code() {
        let frame = MuxFrame::End {
            stream_id: 5,
            error: 2,
        };
        let wire = frame.encode().unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        match decoder.next().unwrap().unwrap() {
            MuxFrame::End { stream_id, error } => {
                assert_eq!(stream_id, 5);
                assert_eq!(error, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
