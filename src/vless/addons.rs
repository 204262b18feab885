//! VLESS addons (protobuf-like encoding)
//!
//! Addons ride between the UUID and the command byte as a length-prefixed
//! blob of protobuf-style fields:
//!
//! - field 1 (tag `0x0a`, length-delimited): the flow string
//! - field 2 (tag `0x12`, length-delimited): the 8-byte XUDP global ID
//!
//! A zero length byte means no addons; the flow `none` is encoded that
//! way rather than as an empty string.
//!
//! ```text
//! 0x12                      blob length (18)
//! 0x0a 0x10                 field 1, 16 bytes
//! "xtls-rprx-vision"
//! ```

use super::error::VlessError;

/// `xtls-rprx-vision` flow identifier
pub const FLOW_VISION: &str = "xtls-rprx-vision";

/// `xtls-rprx-vision-udp443` flow identifier
pub const FLOW_VISION_UDP443: &str = "xtls-rprx-vision-udp443";

const FLOW_FIELD_TAG: u8 = 0x0a;
const GLOBAL_ID_FIELD_TAG: u8 = 0x12;

/// Upper bound on the addons blob (one length byte on the wire)
const MAX_ADDONS_SIZE: usize = 255;

/// Parsed addons
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VlessAddons {
    /// Flow string; `None` encodes as an empty blob
    pub flow: Option<String>,
    /// XUDP global ID for full-cone UDP
    pub global_id: Option<[u8; 8]>,
}

impl VlessAddons {
    /// Empty addons
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Addons carrying only a flow string
    #[must_use]
    pub fn with_flow(flow: impl Into<String>) -> Self {
        Self {
            flow: Some(flow.into()),
            global_id: None,
        }
    }

    /// Addons carrying a flow string and an XUDP global ID
    #[must_use]
    pub fn with_flow_and_global_id(flow: impl Into<String>, global_id: [u8; 8]) -> Self {
        Self {
            flow: Some(flow.into()),
            global_id: Some(global_id),
        }
    }

    /// Addons carrying only an XUDP global ID
    #[must_use]
    pub fn with_global_id(global_id: [u8; 8]) -> Self {
        Self {
            flow: None,
            global_id: Some(global_id),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flow.is_none() && self.global_id.is_none()
    }

    #[must_use]
    pub fn is_vision(&self) -> bool {
        matches!(
            self.flow.as_deref(),
            Some(FLOW_VISION | FLOW_VISION_UDP443)
        )
    }

    /// Encode to the wire blob including the leading length byte.
    ///
    /// # Errors
    ///
    /// Returns `VlessError::AddonsEncode` when the blob would exceed one
    /// length byte.
    pub fn encode(&self) -> Result<Vec<u8>, VlessError> {
        if self.is_empty() {
            return Ok(vec![0]);
        }

        let mut payload = Vec::new();
        if let Some(flow) = &self.flow {
            if flow.len() > 127 {
                return Err(VlessError::addons_encode(format!(
                    "flow string too long: {} bytes",
                    flow.len()
                )));
            }
            payload.push(FLOW_FIELD_TAG);
            payload.push(flow.len() as u8);
            payload.extend_from_slice(flow.as_bytes());
        }
        if let Some(id) = &self.global_id {
            payload.push(GLOBAL_ID_FIELD_TAG);
            payload.push(8);
            payload.extend_from_slice(id);
        }

        if payload.len() > MAX_ADDONS_SIZE {
            return Err(VlessError::addons_encode(format!(
                "addons payload too large: {} bytes",
                payload.len()
            )));
        }

        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(payload.len() as u8);
        out.extend(payload);
        Ok(out)
    }

    /// Encoded length including the leading length byte
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let mut len = 1;
        if let Some(flow) = &self.flow {
            len += 2 + flow.len();
        }
        if self.global_id.is_some() {
            len += 2 + 8;
        }
        len
    }
}

/// Parse addons starting at the length byte.
///
/// Returns the addons and the number of bytes consumed. Unknown fields
/// are skipped by wire type so future peers stay compatible.
///
/// # Errors
///
/// Returns `VlessError::AddonsParse` for truncated or malformed blobs.
pub fn parse_addons(data: &[u8]) -> Result<(VlessAddons, usize), VlessError> {
    let Some(&length) = data.first() else {
        return Err(VlessError::addons_parse("empty addons data"));
    };
    let length = length as usize;
    if length == 0 {
        return Ok((VlessAddons::new(), 1));
    }
    let Some(payload) = data.get(1..=length) else {
        return Err(VlessError::addons_parse(format!(
            "addons truncated: expected {length} bytes, got {}",
            data.len().saturating_sub(1)
        )));
    };

    let mut addons = VlessAddons::new();
    let mut pos = 0;
    while pos < payload.len() {
        let tag = payload[pos];
        pos += 1;
        let field = tag >> 3;
        let wire_type = tag & 0x07;

        match (field, wire_type) {
            (1, 2) => {
                let (bytes, consumed) = read_length_delimited(&payload[pos..])?;
                addons.flow = Some(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|e| VlessError::addons_parse(format!("invalid UTF-8: {e}")))?,
                );
                pos += consumed;
            }
            (2, 2) => {
                let (bytes, consumed) = read_length_delimited(&payload[pos..])?;
                let id = <[u8; 8]>::try_from(bytes).map_err(|_| {
                    VlessError::addons_parse(format!(
                        "global id must be 8 bytes, got {}",
                        bytes.len()
                    ))
                })?;
                addons.global_id = Some(id);
                pos += consumed;
            }
            (_, 0) => {
                let (_, consumed) = read_varint(&payload[pos..])?;
                pos += consumed;
            }
            (_, 2) => {
                let (_, consumed) = read_length_delimited(&payload[pos..])?;
                pos += consumed;
            }
            (_, 1) => {
                if payload.len() < pos + 8 {
                    return Err(VlessError::addons_parse("truncated 64-bit field"));
                }
                pos += 8;
            }
            (_, 5) => {
                if payload.len() < pos + 4 {
                    return Err(VlessError::addons_parse("truncated 32-bit field"));
                }
                pos += 4;
            }
            (_, wt) => {
                return Err(VlessError::addons_parse(format!(
                    "unsupported wire type: {wt}"
                )));
            }
        }
    }

    Ok((addons, 1 + length))
}

fn read_length_delimited(data: &[u8]) -> Result<(&[u8], usize), VlessError> {
    let (len, varint_len) = read_varint(data)?;
    let len = len as usize;
    let end = varint_len + len;
    let bytes = data
        .get(varint_len..end)
        .ok_or_else(|| VlessError::addons_parse(format!("field truncated: need {len} bytes")))?;
    Ok((bytes, end))
}

fn read_varint(data: &[u8]) -> Result<(u64, usize), VlessError> {
    let mut result = 0u64;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 10 {
            return Err(VlessError::addons_parse("varint too long"));
        }
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }
    Err(VlessError::addons_parse("unterminated varint"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_roundtrip() {
        let addons = VlessAddons::new();
        let encoded = addons.encode().unwrap();
        assert_eq!(encoded, vec![0]);
        let (decoded, consumed) = parse_addons(&encoded).unwrap();
        assert_eq!(decoded, addons);
        assert_eq!(consumed, 1);
    }

    #[test]
    fn test_flow_wire_format() {
        let addons = VlessAddons::with_flow(FLOW_VISION);
        let encoded = addons.encode().unwrap();
        assert_eq!(encoded[0] as usize, encoded.len() - 1);
        assert_eq!(encoded[1], FLOW_FIELD_TAG);
        assert_eq!(encoded[2], 16);
        assert_eq!(&encoded[3..19], FLOW_VISION.as_bytes());
        assert_eq!(addons.encoded_len(), encoded.len());
    }

    #[test]
    fn test_flow_and_global_id_roundtrip() {
        let id = [1, 2, 3, 4, 5, 6, 7, 8];
        let addons = VlessAddons::with_flow_and_global_id(FLOW_VISION_UDP443, id);
        assert!(addons.is_vision());
        let encoded = addons.encode().unwrap();
        assert_eq!(addons.encoded_len(), encoded.len());
        let (decoded, consumed) = parse_addons(&encoded).unwrap();
        assert_eq!(decoded, addons);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_global_id_only() {
        let addons = VlessAddons::with_global_id([9; 8]);
        assert!(!addons.is_vision());
        let encoded = addons.encode().unwrap();
        let (decoded, _) = parse_addons(&encoded).unwrap();
        assert_eq!(decoded.global_id, Some([9; 8]));
        assert_eq!(decoded.flow, None);
    }

    #[test]
    fn test_unknown_fields_skipped() {
        // flow "x" followed by unknown varint field 7 and unknown
        // length-delimited field 9
        let payload = [
            FLOW_FIELD_TAG, 1, b'x', // field 1
            0x38, 0x2A, // field 7, varint 42
            0x4A, 0x02, 0xAB, 0xCD, // field 9, 2 bytes
        ];
        let mut data = vec![payload.len() as u8];
        data.extend_from_slice(&payload);
        let (addons, consumed) = parse_addons(&data).unwrap();
        assert_eq!(addons.flow.as_deref(), Some("x"));
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_addons(&[]).is_err());
        // Declared length beyond the buffer
        assert!(parse_addons(&[10, 1, 2]).is_err());
        // Global id with wrong length
        let data = [3, GLOBAL_ID_FIELD_TAG, 1, 0xFF];
        assert!(parse_addons(&data).is_err());
        // Truncated string field
        let data = [3, FLOW_FIELD_TAG, 5, b'a'];
        assert!(parse_addons(&data).is_err());
    }

    #[test]
    fn test_varint() {
        assert_eq!(read_varint(&[0x00]).unwrap(), (0, 1));
        assert_eq!(read_varint(&[0x7F]).unwrap(), (127, 1));
        assert_eq!(read_varint(&[0x80, 0x01]).unwrap(), (128, 2));
        assert!(read_varint(&[]).is_err());
        assert!(read_varint(&[0x80]).is_err());
    }
}
