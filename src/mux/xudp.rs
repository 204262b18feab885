//! XUDP global IDs
//!
//! An 8-byte identifier derived from the flow's source endpoint. The
//! server maps `global_id -> outbound UDP socket`, which preserves the
//! mapping (full-cone NAT) even when the client's ephemeral port is
//! remapped mid-flow.

/// Fixed keyed-hash base key; both ends derive the same id space
pub const XUDP_BASE_KEY: [u8; 32] = [
    0x6e, 0x7f, 0x28, 0x33, 0x90, 0x1c, 0xad, 0x5b, 0x04, 0xe2, 0x77, 0x48, 0x9a, 0xb1, 0x3d,
    0xc6, 0x52, 0x0f, 0xee, 0x81, 0x2a, 0x95, 0x60, 0xd4, 0x1b, 0xf8, 0x47, 0x0c, 0xb9, 0x36,
    0xa3, 0x5e,
];

/// Derive the global ID for a source endpoint:
/// `blake3_keyed("udp:" + host + ":" + port)` truncated to 8 bytes.
#[must_use]
pub fn global_id(src_host: &str, src_port: u16) -> [u8; 8] {
    let input = format!("udp:{src_host}:{src_port}");
    let hash = blake3::keyed_hash(&XUDP_BASE_KEY, input.as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash.as_bytes()[..8]);
    out
}
