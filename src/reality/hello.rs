//! ClientHello construction and ServerHello parsing
//!
//! The ClientHello is assembled byte by byte from a fingerprint profile;
//! given the same randoms and key share it is bit-identical between runs.
//! The ServerHello scan walks handshake records, extracts the chosen
//! cipher suite and the x25519 key share, and reports how many input
//! bytes the record(s) consumed so the caller can continue with the
//! encrypted flight.

use super::fingerprint::{grease_value, ExtensionKind, FingerprintProfile};

/// Extension type codes
mod ext {
    pub const SERVER_NAME: u16 = 0x0000;
    pub const STATUS_REQUEST: u16 = 0x0005;
    pub const SUPPORTED_GROUPS: u16 = 0x000a;
    pub const EC_POINT_FORMATS: u16 = 0x000b;
    pub const SIGNATURE_ALGORITHMS: u16 = 0x000d;
    pub const ALPN: u16 = 0x0010;
    pub const SIGNED_CERT_TIMESTAMP: u16 = 0x0012;
    pub const EXTENDED_MASTER_SECRET: u16 = 0x0017;
    pub const COMPRESS_CERTIFICATE: u16 = 0x001b;
    pub const SESSION_TICKET: u16 = 0x0023;
    pub const PSK_KEY_EXCHANGE_MODES: u16 = 0x002d;
    pub const SUPPORTED_VERSIONS: u16 = 0x002b;
    pub const KEY_SHARE: u16 = 0x0033;
    pub const RENEGOTIATION_INFO: u16 = 0xff01;
}

/// x25519 named group
pub const GROUP_X25519: u16 = 0x001d;

const SIGNATURE_ALGORITHMS_LIST: [u16; 8] = [
    0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
];

/// Inputs to the hello builder
#[derive(Debug)]
pub struct HelloParams<'a> {
    pub server_name: &'a str,
    pub alpn: &'a [String],
    /// 24 random bytes followed by the 8-byte authenticator
    pub client_random: [u8; 32],
    pub session_id: [u8; 32],
    pub key_share_public: [u8; 32],
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn push_extension(buf: &mut Vec<u8>, ext_type: u16, body: &[u8]) {
    push_u16(buf, ext_type);
    push_u16(buf, body.len() as u16);
    buf.extend_from_slice(body);
}

fn encode_extension(
    kind: ExtensionKind,
    profile: &FingerprintProfile,
    params: &HelloParams<'_>,
    out: &mut Vec<u8>,
) {
    let seed = params.client_random[0];
    match kind {
        ExtensionKind::Grease(slot) => {
            // First GREASE is empty, the trailing one carries one byte,
            // matching the Chromium shape
            let body: &[u8] = if slot == 0 { &[] } else { &[0x00] };
            push_extension(out, grease_value(seed, slot), body);
        }
        ExtensionKind::ServerName => {
            let name = params.server_name.as_bytes();
            let mut body = Vec::with_capacity(5 + name.len());
            push_u16(&mut body, (3 + name.len()) as u16);
            body.push(0x00); // host_name
            push_u16(&mut body, name.len() as u16);
            body.extend_from_slice(name);
            push_extension(out, ext::SERVER_NAME, &body);
        }
        ExtensionKind::ExtendedMasterSecret => {
            push_extension(out, ext::EXTENDED_MASTER_SECRET, &[]);
        }
        ExtensionKind::RenegotiationInfo => {
            push_extension(out, ext::RENEGOTIATION_INFO, &[0x00]);
        }
        ExtensionKind::SupportedGroups => {
            let mut groups = Vec::new();
            if profile.grease {
                groups.push(grease_value(seed, 2));
            }
            groups.extend([GROUP_X25519, 0x0017, 0x0018]);
            let mut body = Vec::with_capacity(2 + groups.len() * 2);
            push_u16(&mut body, (groups.len() * 2) as u16);
            for g in groups {
                push_u16(&mut body, g);
            }
            push_extension(out, ext::SUPPORTED_GROUPS, &body);
        }
        ExtensionKind::EcPointFormats => {
            push_extension(out, ext::EC_POINT_FORMATS, &[0x01, 0x00]);
        }
        ExtensionKind::SessionTicket => {
            push_extension(out, ext::SESSION_TICKET, &[]);
        }
        ExtensionKind::Alpn => {
            if params.alpn.is_empty() {
                return;
            }
            let mut list = Vec::new();
            for proto in params.alpn {
                list.push(proto.len() as u8);
                list.extend_from_slice(proto.as_bytes());
            }
            let mut body = Vec::with_capacity(2 + list.len());
            push_u16(&mut body, list.len() as u16);
            body.extend_from_slice(&list);
            push_extension(out, ext::ALPN, &body);
        }
        ExtensionKind::StatusRequest => {
            // OCSP, empty responder list
            push_extension(out, ext::STATUS_REQUEST, &[0x01, 0x00, 0x00, 0x00, 0x00]);
        }
        ExtensionKind::SignatureAlgorithms => {
            let mut body = Vec::with_capacity(2 + SIGNATURE_ALGORITHMS_LIST.len() * 2);
            push_u16(&mut body, (SIGNATURE_ALGORITHMS_LIST.len() * 2) as u16);
            for alg in SIGNATURE_ALGORITHMS_LIST {
                push_u16(&mut body, alg);
            }
            push_extension(out, ext::SIGNATURE_ALGORITHMS, &body);
        }
        ExtensionKind::SignedCertTimestamp => {
            push_extension(out, ext::SIGNED_CERT_TIMESTAMP, &[]);
        }
        ExtensionKind::KeyShare => {
            let mut shares = Vec::new();
            if profile.grease {
                // One-byte GREASE share ahead of the real one
                push_u16(&mut shares, grease_value(seed, 2));
                push_u16(&mut shares, 1);
                shares.push(0x00);
            }
            push_u16(&mut shares, GROUP_X25519);
            push_u16(&mut shares, 32);
            shares.extend_from_slice(&params.key_share_public);

            let mut body = Vec::with_capacity(2 + shares.len());
            push_u16(&mut body, shares.len() as u16);
            body.extend_from_slice(&shares);
            push_extension(out, ext::KEY_SHARE, &body);
        }
        ExtensionKind::PskKeyExchangeModes => {
            // psk_dhe_ke
            push_extension(out, ext::PSK_KEY_EXCHANGE_MODES, &[0x01, 0x01]);
        }
        ExtensionKind::SupportedVersions => {
            let mut versions = Vec::new();
            if profile.grease {
                versions.push(grease_value(seed, 3));
            }
            versions.push(0x0304);
            let mut body = Vec::with_capacity(1 + versions.len() * 2);
            body.push((versions.len() * 2) as u8);
            for v in versions {
                push_u16(&mut body, v);
            }
            push_extension(out, ext::SUPPORTED_VERSIONS, &body);
        }
        ExtensionKind::CompressCertificate => {
            // brotli
            push_extension(out, ext::COMPRESS_CERTIFICATE, &[0x02, 0x00, 0x02]);
        }
    }
}

/// Build the full ClientHello record.
///
/// Returns `(record_bytes, handshake_body)`; the handshake body (without
/// the record header) seeds the transcript hash.
#[must_use]
pub fn build_client_hello(
    profile: &FingerprintProfile,
    params: &HelloParams<'_>,
) -> (Vec<u8>, Vec<u8>) {
    let seed = params.client_random[0];

    let mut body = Vec::with_capacity(512);
    // legacy_version TLS 1.2
    push_u16(&mut body, 0x0303);
    body.extend_from_slice(&params.client_random);
    body.push(32);
    body.extend_from_slice(&params.session_id);

    let mut suites = Vec::new();
    if profile.grease {
        suites.push(grease_value(seed, 4));
    }
    suites.extend_from_slice(&profile.cipher_suites);
    push_u16(&mut body, (suites.len() * 2) as u16);
    for s in suites {
        push_u16(&mut body, s);
    }

    // compression: null only
    body.push(1);
    body.push(0);

    let mut extensions = Vec::with_capacity(512);
    for kind in &profile.extensions {
        encode_extension(*kind, profile, params, &mut extensions);
    }
    push_u16(&mut body, extensions.len() as u16);
    body.extend_from_slice(&extensions);

    // Handshake header: ClientHello, 24-bit length
    let mut handshake = Vec::with_capacity(4 + body.len());
    handshake.push(0x01);
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    // Record header: handshake, legacy TLS 1.2 version
    let mut record = Vec::with_capacity(5 + handshake.len());
    record.push(0x16);
    push_u16(&mut record, 0x0303);
    push_u16(&mut record, handshake.len() as u16);
    record.extend_from_slice(&handshake);

    (record, handshake)
}

/// Parsed ServerHello
#[derive(Debug)]
pub struct ServerHello {
    pub cipher_suite: u16,
    pub key_share: [u8; 32],
    /// The ServerHello handshake message (with its 4-byte header), for
    /// the transcript
    pub handshake: Vec<u8>,
    /// Input bytes consumed through the end of the ServerHello record
    pub consumed: usize,
}

/// Scan buffered input for the ServerHello.
///
/// Walks plaintext handshake records, skipping any that are not a
/// ServerHello, and extracts the cipher suite plus the x25519 key share.
/// Returns `None` while the input is incomplete or when no usable
/// ServerHello exists in the buffered records.
#[must_use]
pub fn parse_server_hello(data: &[u8]) -> Option<ServerHello> {
    let mut offset = 0;
    while offset + 5 <= data.len() {
        let content_type = data[offset];
        if content_type != 0x16 {
            return None;
        }
        let record_len =
            u16::from_be_bytes([data[offset + 3], data[offset + 4]]) as usize;
        let record_start = offset + 5;
        let record_end = record_start + record_len;
        if record_end > data.len() {
            // Record not fully buffered yet
            return None;
        }
        let record = &data[record_start..record_end];
        if record.first() != Some(&0x02) {
            offset = record_end;
            continue;
        }

        // ServerHello: type(1) len(3) version(2) random(32)
        let mut p = 1 + 3 + 2 + 32;
        // legacy_session_id_echo
        let session_len = *record.get(p)? as usize;
        p += 1 + session_len;
        let cipher_suite = u16::from_be_bytes([*record.get(p)?, *record.get(p + 1)?]);
        // cipher suite + compression method
        p += 3;

        let ext_len = u16::from_be_bytes([*record.get(p)?, *record.get(p + 1)?]) as usize;
        p += 2;
        let ext_end = p + ext_len;
        if ext_end > record.len() {
            return None;
        }

        while p + 4 <= ext_end {
            let ext_type = u16::from_be_bytes([record[p], record[p + 1]]);
            let ext_data_len = u16::from_be_bytes([record[p + 2], record[p + 3]]) as usize;
            p += 4;
            if ext_type == ext::KEY_SHARE {
                if p + 4 > record.len() {
                    return None;
                }
                let group = u16::from_be_bytes([record[p], record[p + 1]]);
                let key_len = u16::from_be_bytes([record[p + 2], record[p + 3]]) as usize;
                if group == GROUP_X25519 && key_len == 32 {
                    let key = record.get(p + 4..p + 36)?;
                    return Some(ServerHello {
                        cipher_suite,
                        key_share: key.try_into().ok()?,
                        handshake: record.to_vec(),
                        consumed: record_end,
                    });
                }
            }
            p += ext_data_len;
        }
        return None;
    }
    None
}
