//! Browser ClientHello fingerprints
//!
//! Each tag fixes the cipher list, the extension order and the GREASE
//! placement, so that the same randoms and key material always produce
//! the same ClientHello bytes. That determinism is how the peer
//! recognizes the emulated client.

use crate::config::Fingerprint;

/// Extension slots in emission order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    /// GREASE extension; the slot index selects the reserved value
    Grease(u8),
    ServerName,
    ExtendedMasterSecret,
    RenegotiationInfo,
    SupportedGroups,
    EcPointFormats,
    SessionTicket,
    Alpn,
    StatusRequest,
    SignatureAlgorithms,
    SignedCertTimestamp,
    KeyShare,
    PskKeyExchangeModes,
    SupportedVersions,
    CompressCertificate,
}

/// Concrete ClientHello layout for one browser
#[derive(Debug, Clone)]
pub struct FingerprintProfile {
    /// The resolved tag (never `Random`)
    pub tag: Fingerprint,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<ExtensionKind>,
    /// Whether GREASE values appear in cipher list, groups and versions
    pub grease: bool,
}

/// Reserved GREASE values are `0x?a?a` with equal nibbles
#[must_use]
pub fn grease_value(seed_byte: u8, slot: u8) -> u16 {
    // Distinct slots must yield distinct values, both derived from the
    // client random so the hello stays deterministic
    let n = (seed_byte >> 4).wrapping_add(slot.wrapping_mul(3)) & 0x0F;
    let b = (n << 4) | 0x0A;
    u16::from_be_bytes([b, b])
}

const TLS13_SUITES: [u16; 3] = [0x1301, 0x1302, 0x1303];

fn chrome_suites() -> Vec<u16> {
    let mut v = TLS13_SUITES.to_vec();
    v.extend([
        0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014, 0x009c, 0x009d,
        0x002f, 0x0035,
    ]);
    v
}

fn firefox_suites() -> Vec<u16> {
    let mut v = TLS13_SUITES.to_vec();
    v.extend([
        0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc013, 0xc014, 0x009c, 0x009d,
        0x002f, 0x0035, 0x000a,
    ]);
    v
}

fn safari_suites() -> Vec<u16> {
    let mut v = TLS13_SUITES.to_vec();
    v.extend([
        0xc02c, 0xc02b, 0xcca9, 0xc030, 0xc02f, 0xcca8, 0xc024, 0xc023, 0xc00a, 0xc009,
        0xc028, 0xc027, 0xc014, 0xc013, 0x009d, 0x009c, 0x003d, 0x003c, 0x0035, 0x002f,
    ]);
    v
}

impl FingerprintProfile {
    /// Resolve a fingerprint tag; `Random` picks a concrete browser from
    /// the seed byte (usually the first byte of the client random).
    #[must_use]
    pub fn resolve(tag: Fingerprint, seed_byte: u8) -> Self {
        let tag = match tag {
            Fingerprint::Random => match seed_byte % 5 {
                0 => Fingerprint::Chrome120,
                1 => Fingerprint::Firefox,
                2 => Fingerprint::Safari,
                3 => Fingerprint::Edge,
                _ => Fingerprint::Ios,
            },
            t => t,
        };

        match tag {
            // Edge shares the Chromium layout
            Fingerprint::Chrome120 | Fingerprint::Edge => Self {
                tag,
                cipher_suites: chrome_suites(),
                extensions: vec![
                    ExtensionKind::Grease(0),
                    ExtensionKind::ServerName,
                    ExtensionKind::ExtendedMasterSecret,
                    ExtensionKind::RenegotiationInfo,
                    ExtensionKind::SupportedGroups,
                    ExtensionKind::EcPointFormats,
                    ExtensionKind::SessionTicket,
                    ExtensionKind::Alpn,
                    ExtensionKind::StatusRequest,
                    ExtensionKind::SignatureAlgorithms,
                    ExtensionKind::SignedCertTimestamp,
                    ExtensionKind::KeyShare,
                    ExtensionKind::PskKeyExchangeModes,
                    ExtensionKind::SupportedVersions,
                    ExtensionKind::CompressCertificate,
                    ExtensionKind::Grease(1),
                ],
                grease: true,
            },
            Fingerprint::Firefox => Self {
                tag,
                cipher_suites: firefox_suites(),
                extensions: vec![
                    ExtensionKind::ServerName,
                    ExtensionKind::ExtendedMasterSecret,
                    ExtensionKind::RenegotiationInfo,
                    ExtensionKind::SupportedGroups,
                    ExtensionKind::EcPointFormats,
                    ExtensionKind::SessionTicket,
                    ExtensionKind::Alpn,
                    ExtensionKind::StatusRequest,
                    ExtensionKind::KeyShare,
                    ExtensionKind::SupportedVersions,
                    ExtensionKind::SignatureAlgorithms,
                    ExtensionKind::PskKeyExchangeModes,
                ],
                grease: false,
            },
            Fingerprint::Safari | Fingerprint::Ios => Self {
                tag,
                cipher_suites: safari_suites(),
                extensions: vec![
                    ExtensionKind::Grease(0),
                    ExtensionKind::ServerName,
                    ExtensionKind::ExtendedMasterSecret,
                    ExtensionKind::RenegotiationInfo,
                    ExtensionKind::SupportedGroups,
                    ExtensionKind::EcPointFormats,
                    ExtensionKind::Alpn,
                    ExtensionKind::StatusRequest,
                    ExtensionKind::SignatureAlgorithms,
                    ExtensionKind::SignedCertTimestamp,
                    ExtensionKind::KeyShare,
                    ExtensionKind::PskKeyExchangeModes,
                    ExtensionKind::SupportedVersions,
                    ExtensionKind::Grease(1),
                ],
                grease: true,
            },
            Fingerprint::Random => unreachable!("resolved above"),
        }
    }
}
