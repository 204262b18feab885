//! VLESS wire protocol headers
//!
//! Request header, sent once after the transport is open:
//!
//! ```text
//! +---------+------+--------+---------+------+------+---------+
//! | version | uuid | addons | command | port | atyp | address |
//! +---------+------+--------+---------+------+------+---------+
//! |   1B=0  | 16B  |  var   |   1B    | 2B   | 1B   |  var    |
//! +---------+------+--------+---------+------+------+---------+
//! ```
//!
//! Response header, consumed exactly once at the start of the receive
//! stream: `version (1) | addons_len (1) | addons`.
//!
//! Address types: `0x01` IPv4 (4 bytes), `0x02` domain (length byte +
//! bytes), `0x03` IPv6 (16 bytes). Port precedes the address type, big
//! endian.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt};

use super::addons::{parse_addons, VlessAddons};
use super::error::VlessError;

/// Protocol version (always 0)
pub const VLESS_VERSION: u8 = 0;

/// Request command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VlessCommand {
    /// Stream relay
    Tcp = 0x01,
    /// Length-framed datagram relay
    Udp = 0x02,
}

impl VlessCommand {
    /// Decode a command byte.
    ///
    /// # Errors
    ///
    /// Returns `VlessError::InvalidCommand` outside {1, 2}.
    pub fn from_byte(b: u8) -> Result<Self, VlessError> {
        match b {
            0x01 => Ok(Self::Tcp),
            0x02 => Ok(Self::Udp),
            _ => Err(VlessError::InvalidCommand(b)),
        }
    }

    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Address type constants
pub mod address_type {
    pub const IPV4: u8 = 0x01;
    pub const DOMAIN: u8 = 0x02;
    pub const IPV6: u8 = 0x03;
}

/// Destination address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlessAddress {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl VlessAddress {
    /// Wrap an IP address
    #[must_use]
    pub fn ip(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::Ipv4(v4),
            IpAddr::V6(v6) => Self::Ipv6(v6),
        }
    }

    /// Wrap a domain name
    #[must_use]
    pub fn domain(name: impl Into<String>) -> Self {
        Self::Domain(name.into())
    }

    #[must_use]
    pub const fn address_type(&self) -> u8 {
        match self {
            Self::Ipv4(_) => address_type::IPV4,
            Self::Domain(_) => address_type::DOMAIN,
            Self::Ipv6(_) => address_type::IPV6,
        }
    }

    #[must_use]
    pub fn as_domain(&self) -> Option<&str> {
        match self {
            Self::Domain(d) => Some(d),
            _ => None,
        }
    }

    /// Append `atyp | address` to a buffer.
    ///
    /// # Errors
    ///
    /// Returns `VlessError` for empty or over-long domains.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), VlessError> {
        buf.push(self.address_type());
        match self {
            Self::Ipv4(ip) => buf.extend_from_slice(&ip.octets()),
            Self::Ipv6(ip) => buf.extend_from_slice(&ip.octets()),
            Self::Domain(domain) => {
                if domain.is_empty() {
                    return Err(VlessError::EmptyDomain);
                }
                if domain.len() > 255 {
                    return Err(VlessError::DomainTooLong(domain.len()));
                }
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        Ok(())
    }

    /// Encoded length including the type byte
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Ipv4(_) => 1 + 4,
            Self::Ipv6(_) => 1 + 16,
            Self::Domain(d) => 1 + 1 + d.len(),
        }
    }

    /// Read `atyp | address` from an async reader.
    ///
    /// # Errors
    ///
    /// Returns `VlessError` for unknown address types, empty domains or
    /// I/O failures.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, VlessError> {
        let atyp = reader.read_u8().await?;
        match atyp {
            address_type::IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                Ok(Self::Ipv4(Ipv4Addr::from(octets)))
            }
            address_type::DOMAIN => {
                let len = reader.read_u8().await? as usize;
                if len == 0 {
                    return Err(VlessError::EmptyDomain);
                }
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf).await?;
                let domain = String::from_utf8(buf)
                    .map_err(|e| VlessError::InvalidDomainEncoding(e.to_string()))?;
                Ok(Self::Domain(domain))
            }
            address_type::IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                Ok(Self::Ipv6(Ipv6Addr::from(octets)))
            }
            other => Err(VlessError::InvalidAddressType(other)),
        }
    }
}

impl fmt::Display for VlessAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(ip) => write!(f, "{ip}"),
            Self::Ipv6(ip) => write!(f, "[{ip}]"),
            Self::Domain(d) => write!(f, "{d}"),
        }
    }
}

/// Request header, written by the client
#[derive(Debug, Clone)]
pub struct VlessRequestHeader {
    pub uuid: [u8; 16],
    pub addons: VlessAddons,
    pub command: VlessCommand,
    pub port: u16,
    pub address: VlessAddress,
}

impl VlessRequestHeader {
    #[must_use]
    pub fn new(
        uuid: [u8; 16],
        addons: VlessAddons,
        command: VlessCommand,
        address: VlessAddress,
        port: u16,
    ) -> Self {
        Self {
            uuid,
            addons,
            command,
            port,
            address,
        }
    }

    /// Encode the full header.
    ///
    /// # Errors
    ///
    /// Returns `VlessError` when the addons or address fail to encode.
    pub fn encode(&self) -> Result<Vec<u8>, VlessError> {
        let addons = self.addons.encode()?;
        let mut buf =
            Vec::with_capacity(1 + 16 + addons.len() + 1 + 2 + self.address.encoded_len());
        buf.push(VLESS_VERSION);
        buf.extend_from_slice(&self.uuid);
        buf.extend_from_slice(&addons);
        buf.push(self.command.as_byte());
        buf.extend_from_slice(&self.port.to_be_bytes());
        self.address.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decode a request header; used by tests to prove the codec
    /// round-trips, and kept symmetric with [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns `VlessError` for malformed headers.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, VlessError> {
        let version = reader.read_u8().await?;
        if version != VLESS_VERSION {
            return Err(VlessError::InvalidVersion(version));
        }

        let mut uuid = [0u8; 16];
        reader.read_exact(&mut uuid).await?;

        let addons = read_addons(reader).await?;
        let command = VlessCommand::from_byte(reader.read_u8().await?)?;
        let port = reader.read_u16().await?;
        let address = VlessAddress::read_from(reader).await?;

        Ok(Self {
            uuid,
            addons,
            command,
            port,
            address,
        })
    }
}

/// Response header, read by the client before any payload
#[derive(Debug, Clone)]
pub struct VlessResponseHeader {
    pub addons: VlessAddons,
}

impl VlessResponseHeader {
    #[must_use]
    pub fn new(addons: VlessAddons) -> Self {
        Self { addons }
    }

    /// Read a response header from the start of the receive stream.
    ///
    /// # Errors
    ///
    /// Returns `VlessError::InvalidVersion` for a non-zero version and
    /// `VlessError` for truncated addons.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, VlessError> {
        let version = reader.read_u8().await?;
        if version != VLESS_VERSION {
            return Err(VlessError::InvalidVersion(version));
        }
        let addons = read_addons(reader).await?;
        Ok(Self { addons })
    }

    /// Encode the response header (server side of the codec; exercised by
    /// the round-trip tests).
    ///
    /// # Errors
    ///
    /// Returns `VlessError` when the addons fail to encode.
    pub fn encode(&self) -> Result<Vec<u8>, VlessError> {
        let addons = self.addons.encode()?;
        let mut buf = Vec::with_capacity(1 + addons.len());
        buf.push(VLESS_VERSION);
        buf.extend_from_slice(&addons);
        Ok(buf)
    }
}

async fn read_addons<R: AsyncRead + Unpin>(reader: &mut R) -> Result<VlessAddons, VlessError> {
    let len = reader.read_u8().await? as usize;
    if len == 0 {
        return Ok(VlessAddons::new());
    }
    let mut blob = vec![0u8; 1 + len];
    blob[0] = len as u8;
    reader.read_exact(&mut blob[1..]).await?;
    let (addons, _) = parse_addons(&blob)?;
    Ok(addons)
}
