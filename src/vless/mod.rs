//! VLESS protocol: header codec, addons, UDP framing and the client
//!
//! VLESS is a minimal UUID-authenticated framing over a transport: one
//! request header, one response header, then raw (or Vision-padded)
//! payload. See [`protocol`] for the wire layout.

mod addons;
mod client;
mod error;
mod protocol;
mod udp;

pub use addons::{parse_addons, VlessAddons, FLOW_VISION, FLOW_VISION_UDP443};
pub use client::{Destination, DestinationHost, VlessConnection, VlessUdpConnection};
pub use error::VlessError;
pub use protocol::{
    address_type, VlessAddress, VlessCommand, VlessRequestHeader, VlessResponseHeader,
    VLESS_VERSION,
};
pub use udp::{encode_datagram, encode_datagram_into, DatagramDecoder, MAX_DATAGRAM};
