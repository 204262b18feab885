//! Wire-level frame handling for UDP and SYN peeking
//!
//! UDP never enters the TCP/IP state machine: datagrams are parsed
//! straight off the inbound frames and replies are synthesized back into
//! full IP frames (this is also what `udp_sendto` rides on). TCP frames
//! are peeked just enough to spot a SYN to a destination without a
//! listener, so one can be provisioned before the frame is fed in.

use std::net::{IpAddr, SocketAddr};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpProtocol, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr, TcpPacket, UdpPacket, UdpRepr,
};

/// One UDP datagram lifted off an IP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub is_ipv6: bool,
    pub payload: Vec<u8>,
}

/// IP version by the first header nibble
#[must_use]
pub fn frame_is_ipv6(frame: &[u8]) -> bool {
    frame.first().is_some_and(|b| b >> 4 == 6)
}

/// Parse a frame into a UDP datagram; `None` for anything else
#[must_use]
pub fn parse_udp_frame(frame: &[u8]) -> Option<UdpDatagram> {
    match frame.first()? >> 4 {
        4 => {
            let ip = Ipv4Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Udp {
                return None;
            }
            let udp = UdpPacket::new_checked(ip.payload()).ok()?;
            Some(UdpDatagram {
                src: SocketAddr::new(IpAddr::V4(ip.src_addr()), udp.src_port()),
                dst: SocketAddr::new(IpAddr::V4(ip.dst_addr()), udp.dst_port()),
                is_ipv6: false,
                payload: udp.payload().to_vec(),
            })
        }
        6 => {
            let ip = Ipv6Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Udp {
                return None;
            }
            let udp = UdpPacket::new_checked(ip.payload()).ok()?;
            Some(UdpDatagram {
                src: SocketAddr::new(IpAddr::V6(ip.src_addr()), udp.src_port()),
                dst: SocketAddr::new(IpAddr::V6(ip.dst_addr()), udp.dst_port()),
                is_ipv6: true,
                payload: udp.payload().to_vec(),
            })
        }
        _ => None,
    }
}

/// Synthesize a full IP frame carrying one UDP datagram.
///
/// Mixed address families return `None`.
#[must_use]
pub fn build_udp_frame(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    let caps = ChecksumCapabilities::default();
    let udp_repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let ip_repr = Ipv4Repr {
                src_addr: src_ip,
                dst_addr: dst_ip,
                next_header: IpProtocol::Udp,
                payload_len: udp_repr.header_len() + payload.len(),
                hop_limit: 64,
            };
            let mut frame =
                vec![0u8; ip_repr.buffer_len() + udp_repr.header_len() + payload.len()];
            let mut ip_packet = Ipv4Packet::new_unchecked(&mut frame);
            ip_repr.emit(&mut ip_packet, &caps);
            let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
            udp_repr.emit(
                &mut udp_packet,
                &src_ip.into(),
                &dst_ip.into(),
                payload.len(),
                |buf| buf.copy_from_slice(payload),
                &caps,
            );
            Some(frame)
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            let ip_repr = Ipv6Repr {
                src_addr: src_ip,
                dst_addr: dst_ip,
                next_header: IpProtocol::Udp,
                payload_len: udp_repr.header_len() + payload.len(),
                hop_limit: 64,
            };
            let mut frame =
                vec![0u8; ip_repr.buffer_len() + udp_repr.header_len() + payload.len()];
            let mut ip_packet = Ipv6Packet::new_unchecked(&mut frame);
            ip_repr.emit(&mut ip_packet);
            let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
            udp_repr.emit(
                &mut udp_packet,
                &src_ip.into(),
                &dst_ip.into(),
                payload.len(),
                |buf| buf.copy_from_slice(payload),
                &caps,
            );
            Some(frame)
        }
        _ => None,
    }
}

/// Peek a frame for a TCP SYN (without ACK); returns the destination.
#[must_use]
pub fn parse_tcp_syn(frame: &[u8]) -> Option<SocketAddr> {
    match frame.first()? >> 4 {
        4 => {
            let ip = Ipv4Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Tcp {
                return None;
            }
            let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
            (tcp.syn() && !tcp.ack())
                .then(|| SocketAddr::new(IpAddr::V4(ip.dst_addr()), tcp.dst_port()))
        }
        6 => {
            let ip = Ipv6Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Tcp {
                return None;
            }
            let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
            (tcp.syn() && !tcp.ack())
                .then(|| SocketAddr::new(IpAddr::V6(ip.dst_addr()), tcp.dst_port()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_frame_roundtrip_v4() {
        let src: SocketAddr = "10.8.0.2:54321".parse().unwrap();
        let dst: SocketAddr = "1.1.1.1:53".parse().unwrap();
        let frame = build_udp_frame(src, dst, b"query bytes").unwrap();
        assert!(!frame_is_ipv6(&frame));

        let dgram = parse_udp_frame(&frame).unwrap();
        assert_eq!(dgram.src, src);
        assert_eq!(dgram.dst, dst);
        assert!(!dgram.is_ipv6);
        assert_eq!(dgram.payload, b"query bytes");
    }

    #[test]
    fn test_udp_frame_roundtrip_v6() {
        let src: SocketAddr = "[fd00::2]:40000".parse().unwrap();
        let dst: SocketAddr = "[2606:4700::1111]:53".parse().unwrap();
        let frame = build_udp_frame(src, dst, b"abc").unwrap();
        assert!(frame_is_ipv6(&frame));

        let dgram = parse_udp_frame(&frame).unwrap();
        assert_eq!(dgram.src, src);
        assert_eq!(dgram.dst, dst);
        assert!(dgram.is_ipv6);
        assert_eq!(dgram.payload, b"abc");
    }

    #[test]
    fn test_mixed_families_rejected() {
        let src: SocketAddr = "10.8.0.2:1".parse().unwrap();
        let dst: SocketAddr = "[fd00::1]:2".parse().unwrap();
        assert!(build_udp_frame(src, dst, b"x").is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_udp_frame(&[]).is_none());
        assert!(parse_udp_frame(&[0x45, 0x00]).is_none());
        assert!(parse_udp_frame(b"not an ip frame at all....").is_none());
        assert!(parse_tcp_syn(&[]).is_none());
    }

    #[test]
    fn test_parse_tcp_syn() {
        use smoltcp::wire::{TcpControl, TcpRepr, TcpSeqNumber};

        let src_ip: std::net::Ipv4Addr = "10.8.0.2".parse().unwrap();
        let dst_ip: std::net::Ipv4Addr = "198.18.0.1".parse().unwrap();
        let caps = ChecksumCapabilities::default();
        let tcp_repr = TcpRepr {
            src_port: 44444,
            dst_port: 443,
            control: TcpControl::Syn,
            seq_number: TcpSeqNumber(100),
            ack_number: None,
            window_len: 65_000,
            window_scale: None,
            max_seg_size: Some(1360),
            sack_permitted: false,
            sack_ranges: [None, None, None],
            timestamp: None,
            payload: &[],
        };
        let ip_repr = Ipv4Repr {
            src_addr: src_ip,
            dst_addr: dst_ip,
            next_header: IpProtocol::Tcp,
            payload_len: tcp_repr.buffer_len(),
            hop_limit: 64,
        };
        let mut frame = vec![0u8; ip_repr.buffer_len() + tcp_repr.buffer_len()];
        let mut ip_packet = Ipv4Packet::new_unchecked(&mut frame);
        ip_repr.emit(&mut ip_packet, &caps);
        let mut tcp_packet = TcpPacket::new_unchecked(ip_packet.payload_mut());
        tcp_repr.emit(
            &mut tcp_packet,
            &src_ip.into(),
            &dst_ip.into(),
            &caps,
        );

        let dst = parse_tcp_syn(&frame).unwrap();
        assert_eq!(dst, "198.18.0.1:443".parse().unwrap());

        // A UDP frame is not a SYN
        let udp = build_udp_frame(
            "10.8.0.2:1".parse().unwrap(),
            "1.1.1.1:53".parse().unwrap(),
            b"x",
        )
        .unwrap();
        assert!(parse_tcp_syn(&udp).is_none());
    }
}
