//! Forged TCP segments
//!
//! A segment is one Ethernet II / IPv4 / TCP frame. Only the fields the
//! carrier needs are kept; options, fragmentation and IPv6 are not supported.

use super::{MacAddr, PacketError, TcpFlags};
use bytes::Bytes;
use etherparse::{EtherType, Ethernet2Header, IpNumber, Ipv4Header, TcpHeader};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Length of an Ethernet II header
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Largest payload that fits a 1500 byte MTU with minimal IPv4 and TCP headers
pub const MAX_SEGMENT_PAYLOAD: usize = 1500 - 20 - 20;

const DEFAULT_TTL: u8 = 64;

/// A parsed or to-be-built TCP segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub payload: Bytes,
}

impl Segment {
    /// Parse an Ethernet frame
    ///
    /// Returns `Ok(None)` for frames that are not unfragmented IPv4/TCP.
    pub fn parse(frame: &[u8]) -> Result<Option<Segment>, PacketError> {
        let (eth, rest) = Ethernet2Header::from_slice(frame)
            .map_err(|e| PacketError::Malformed(e.to_string()))?;
        if eth.ether_type != EtherType::IPV4 {
            return Ok(None);
        }

        let (ip, rest) = match Ipv4Header::from_slice(rest) {
            Ok(parsed) => parsed,
            // Not every frame tagged IPv4 on a shared segment is well formed
            Err(e) => return Err(PacketError::Malformed(e.to_string())),
        };
        if ip.protocol != IpNumber::TCP || ip.is_fragmenting_payload() {
            return Ok(None);
        }

        // Ethernet padding may follow the IP packet
        let ip_payload_len = (ip.total_len as usize).saturating_sub(ip.header_len());
        if rest.len() < ip_payload_len {
            return Err(PacketError::Malformed(format!(
                "truncated IPv4 payload: {} < {}",
                rest.len(),
                ip_payload_len
            )));
        }
        let rest = &rest[..ip_payload_len];

        let (tcp, payload) = TcpHeader::from_slice(rest)
            .map_err(|e| PacketError::Malformed(e.to_string()))?;

        Ok(Some(Segment {
            src: SocketAddrV4::new(Ipv4Addr::from(ip.source), tcp.source_port),
            dst: SocketAddrV4::new(Ipv4Addr::from(ip.destination), tcp.destination_port),
            flags: TcpFlags::from_header(&tcp),
            seq: tcp.sequence_number,
            ack: tcp.acknowledgment_number,
            window: tcp.window_size,
            payload: Bytes::copy_from_slice(payload),
        }))
    }

    /// Build the Ethernet frame for this segment, with valid IPv4 and TCP
    /// checksums.
    pub fn encode(&self, src_mac: MacAddr, dst_mac: MacAddr) -> Result<Vec<u8>, PacketError> {
        if self.payload.len() > MAX_SEGMENT_PAYLOAD {
            return Err(PacketError::TooLarge(self.payload.len()));
        }

        let mut tcp = TcpHeader::new(self.src.port(), self.dst.port(), self.seq, self.window);
        tcp.acknowledgment_number = self.ack;
        self.flags.apply(&mut tcp);

        let ip_payload_len = tcp.header_len() as usize + self.payload.len();
        let mut ip = Ipv4Header::new(
            ip_payload_len as u16,
            DEFAULT_TTL,
            IpNumber::TCP,
            self.src.ip().octets(),
            self.dst.ip().octets(),
        )
        .map_err(|e| PacketError::Malformed(e.to_string()))?;
        ip.dont_fragment = true;
        ip.header_checksum = ip.calc_header_checksum();

        tcp.checksum = tcp
            .calc_checksum_ipv4(&ip, &self.payload)
            .map_err(|e| PacketError::Malformed(e.to_string()))?;

        let eth = Ethernet2Header {
            source: src_mac.octets(),
            destination: dst_mac.octets(),
            ether_type: EtherType::IPV4,
        };

        let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + 20 + ip_payload_len);
        eth.write(&mut frame)
            .map_err(|e| PacketError::Malformed(e.to_string()))?;
        ip.write(&mut frame)
            .map_err(|e| PacketError::Malformed(e.to_string()))?;
        tcp.write(&mut frame)
            .map_err(|e| PacketError::Malformed(e.to_string()))?;
        frame.extend_from_slice(&self.payload);

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Segment {
        Segment {
            src: "10.0.0.2:40000".parse().unwrap(),
            dst: "10.0.0.1:9999".parse().unwrap(),
            flags: TcpFlags::PSH_ACK,
            seq: 0x0102_0304,
            ack: 0x0a0b_0c0d,
            window: 65535,
            payload: Bytes::from_static(b"sealed kcp packet"),
        }
    }

    #[test]
    fn test_encode_parse() {
        let seg = sample();
        let src_mac: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let dst_mac: MacAddr = "02:00:00:00:00:02".parse().unwrap();

        let frame = seg.encode(src_mac, dst_mac).unwrap();
        assert_eq!(&frame[0..6], &dst_mac.octets());
        assert_eq!(&frame[6..12], &src_mac.octets());

        let parsed = Segment::parse(&frame).unwrap().unwrap();
        assert_eq!(parsed, seg);
    }

    #[test]
    fn test_ethernet_padding_ignored() {
        let mut seg = sample();
        seg.payload = Bytes::new();
        let mut frame = seg
            .encode(MacAddr::default(), MacAddr::default())
            .unwrap();
        frame.extend_from_slice(&[0u8; 6]);

        let parsed = Segment::parse(&frame).unwrap().unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn test_non_ipv4_skipped() {
        let mut frame = sample()
            .encode(MacAddr::default(), MacAddr::default())
            .unwrap();
        // Rewrite EtherType to ARP
        frame[12] = 0x08;
        frame[13] = 0x06;
        assert!(Segment::parse(&frame).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame() {
        let frame = sample()
            .encode(MacAddr::default(), MacAddr::default())
            .unwrap();
        assert!(Segment::parse(&frame[..30]).is_err());
    }

    #[test]
    fn test_oversized_payload() {
        let mut seg = sample();
        seg.payload = Bytes::from(vec![0u8; MAX_SEGMENT_PAYLOAD + 1]);
        assert!(matches!(
            seg.encode(MacAddr::default(), MacAddr::default()),
            Err(PacketError::TooLarge(_))
        ));
    }
}
