//! Header parsing for packet-in payloads and synthesis of ARP replies.
//!
//! Only the layers the controller decides on are decoded: Ethernet II, ARP for
//! IPv4 over Ethernet, IPv4 and the TCP port pair. An inner layer that is
//! truncated or of an unexpected shape is reported as absent rather than as an
//! error, so the frame still takes the plain switching path.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::domain::addr::{MacAddr, PortNo};

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// IPv4 protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

const ETHERNET_HEADER_LEN: usize = 14;
const ARP_PACKET_LEN: usize = 28;
const IPV4_MIN_HEADER_LEN: usize = 20;

/// A packet the switch could not match and handed to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    /// Port the packet arrived on.
    pub in_port: PortNo,
    /// Switch-side buffer holding the packet, if any.
    pub buffer_id: Option<u32>,
    /// The frame, possibly truncated by the switch.
    pub data: Bytes,
}

/// Errors for frames the controller cannot process at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Fewer bytes than an Ethernet header.
    #[error("frame of {0} bytes is too short for an ethernet header")]
    Truncated(usize),
}

/// Ethernet II header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    /// Destination hardware address.
    pub dst: MacAddr,
    /// Source hardware address.
    pub src: MacAddr,
    /// Payload EtherType.
    pub ethertype: u16,
}

impl EthernetHeader {
    fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < ETHERNET_HEADER_LEN {
            return Err(PacketError::Truncated(data.len()));
        }
        Ok(Self {
            dst: MacAddr::from_slice(&data[0..6]).ok_or(PacketError::Truncated(data.len()))?,
            src: MacAddr::from_slice(&data[6..12]).ok_or(PacketError::Truncated(data.len()))?,
            ethertype: u16::from_be_bytes([data[12], data[13]]),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.dst.octets());
        buf.put_slice(&self.src.octets());
        buf.put_u16(self.ethertype);
    }
}

/// ARP opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    /// Who-has (1).
    Request,
    /// Is-at (2).
    Reply,
    /// Any other opcode (RARP and friends).
    Other(u16),
}

impl ArpOperation {
    fn from_wire(op: u16) -> Self {
        match op {
            1 => ArpOperation::Request,
            2 => ArpOperation::Reply,
            other => ArpOperation::Other(other),
        }
    }

    fn to_wire(self) -> u16 {
        match self {
            ArpOperation::Request => 1,
            ArpOperation::Reply => 2,
            ArpOperation::Other(op) => op,
        }
    }
}

/// An ARP message for IPv4 over Ethernet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    /// Request or reply.
    pub operation: ArpOperation,
    /// Sender hardware address.
    pub sender_mac: MacAddr,
    /// Sender protocol address.
    pub sender_ip: Ipv4Addr,
    /// Target hardware address.
    pub target_mac: MacAddr,
    /// Target protocol address.
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_PACKET_LEN {
            return None;
        }
        let htype = u16::from_be_bytes([data[0], data[1]]);
        let ptype = u16::from_be_bytes([data[2], data[3]]);
        if htype != 1 || ptype != ETHERTYPE_IPV4 || data[4] != 6 || data[5] != 4 {
            return None;
        }
        Some(Self {
            operation: ArpOperation::from_wire(u16::from_be_bytes([data[6], data[7]])),
            sender_mac: MacAddr::from_slice(&data[8..14])?,
            sender_ip: ipv4_at(data, 14)?,
            target_mac: MacAddr::from_slice(&data[18..24])?,
            target_ip: ipv4_at(data, 24)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(1);
        buf.put_u16(ETHERTYPE_IPV4);
        buf.put_u8(6);
        buf.put_u8(4);
        buf.put_u16(self.operation.to_wire());
        buf.put_slice(&self.sender_mac.octets());
        buf.put_slice(&self.sender_ip.octets());
        buf.put_slice(&self.target_mac.octets());
        buf.put_slice(&self.target_ip.octets());
    }

    /// Serialize this message into a complete Ethernet frame.
    pub fn to_frame(&self, eth_src: MacAddr, eth_dst: MacAddr) -> Bytes {
        let mut buf = BytesMut::with_capacity(ETHERNET_HEADER_LEN + ARP_PACKET_LEN);
        EthernetHeader {
            dst: eth_dst,
            src: eth_src,
            ethertype: ETHERTYPE_ARP,
        }
        .write(&mut buf);
        self.write(&mut buf);
        buf.freeze()
    }
}

/// The IPv4 header fields the controller matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
    /// Payload protocol number.
    pub protocol: u8,
    /// Header length in bytes (IHL * 4).
    pub header_len: usize,
    /// Fragment offset in 8-byte units.
    pub fragment_offset: u16,
}

impl Ipv4Header {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IPV4_MIN_HEADER_LEN || data[0] >> 4 != 4 {
            return None;
        }
        let header_len = usize::from(data[0] & 0x0f) * 4;
        if header_len < IPV4_MIN_HEADER_LEN || data.len() < header_len {
            return None;
        }
        Some(Self {
            src: ipv4_at(data, 12)?,
            dst: ipv4_at(data, 16)?,
            protocol: data[9],
            header_len,
            fragment_offset: u16::from_be_bytes([data[6], data[7]]) & 0x1fff,
        })
    }
}

/// Source and destination ports of a TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpPorts {
    /// Source port.
    pub src: u16,
    /// Destination port.
    pub dst: u16,
}

/// Decoded view of a packet-in payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket {
    /// Always present; a frame without one is rejected by [`ParsedPacket::parse`].
    pub ethernet: EthernetHeader,
    /// Present for well-formed Ethernet/IPv4 ARP.
    pub arp: Option<ArpPacket>,
    /// Present for well-formed IPv4.
    pub ipv4: Option<Ipv4Header>,
    /// Present for the first fragment of an IPv4 TCP segment.
    pub tcp: Option<TcpPorts>,
}

impl ParsedPacket {
    /// Decode `data`, failing only when there is no Ethernet header.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        let ethernet = EthernetHeader::parse(data)?;
        let payload = &data[ETHERNET_HEADER_LEN..];

        let mut parsed = Self {
            ethernet,
            arp: None,
            ipv4: None,
            tcp: None,
        };

        match ethernet.ethertype {
            ETHERTYPE_ARP => parsed.arp = ArpPacket::parse(payload),
            ETHERTYPE_IPV4 => {
                if let Some(ip) = Ipv4Header::parse(payload) {
                    if ip.protocol == IPPROTO_TCP && ip.fragment_offset == 0 {
                        let segment = &payload[ip.header_len..];
                        if segment.len() >= 4 {
                            parsed.tcp = Some(TcpPorts {
                                src: u16::from_be_bytes([segment[0], segment[1]]),
                                dst: u16::from_be_bytes([segment[2], segment[3]]),
                            });
                        }
                    }
                    parsed.ipv4 = Some(ip);
                }
            }
            _ => {}
        }

        Ok(parsed)
    }
}

fn ipv4_at(data: &[u8], offset: usize) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// Frame builders shared by unit and integration tests.
#[doc(hidden)]
pub mod testing {
    use super::*;

    /// An Ethernet/IPv4/TCP frame with a bare 20-byte TCP header (SYN set).
    pub fn tcp_frame(
        src_mac: MacAddr,
        dst_mac: MacAddr,
        src: (Ipv4Addr, u16),
        dst: (Ipv4Addr, u16),
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(54);
        EthernetHeader {
            dst: dst_mac,
            src: src_mac,
            ethertype: ETHERTYPE_IPV4,
        }
        .write(&mut buf);
        buf.put_u8(0x45);
        buf.put_u8(0);
        buf.put_u16(40);
        buf.put_u32(0);
        buf.put_u8(64);
        buf.put_u8(IPPROTO_TCP);
        buf.put_u16(0);
        buf.put_slice(&src.0.octets());
        buf.put_slice(&dst.0.octets());
        buf.put_u16(src.1);
        buf.put_u16(dst.1);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u8(0x50);
        buf.put_u8(0x02);
        buf.put_u16(0xffff);
        buf.put_u32(0);
        buf.freeze()
    }

    /// A broadcast ARP who-has frame.
    pub fn arp_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Bytes {
        ArpPacket {
            operation: ArpOperation::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
        .to_frame(sender_mac, MacAddr::BROADCAST)
    }

    /// A minimal frame with an arbitrary EtherType and no payload.
    pub fn raw_frame(src: MacAddr, dst: MacAddr, ethertype: u16) -> Bytes {
        let mut buf = BytesMut::with_capacity(ETHERNET_HEADER_LEN);
        EthernetHeader { dst, src, ethertype }.write(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    const CLIENT: MacAddr = MacAddr([0, 0, 0, 0, 0, 1]);
    const VMAC: MacAddr = MacAddr([0, 0, 0, 0, 0, 0xfe]);

    #[test]
    fn short_frame_is_rejected() {
        assert_eq!(ParsedPacket::parse(&[0u8; 13]), Err(PacketError::Truncated(13)));
    }

    #[test]
    fn decodes_tcp_segment() {
        let frame = tcp_frame(
            CLIENT,
            VMAC,
            (Ipv4Addr::new(10, 0, 0, 1), 40000),
            (Ipv4Addr::new(10, 0, 0, 100), 80),
        );
        let p = ParsedPacket::parse(&frame).unwrap();
        assert_eq!(p.ethernet.src, CLIENT);
        assert_eq!(p.ethernet.dst, VMAC);
        let ip = p.ipv4.unwrap();
        assert_eq!(ip.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ip.dst, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(p.tcp, Some(TcpPorts { src: 40000, dst: 80 }));
        assert!(p.arp.is_none());
    }

    #[test]
    fn decodes_arp_request() {
        let frame = arp_request(CLIENT, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 100));
        let p = ParsedPacket::parse(&frame).unwrap();
        let arp = p.arp.unwrap();
        assert_eq!(arp.operation, ArpOperation::Request);
        assert_eq!(arp.sender_mac, CLIENT);
        assert_eq!(arp.target_ip, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(p.ethernet.dst, MacAddr::BROADCAST);
    }

    #[test]
    fn truncated_inner_layers_are_absent() {
        let frame = tcp_frame(
            CLIENT,
            VMAC,
            (Ipv4Addr::new(10, 0, 0, 1), 1),
            (Ipv4Addr::new(10, 0, 0, 100), 2),
        );
        // Cut inside the TCP header's port pair.
        let p = ParsedPacket::parse(&frame[..ETHERNET_HEADER_LEN + 22]).unwrap();
        assert!(p.ipv4.is_some());
        assert!(p.tcp.is_none());

        let p = ParsedPacket::parse(&frame[..ETHERNET_HEADER_LEN + 10]).unwrap();
        assert!(p.ipv4.is_none());

        let arp = arp_request(CLIENT, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
        let p = ParsedPacket::parse(&arp[..30]).unwrap();
        assert!(p.arp.is_none());
    }

    #[test]
    fn non_first_fragment_has_no_ports() {
        let frame = tcp_frame(
            CLIENT,
            VMAC,
            (Ipv4Addr::new(10, 0, 0, 1), 1),
            (Ipv4Addr::new(10, 0, 0, 100), 2),
        );
        let mut bytes = frame.to_vec();
        bytes[ETHERNET_HEADER_LEN + 7] = 0x10;
        let p = ParsedPacket::parse(&bytes).unwrap();
        assert!(p.tcp.is_none());
        assert_eq!(p.ipv4.unwrap().fragment_offset, 0x10);
    }

    #[test]
    fn arp_frame_layout() {
        let reply = ArpPacket {
            operation: ArpOperation::Reply,
            sender_mac: VMAC,
            sender_ip: Ipv4Addr::new(10, 0, 0, 100),
            target_mac: CLIENT,
            target_ip: Ipv4Addr::new(10, 0, 0, 1),
        };
        let frame = reply.to_frame(VMAC, CLIENT);
        assert_eq!(frame.len(), 42);
        assert_eq!(&frame[12..14], &[0x08, 0x06]);
        assert_eq!(&frame[20..22], &[0x00, 0x02]);
        assert_eq!(ParsedPacket::parse(&frame).unwrap().arp, Some(reply));
    }
}
