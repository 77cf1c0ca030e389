//! Packet parsing helpers — pure functions from a captured frame to the
//! structured observations `capture::mod` folds into the topology graph.

use std::net::Ipv4Addr;

use pnet_packet::arp::ArpPacket;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use pnet_packet::Packet;

use crate::model::MacAddr;

pub const DHCP_CLIENT_PORT: u16 = 68;
pub const DHCP_SERVER_PORT: u16 = 67;
pub const DISCOVERY_PORT: u16 = 8442;
pub const TLS_PEER_PORT: u16 = 8443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProto {
    Tcp,
    Udp,
    Other,
}

impl TransportProto {
    pub fn label(&self) -> &'static str {
        match self {
            TransportProto::Tcp => "TCP",
            TransportProto::Udp => "UDP",
            TransportProto::Other => "OTHER",
        }
    }
}

pub struct ArpObservation {
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
}

pub struct Ipv4Observation {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub protocol: TransportProto,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub ttl: u8,
    pub payload_len: usize,
    pub dhcp: Option<DhcpObservation>,
}

pub struct DhcpObservation {
    pub offered_ip: Ipv4Addr,
    pub client_mac: MacAddr,
}

pub enum ParsedFrame {
    Arp(ArpObservation),
    Ipv4(Ipv4Observation),
    Unsupported,
}

/// Parse a raw Ethernet frame captured off the wire. Anything that isn't
/// ARP or IPv4 over Ethernet is `Unsupported` and dropped by the caller.
pub fn parse_ethernet_frame(bytes: &[u8]) -> ParsedFrame {
    let Some(eth) = EthernetPacket::new(bytes) else {
        return ParsedFrame::Unsupported;
    };

    match eth.get_ethertype() {
        EtherTypes::Arp => parse_arp(eth.payload()).map(ParsedFrame::Arp).unwrap_or(ParsedFrame::Unsupported),
        EtherTypes::Ipv4 => parse_ipv4(eth.payload(), MacAddr::from_bytes(eth.get_source().into())).unwrap_or(ParsedFrame::Unsupported),
        _ => ParsedFrame::Unsupported,
    }
}

fn parse_arp(bytes: &[u8]) -> Option<ArpObservation> {
    let arp = ArpPacket::new(bytes)?;
    Some(ArpObservation {
        sender_mac: MacAddr::from_bytes(arp.get_sender_hw_addr().into()),
        sender_ip: arp.get_sender_proto_addr(),
        target_ip: arp.get_target_proto_addr(),
    })
}

fn parse_ipv4(bytes: &[u8], src_mac: MacAddr) -> Option<ParsedFrame> {
    let packet = Ipv4Packet::new(bytes)?;
    let src_ip = packet.get_source();
    let dst_ip = packet.get_destination();
    let ttl = packet.get_ttl();
    let payload = packet.payload();

    let (protocol, src_port, dst_port, dhcp) = match packet.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(payload)?;
            (TransportProto::Tcp, Some(tcp.get_source()), Some(tcp.get_destination()), None)
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(payload)?;
            let sport = udp.get_source();
            let dport = udp.get_destination();
            let dhcp = if sport == DHCP_CLIENT_PORT || dport == DHCP_SERVER_PORT || dport == DHCP_CLIENT_PORT {
                parse_dhcp(udp.payload())
            } else {
                None
            };
            (TransportProto::Udp, Some(sport), Some(dport), dhcp)
        }
        _ => (TransportProto::Other, None, None, None),
    };

    // Destination MAC isn't carried by Ipv4Packet; the caller (capture
    // loop) already has it from the enclosing EthernetPacket and fills
    // it in. We return a placeholder here and let `capture::mod` set it.
    Some(ParsedFrame::Ipv4(Ipv4Observation {
        src_mac,
        dst_mac: MacAddr::from_bytes([0, 0, 0, 0, 0, 0]),
        src_ip,
        dst_ip,
        protocol,
        src_port,
        dst_port,
        ttl,
        payload_len: payload.len(),
        dhcp,
    }))
}

/// Hand-rolled BOOTP/DHCP parse: `yiaddr` at offset 16 (4 bytes),
/// `chaddr` at offset 28 (first 6 bytes), valid only when the payload is
/// at least 240 bytes (the fixed BOOTP header plus the DHCP magic cookie).
fn parse_dhcp(payload: &[u8]) -> Option<DhcpObservation> {
    if payload.len() < 240 {
        return None;
    }
    let yiaddr = Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]);
    if yiaddr == Ipv4Addr::UNSPECIFIED {
        return None;
    }
    let chaddr: [u8; 6] = payload[28..34].try_into().ok()?;
    Some(DhcpObservation {
        offered_ip: yiaddr,
        client_mac: MacAddr::from_bytes(chaddr),
    })
}

/// Re-parse the enclosing Ethernet frame purely to recover the
/// destination MAC for an already-parsed IPv4 observation — kept
/// separate so `parse_ipv4` stays a pure function of the IP payload.
pub fn destination_mac(bytes: &[u8]) -> Option<MacAddr> {
    let eth = EthernetPacket::new(bytes)?;
    Some(MacAddr::from_bytes(eth.get_destination().into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_eth_arp_frame() -> Vec<u8> {
        // 14-byte Ethernet header (dst, src, ethertype=0x0806) + minimal
        // 28-byte ARP payload (request, sender 192.168.1.10, target 192.168.1.1).
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff]); // dst
        frame.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]); // src
        frame.extend_from_slice(&[0x08, 0x06]); // ethertype ARP

        frame.extend_from_slice(&[0x00, 0x01]); // htype ethernet
        frame.extend_from_slice(&[0x08, 0x00]); // ptype ipv4
        frame.push(6); // hlen
        frame.push(4); // plen
        frame.extend_from_slice(&[0x00, 0x01]); // operation: request
        frame.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]); // sender hw
        frame.extend_from_slice(&[192, 168, 1, 10]); // sender proto
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]); // target hw
        frame.extend_from_slice(&[192, 168, 1, 1]); // target proto
        frame
    }

    #[test]
    fn parses_arp_request() {
        let frame = build_eth_arp_frame();
        match parse_ethernet_frame(&frame) {
            ParsedFrame::Arp(obs) => {
                assert_eq!(obs.sender_mac.as_str(), "aa:bb:cc:dd:ee:01");
                assert_eq!(obs.sender_ip, Ipv4Addr::new(192, 168, 1, 10));
                assert_eq!(obs.target_ip, Ipv4Addr::new(192, 168, 1, 1));
            }
            _ => panic!("expected ARP observation"),
        }
    }

    #[test]
    fn dhcp_requires_minimum_length() {
        let short_payload = vec![0u8; 100];
        assert!(parse_dhcp(&short_payload).is_none());
    }

    #[test]
    fn dhcp_extracts_yiaddr_and_chaddr_at_fixed_offsets() {
        let mut payload = vec![0u8; 240];
        payload[16..20].copy_from_slice(&[192, 168, 1, 50]);
        payload[28..34].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);
        let obs = parse_dhcp(&payload).unwrap();
        assert_eq!(obs.offered_ip, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(obs.client_mac.as_str(), "aa:bb:cc:dd:ee:02");
    }

    #[test]
    fn unsupported_ethertype_is_dropped() {
        let mut frame = vec![0u8; 14];
        frame[12] = 0x86;
        frame[13] = 0xdd; // IPv6 — unsupported
        assert!(matches!(parse_ethernet_frame(&frame), ParsedFrame::Unsupported));
    }
}
