//! Packet crafting and parsing for raw TCP probes

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{MutableTcpPacket, TcpPacket};
use pnet::packet::Packet;
use rand::Rng;
use std::net::Ipv4Addr;

use crate::{Result, ScanError};

const IP_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;

/// TCP packet builder for crafting probe segments
#[derive(Debug, Clone)]
pub struct TcpPacketBuilder {
    source_ip: Ipv4Addr,
    dest_ip: Ipv4Addr,
    source_port: u16,
    dest_port: u16,
    flags: u8,
    seq_num: u32,
    ack_num: u32,
    window_size: u16,
    ip_id: u16,
}

impl TcpPacketBuilder {
    pub fn new(source_ip: Ipv4Addr, dest_ip: Ipv4Addr, source_port: u16, dest_port: u16) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            source_ip,
            dest_ip,
            source_port,
            dest_port,
            flags: 0,
            seq_num: rng.gen(),
            ack_num: 0,
            window_size: 1024,
            ip_id: rng.gen(),
        }
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    /// Build the complete IP + TCP packet
    pub fn build(&self) -> Result<Vec<u8>> {
        let total_len = IP_HEADER_LEN + TCP_HEADER_LEN;
        let mut packet_buf = vec![0u8; total_len];

        {
            let mut ip_packet = MutableIpv4Packet::new(&mut packet_buf[..IP_HEADER_LEN])
                .ok_or_else(|| ScanError::RawSocketError("IPv4 header buffer too small".into()))?;
            ip_packet.set_version(4);
            ip_packet.set_header_length(5); // 5 * 4 = 20 bytes
            ip_packet.set_total_length(total_len as u16);
            ip_packet.set_identification(self.ip_id);
            ip_packet.set_flags(2); // Don't fragment
            ip_packet.set_ttl(64);
            ip_packet.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ip_packet.set_source(self.source_ip);
            ip_packet.set_destination(self.dest_ip);

            let checksum = pnet::packet::ipv4::checksum(&ip_packet.to_immutable());
            ip_packet.set_checksum(checksum);
        }

        {
            let mut tcp_packet = MutableTcpPacket::new(&mut packet_buf[IP_HEADER_LEN..])
                .ok_or_else(|| ScanError::RawSocketError("TCP header buffer too small".into()))?;
            tcp_packet.set_source(self.source_port);
            tcp_packet.set_destination(self.dest_port);
            tcp_packet.set_sequence(self.seq_num);
            tcp_packet.set_acknowledgement(self.ack_num);
            tcp_packet.set_data_offset(5);
            tcp_packet.set_flags(self.flags as u16);
            tcp_packet.set_window(self.window_size);
            tcp_packet.set_urgent_ptr(0);

            let checksum = pnet::packet::tcp::ipv4_checksum(
                &tcp_packet.to_immutable(),
                &self.source_ip,
                &self.dest_ip,
            );
            tcp_packet.set_checksum(checksum);
        }

        Ok(packet_buf)
    }
}

/// Packet parser for analyzing received packets
pub struct PacketParser;

impl PacketParser {
    /// Parse an IPv4 datagram carrying TCP
    pub fn parse_tcp_response(packet: &[u8]) -> Option<TcpResponse> {
        if packet.len() < IP_HEADER_LEN + TCP_HEADER_LEN {
            return None;
        }

        let ip_packet = Ipv4Packet::new(packet)?;
        if ip_packet.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
            return None;
        }

        let ip_header_len = (ip_packet.get_header_length() as usize) * 4;
        let tcp_packet = TcpPacket::new(packet.get(ip_header_len..)?)?;

        Some(TcpResponse {
            source_ip: ip_packet.get_source(),
            dest_ip: ip_packet.get_destination(),
            source_port: tcp_packet.get_source(),
            dest_port: tcp_packet.get_destination(),
            flags: tcp_packet.get_flags() as u8,
            payload_len: tcp_packet.payload().len(),
        })
    }
}

/// TCP response structure
#[derive(Debug, Clone)]
pub struct TcpResponse {
    pub source_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub source_port: u16,
    pub dest_port: u16,
    pub flags: u8,
    pub payload_len: usize,
}

impl TcpResponse {
    /// Whether this segment answers a probe sent from `local_port` to `target:port`
    pub fn answers(&self, target: Ipv4Addr, port: u16, local_port: u16) -> bool {
        self.source_ip == target && self.source_port == port && self.dest_port == local_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{tcp_flags, ScanTechnique};

    #[test]
    fn test_build_and_parse_syn() {
        let src = Ipv4Addr::new(192, 168, 1, 10);
        let dst = Ipv4Addr::new(192, 168, 1, 20);
        let packet = TcpPacketBuilder::new(src, dst, 40000, 443).flags(ScanTechnique::Syn.tcp_flags())
            .build()
            .unwrap();
        assert_eq!(packet.len(), 40);

        let parsed = PacketParser::parse_tcp_response(&packet).unwrap();
        assert_eq!(parsed.source_ip, src);
        assert_eq!(parsed.dest_port, 443);
        assert_eq!(parsed.flags, tcp_flags::SYN);
    }

    #[test]
    fn test_xmas_flags() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let packet = TcpPacketBuilder::new(src, dst, 40001, 80)
            .flags(ScanTechnique::Xmas.tcp_flags())
            .build()
            .unwrap();
        let parsed = PacketParser::parse_tcp_response(&packet).unwrap();
        assert_eq!(parsed.flags, 0x29);
    }

    #[test]
    fn test_answers_matches_probe_tuple() {
        // A reply travels dst -> src, so swap the addresses
        let packet = TcpPacketBuilder::new(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1), 22, 40000)
            .flags(tcp_flags::SYN | tcp_flags::ACK)
            .build()
            .unwrap();
        let reply = PacketParser::parse_tcp_response(&packet).unwrap();
        assert!(reply.answers(Ipv4Addr::new(10, 0, 0, 5), 22, 40000));
        assert!(!reply.answers(Ipv4Addr::new(10, 0, 0, 5), 23, 40000));
    }

    #[test]
    fn test_parse_rejects_short_buffer() {
        assert!(PacketParser::parse_tcp_response(&[0u8; 10]).is_none());
    }
}
