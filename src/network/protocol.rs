//! Response classification and protocol helpers

use crate::network::transport::{ConnectOutcome, TcpReply, UdpOutcome};
use crate::network::{PortState, Protocol, ScanTechnique};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Common service ports mapping
#[derive(Clone)]
pub struct ServiceDatabase {
    tcp_services: HashMap<u16, &'static str>,
    udp_services: HashMap<u16, &'static str>,
}

impl ServiceDatabase {
    pub fn new() -> Self {
        let tcp_services = HashMap::from([
            (21, "ftp"),
            (22, "ssh"),
            (23, "telnet"),
            (25, "smtp"),
            (53, "domain"),
            (80, "http"),
            (110, "pop3"),
            (111, "rpcbind"),
            (135, "msrpc"),
            (139, "netbios-ssn"),
            (143, "imap"),
            (443, "https"),
            (445, "microsoft-ds"),
            (587, "submission"),
            (993, "imaps"),
            (995, "pop3s"),
            (1433, "mssql"),
            (1521, "oracle"),
            (3306, "mysql"),
            (3389, "rdp"),
            (5432, "postgresql"),
            (5900, "vnc"),
            (5984, "couchdb"),
            (6379, "redis"),
            (8080, "http-proxy"),
            (8443, "https-alt"),
            (9200, "elasticsearch"),
            (27017, "mongodb"),
        ]);

        let udp_services = HashMap::from([
            (53, "domain"),
            (67, "dhcps"),
            (68, "dhcpc"),
            (69, "tftp"),
            (123, "ntp"),
            (137, "netbios-ns"),
            (161, "snmp"),
            (162, "snmptrap"),
            (500, "isakmp"),
            (514, "syslog"),
            (1194, "openvpn"),
            (1900, "upnp"),
            (4500, "ipsec-nat-t"),
            (5353, "mdns"),
        ]);

        Self {
            tcp_services,
            udp_services,
        }
    }

    pub fn lookup(&self, port: u16, protocol: Protocol) -> Option<&'static str> {
        match protocol {
            Protocol::Tcp => self.tcp_services.get(&port).copied(),
            Protocol::Udp => self.udp_services.get(&port).copied(),
        }
    }
}

impl Default for ServiceDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps raw probe outcomes to port states
pub struct ResponseAnalyzer;

impl ResponseAnalyzer {
    /// Classify the answer to a crafted TCP segment (`None` = nothing before timeout)
    pub fn analyze_tcp_response(technique: ScanTechnique, response: Option<&TcpReply>) -> PortState {
        match technique {
            ScanTechnique::Syn => match response {
                Some(resp) if resp.is_syn_ack() => PortState::Open,
                Some(resp) if resp.is_rst() => PortState::Closed,
                _ => PortState::Filtered,
            },
            ScanTechnique::Ack => match response {
                Some(resp) if resp.is_rst() => PortState::Unfiltered,
                _ => PortState::Filtered,
            },
            ScanTechnique::Fin | ScanTechnique::Null | ScanTechnique::Xmas => match response {
                Some(resp) if resp.is_rst() => PortState::Closed,
                _ => PortState::OpenFiltered,
            },
            // Handshake and datagram probes never produce a crafted reply
            ScanTechnique::Connect | ScanTechnique::Udp => PortState::Error,
        }
    }

    /// Classify a full handshake attempt
    pub fn analyze_connect(outcome: &ConnectOutcome) -> PortState {
        match outcome {
            ConnectOutcome::Connected { .. } => PortState::Open,
            ConnectOutcome::Refused => PortState::Closed,
            ConnectOutcome::TimedOut | ConnectOutcome::Unreachable(_) => PortState::Filtered,
        }
    }

    /// Classify a datagram probe
    pub fn analyze_udp_response(outcome: &UdpOutcome) -> PortState {
        match outcome {
            UdpOutcome::Response(_) => PortState::Open,
            UdpOutcome::PortUnreachable => PortState::Closed,
            UdpOutcome::NoResponse => PortState::OpenFiltered,
        }
    }
}

/// Network utilities
pub struct NetworkUtils;

impl NetworkUtils {
    /// Local IPv4 address the kernel would route external traffic from
    pub fn get_local_ip() -> crate::Result<Ipv4Addr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| crate::ScanError::NetworkError(e.to_string()))?;
        socket
            .connect("8.8.8.8:80")
            .map_err(|e| crate::ScanError::NetworkError(e.to_string()))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| crate::ScanError::NetworkError(e.to_string()))?;

        match local_addr.ip() {
            std::net::IpAddr::V4(ipv4) => Ok(ipv4),
            std::net::IpAddr::V6(_) => Err(crate::ScanError::InvalidTarget(
                "no IPv4 route for raw probes".to_string(),
            )),
        }
    }

    /// Generate a random source port
    pub fn random_source_port() -> u16 {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        rng.gen_range(32768..65535)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYN_ACK: TcpReply = TcpReply { flags: 0x12 };
    const RST: TcpReply = TcpReply { flags: 0x04 };

    #[test]
    fn test_syn_classification() {
        assert_eq!(ResponseAnalyzer::analyze_tcp_response(ScanTechnique::Syn, Some(&SYN_ACK)), PortState::Open);
        assert_eq!(ResponseAnalyzer::analyze_tcp_response(ScanTechnique::Syn, Some(&RST)), PortState::Closed);
        assert_eq!(ResponseAnalyzer::analyze_tcp_response(ScanTechnique::Syn, None), PortState::Filtered);
    }

    #[test]
    fn test_ack_classification() {
        assert_eq!(ResponseAnalyzer::analyze_tcp_response(ScanTechnique::Ack, Some(&RST)), PortState::Unfiltered);
        assert_eq!(ResponseAnalyzer::analyze_tcp_response(ScanTechnique::Ack, None), PortState::Filtered);
    }

    #[test]
    fn test_inverse_scans_classification() {
        for technique in [ScanTechnique::Fin, ScanTechnique::Null, ScanTechnique::Xmas] {
            assert_eq!(ResponseAnalyzer::analyze_tcp_response(technique, Some(&RST)), PortState::Closed);
            assert_eq!(ResponseAnalyzer::analyze_tcp_response(technique, None), PortState::OpenFiltered);
        }
    }

    #[test]
    fn test_connect_and_udp_classification() {
        assert_eq!(
            ResponseAnalyzer::analyze_connect(&ConnectOutcome::Connected { banner: None }),
            PortState::Open
        );
        assert_eq!(ResponseAnalyzer::analyze_connect(&ConnectOutcome::Refused), PortState::Closed);
        assert_eq!(ResponseAnalyzer::analyze_connect(&ConnectOutcome::TimedOut), PortState::Filtered);

        assert_eq!(ResponseAnalyzer::analyze_udp_response(&UdpOutcome::Response(vec![1])), PortState::Open);
        assert_eq!(ResponseAnalyzer::analyze_udp_response(&UdpOutcome::PortUnreachable), PortState::Closed);
        assert_eq!(ResponseAnalyzer::analyze_udp_response(&UdpOutcome::NoResponse), PortState::OpenFiltered);
    }

    #[test]
    fn test_service_lookup() {
        let db = ServiceDatabase::new();
        assert_eq!(db.lookup(22, Protocol::Tcp), Some("ssh"));
        assert_eq!(db.lookup(161, Protocol::Udp), Some("snmp"));
        assert_eq!(db.lookup(161, Protocol::Tcp), None);
    }

    #[test]
    fn test_random_source_port_range() {
        for _ in 0..100 {
            let port = NetworkUtils::random_source_port();
            assert!(port >= 32768);
        }
    }
}
