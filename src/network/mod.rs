//! Network module for packet crafting, transports and response classification

pub mod packet;
pub mod protocol;
pub mod socket;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::ScanError;

/// Available scanning techniques
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanTechnique {
    /// TCP Connect scan (full connection)
    Connect,
    /// TCP SYN scan (half-open)
    Syn,
    /// TCP ACK scan
    Ack,
    /// TCP FIN scan
    Fin,
    /// TCP NULL scan (no flags)
    Null,
    /// TCP XMAS scan (FIN, PSH, URG flags)
    Xmas,
    /// UDP scan
    Udp,
}

impl ScanTechnique {
    pub const ALL: [ScanTechnique; 7] = [
        ScanTechnique::Connect,
        ScanTechnique::Syn,
        ScanTechnique::Ack,
        ScanTechnique::Fin,
        ScanTechnique::Null,
        ScanTechnique::Xmas,
        ScanTechnique::Udp,
    ];

    /// Get the name of the scan technique
    pub fn name(&self) -> &'static str {
        match self {
            ScanTechnique::Connect => "Connect",
            ScanTechnique::Syn => "SYN",
            ScanTechnique::Ack => "ACK",
            ScanTechnique::Fin => "FIN",
            ScanTechnique::Null => "NULL",
            ScanTechnique::Xmas => "XMAS",
            ScanTechnique::Udp => "UDP",
        }
    }

    /// Check if the technique requires raw sockets.
    ///
    /// UDP probes go through a connected datagram socket, which reports ICMP
    /// port-unreachable as a refused receive, so they do not need privileges.
    pub fn requires_raw_socket(&self) -> bool {
        !matches!(self, ScanTechnique::Connect | ScanTechnique::Udp)
    }

    /// Get the protocol used by this technique
    pub fn protocol(&self) -> Protocol {
        match self {
            ScanTechnique::Udp => Protocol::Udp,
            _ => Protocol::Tcp,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScanTechnique::Connect => "TCP connect scan",
            ScanTechnique::Syn => "TCP SYN scan",
            ScanTechnique::Ack => "TCP ACK scan",
            ScanTechnique::Fin => "TCP FIN scan",
            ScanTechnique::Null => "TCP NULL scan",
            ScanTechnique::Xmas => "TCP XMAS scan",
            ScanTechnique::Udp => "UDP scan",
        }
    }

    /// Get TCP flags for this scan technique
    pub fn tcp_flags(&self) -> u8 {
        match self {
            ScanTechnique::Syn => tcp_flags::SYN,
            ScanTechnique::Connect => tcp_flags::SYN,
            ScanTechnique::Fin => tcp_flags::FIN,
            ScanTechnique::Null => 0,
            ScanTechnique::Xmas => tcp_flags::FIN | tcp_flags::PSH | tcp_flags::URG,
            ScanTechnique::Ack => tcp_flags::ACK,
            ScanTechnique::Udp => 0, // Not applicable for UDP
        }
    }
}

impl std::fmt::Display for ScanTechnique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScanTechnique {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "connect" | "tcp-connect" | "tcp" => Ok(ScanTechnique::Connect),
            "syn" | "tcp-syn" => Ok(ScanTechnique::Syn),
            "ack" | "tcp-ack" => Ok(ScanTechnique::Ack),
            "fin" | "tcp-fin" => Ok(ScanTechnique::Fin),
            "null" | "tcp-null" => Ok(ScanTechnique::Null),
            "xmas" | "tcp-xmas" => Ok(ScanTechnique::Xmas),
            "udp" => Ok(ScanTechnique::Udp),
            other => Err(ScanError::ConfigError(format!(
                "unknown scan technique '{}'",
                other
            ))),
        }
    }
}

/// TCP header flag bits
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// Port state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "filtered")]
    Filtered,
    #[serde(rename = "unfiltered")]
    Unfiltered,
    #[serde(rename = "open|filtered")]
    OpenFiltered,
    /// The probe could not be carried out (resolution or send failure)
    #[serde(rename = "error")]
    Error,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
            PortState::Filtered => write!(f, "filtered"),
            PortState::Unfiltered => write!(f, "unfiltered"),
            PortState::OpenFiltered => write!(f, "open|filtered"),
            PortState::Error => write!(f, "error"),
        }
    }
}

/// Protocol enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn number(&self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_technique_flags() {
        assert_eq!(ScanTechnique::Syn.tcp_flags(), 0x02);
        assert_eq!(ScanTechnique::Fin.tcp_flags(), 0x01);
        assert_eq!(ScanTechnique::Null.tcp_flags(), 0x00);
        assert_eq!(ScanTechnique::Xmas.tcp_flags(), 0x29);
        assert_eq!(ScanTechnique::Ack.tcp_flags(), 0x10);
    }

    #[test]
    fn test_technique_parsing() {
        assert_eq!("SYN".parse::<ScanTechnique>().unwrap(), ScanTechnique::Syn);
        assert_eq!("tcp-connect".parse::<ScanTechnique>().unwrap(), ScanTechnique::Connect);
        assert!("window".parse::<ScanTechnique>().is_err());
    }

    #[test]
    fn test_raw_socket_requirements() {
        assert!(!ScanTechnique::Connect.requires_raw_socket());
        assert!(!ScanTechnique::Udp.requires_raw_socket());
        for technique in [ScanTechnique::Syn, ScanTechnique::Ack, ScanTechnique::Fin] {
            assert!(technique.requires_raw_socket());
        }
    }

    #[test]
    fn test_port_state_serialization() {
        let json = serde_json::to_string(&PortState::OpenFiltered).unwrap();
        assert_eq!(json, "\"open|filtered\"");
        assert_eq!(PortState::OpenFiltered.to_string(), "open|filtered");
    }
}
