//! Target parsing for single hosts, lists and CIDR blocks
//!
//! Targets are expanded to individual address strings at task creation.
//! Host names are validated but not resolved here; resolution happens at
//! probe time so a resolution failure becomes an `error` result for that job
//! instead of rejecting the whole task.

use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::{Result, ScanError};

/// Default cap on addresses produced by one task's target list
pub const DEFAULT_MAX_ADDRESSES: usize = 65_536;

/// Target parser with CIDR support
#[derive(Debug, Clone)]
pub struct TargetParser {
    max_addresses: usize,
}

impl Default for TargetParser {
    fn default() -> Self {
        Self {
            max_addresses: DEFAULT_MAX_ADDRESSES,
        }
    }
}

impl TargetParser {
    pub fn new(max_addresses: usize) -> Self {
        Self { max_addresses }
    }

    /// Expand a comma or whitespace separated list, preserving first-seen order
    pub fn parse_list(&self, specs: &[String]) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for spec in specs {
            for item in spec.split(|c: char| c == ',' || c.is_whitespace()) {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                for target in self.parse_target(item)? {
                    if seen.insert(target.clone()) {
                        if targets.len() >= self.max_addresses {
                            return Err(ScanError::InvalidTarget(format!(
                                "target list expands beyond {} addresses",
                                self.max_addresses
                            )));
                        }
                        targets.push(target);
                    }
                }
            }
        }

        if targets.is_empty() {
            return Err(ScanError::InvalidTarget("Target cannot be empty".to_string()));
        }
        Ok(targets)
    }

    /// Expand one target: an address, a CIDR block or a host name
    pub fn parse_target(&self, target: &str) -> Result<Vec<String>> {
        let target = target.trim();

        if target.contains('/') {
            let network: IpNetwork = target
                .parse()
                .map_err(|e| ScanError::InvalidTarget(format!("invalid CIDR '{}': {}", target, e)))?;
            return self.expand_network(network);
        }

        if let Ok(ip) = target.parse::<IpAddr>() {
            return Ok(vec![ip.to_string()]);
        }

        validate_hostname(target)?;
        Ok(vec![target.to_ascii_lowercase()])
    }

    fn expand_network(&self, network: IpNetwork) -> Result<Vec<String>> {
        let host_bits = match network {
            IpNetwork::V4(net) => 32 - net.prefix() as u32,
            IpNetwork::V6(net) => 128 - net.prefix() as u32,
        };
        if host_bits >= 64 || (1u64 << host_bits) > self.max_addresses as u64 {
            return Err(ScanError::InvalidTarget(format!(
                "CIDR network too large: {} (max {} addresses)",
                network, self.max_addresses
            )));
        }

        let addresses = match network {
            // Network and broadcast addresses are not hosts on ordinary subnets
            IpNetwork::V4(net) if net.prefix() <= 30 => net
                .iter()
                .filter(|ip| *ip != net.network() && *ip != net.broadcast())
                .map(|ip| ip.to_string())
                .collect(),
            IpNetwork::V4(net) => net.iter().map(|ip| ip.to_string()).collect(),
            IpNetwork::V6(net) => net.iter().map(|ip| ip.to_string()).collect(),
        };
        Ok(addresses)
    }
}

fn validate_hostname(target: &str) -> Result<()> {
    if target.is_empty() {
        return Err(ScanError::InvalidTarget("Target cannot be empty".to_string()));
    }
    if target.len() > 253 {
        return Err(ScanError::InvalidTarget("Target too long (max 253 characters)".to_string()));
    }
    let valid_labels = target.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    });
    if !valid_labels {
        return Err(ScanError::InvalidTarget(format!("Invalid target format: {}", target)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_addresses() {
        let parser = TargetParser::default();
        assert_eq!(parser.parse_target("10.0.0.5").unwrap(), vec!["10.0.0.5"]);
        assert_eq!(parser.parse_target("2001:db8::1").unwrap(), vec!["2001:db8::1"]);
    }

    #[test]
    fn test_ipv4_cidr_skips_network_and_broadcast() {
        let parser = TargetParser::default();
        let hosts = parser.parse_target("192.168.1.0/30").unwrap();
        assert_eq!(hosts, vec!["192.168.1.1", "192.168.1.2"]);

        let pair = parser.parse_target("192.168.1.0/31").unwrap();
        assert_eq!(pair.len(), 2);
    }

    #[test]
    fn test_oversized_cidr_rejected() {
        let parser = TargetParser::new(256);
        assert!(parser.parse_target("10.0.0.0/24").is_ok());
        assert!(matches!(
            parser.parse_target("10.0.0.0/16"),
            Err(ScanError::InvalidTarget(_))
        ));
        assert!(parser.parse_target("2001:db8::/32").is_err());
    }

    #[test]
    fn test_list_dedups_and_splits() {
        let parser = TargetParser::default();
        let targets = parser
            .parse_list(&list(&["10.0.0.1, 10.0.0.2", "10.0.0.1 scanme.example.org"]))
            .unwrap();
        assert_eq!(targets, vec!["10.0.0.1", "10.0.0.2", "scanme.example.org"]);
    }

    #[test]
    fn test_invalid_targets() {
        let parser = TargetParser::default();
        assert!(parser.parse_list(&list(&["  "])).is_err());
        assert!(parser.parse_target("bad host!").is_err());
        assert!(parser.parse_target("-leading.example").is_err());
        assert!(parser.parse_target("10.0.0.0/40").is_err());
    }

    #[test]
    fn test_list_cap() {
        let parser = TargetParser::new(3);
        assert!(parser.parse_list(&list(&["10.0.0.1,10.0.0.2,10.0.0.3"])).is_ok());
        assert!(parser.parse_list(&list(&["10.0.0.1,10.0.0.2,10.0.0.3,10.0.0.4"])).is_err());
    }
}
