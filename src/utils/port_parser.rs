//! Port specification parsing (`22,80,1000-2000`)

use std::collections::HashSet;

use crate::{Result, ScanError};

/// Parse a comma separated list of ports and inclusive ranges.
///
/// Duplicates are dropped, keeping the first occurrence's position.
pub fn parse_ports(port_spec: &str) -> Result<Vec<u16>> {
    let mut seen = HashSet::new();
    let mut ports = Vec::new();

    for part in port_spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (start, end) = match part.split_once('-') {
            Some((start, end)) => (parse_port(start, part)?, parse_port(end, part)?),
            None => {
                let port = parse_port(part, part)?;
                (port, port)
            }
        };
        if start > end {
            return Err(ScanError::PortRangeError(format!(
                "Start port {} cannot be greater than end port {}",
                start, end
            )));
        }

        for port in start..=end {
            if seen.insert(port) {
                ports.push(port);
            }
        }
    }

    if ports.is_empty() {
        return Err(ScanError::PortRangeError("No ports specified".to_string()));
    }
    Ok(ports)
}

fn parse_port(value: &str, part: &str) -> Result<u16> {
    let port: u16 = value
        .trim()
        .parse()
        .map_err(|e| ScanError::PortRangeError(format!("Invalid port '{}' in '{}': {}", value.trim(), part, e)))?;
    if port == 0 {
        return Err(ScanError::PortRangeError("Port 0 is not valid".to_string()));
    }
    Ok(port)
}
