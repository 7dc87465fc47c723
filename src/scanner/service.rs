//! Best-effort service identification from port numbers and banners

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::network::protocol::ServiceDatabase;
use crate::network::Protocol;

struct Fingerprint {
    service: &'static str,
    product: &'static str,
    pattern: Regex,
}

static FINGERPRINTS: Lazy<Vec<Fingerprint>> = Lazy::new(|| {
    [
        ("ssh", "OpenSSH", r"OpenSSH[_-](\d+[\.\d]*\w*)"),
        ("ssh", "Dropbear", r"dropbear_(\d+[\.\d]*)"),
        ("http", "Apache", r"Apache(?:/(\d+[\.\d]+))?"),
        ("http", "nginx", r"nginx(?:/(\d+[\.\d]+))?"),
        ("http", "Microsoft-IIS", r"Microsoft-IIS/(\d+[\.\d]*)"),
        ("ftp", "vsftpd", r"vsftpd\s+\(?(\d+[\.\d]+)"),
        ("ftp", "ProFTPD", r"ProFTPD\s+(\d+[\.\d]+\w*)"),
        ("smtp", "Postfix", r"ESMTP Postfix(?:\s+\(?(\d+[\.\d]+))?"),
        ("mysql", "MySQL", r"(\d+\.\d+\.\d+)[\w.-]*\x00.*mysql_native_password"),
        ("redis", "Redis", r"redis_version:(\d+[\.\d]+)"),
    ]
    .into_iter()
    .filter_map(|(service, product, pattern)| {
        Regex::new(pattern).ok().map(|pattern| Fingerprint {
            service,
            product,
            pattern,
        })
    })
    .collect()
});

/// What a banner (or bare port number) told us about the listening service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMatch {
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

#[derive(Clone, Default)]
pub struct ServiceIdentifier {
    ports: ServiceDatabase,
}

impl ServiceIdentifier {
    pub fn new() -> Self {
        Self {
            ports: ServiceDatabase::new(),
        }
    }

    /// Banner fingerprints win over the well-known port table
    pub fn identify(&self, port: u16, protocol: Protocol, banner: Option<&str>) -> ServiceMatch {
        if let Some(banner) = banner {
            for fingerprint in FINGERPRINTS.iter() {
                if let Some(captures) = fingerprint.pattern.captures(banner) {
                    return ServiceMatch {
                        service: Some(fingerprint.service.to_string()),
                        product: Some(fingerprint.product.to_string()),
                        version: captures.get(1).map(|m| m.as_str().to_string()),
                    };
                }
            }
        }

        ServiceMatch {
            service: self.ports.lookup(port, protocol).map(str::to_string),
            product: None,
            version: None,
        }
    }
}

/// Printable form of a raw banner, trimmed to its first line
pub fn sanitize_banner(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())?;
    let printable: String = line
        .chars()
        .map(|c| if c.is_control() { '.' } else { c })
        .take(256)
        .collect();
    Some(printable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openssh_banner() {
        let identifier = ServiceIdentifier::new();
        let found = identifier.identify(2222, Protocol::Tcp, Some("SSH-2.0-OpenSSH_8.9p1 Ubuntu-3"));
        assert_eq!(found.service.as_deref(), Some("ssh"));
        assert_eq!(found.product.as_deref(), Some("OpenSSH"));
        assert_eq!(found.version.as_deref(), Some("8.9p1"));
    }

    #[test]
    fn test_http_server_header() {
        let identifier = ServiceIdentifier::new();
        let found = identifier.identify(80, Protocol::Tcp, Some("HTTP/1.1 200 OK Server: nginx/1.24.0"));
        assert_eq!(found.product.as_deref(), Some("nginx"));
        assert_eq!(found.version.as_deref(), Some("1.24.0"));
    }

    #[test]
    fn test_port_fallback() {
        let identifier = ServiceIdentifier::new();
        let found = identifier.identify(3306, Protocol::Tcp, None);
        assert_eq!(found.service.as_deref(), Some("mysql"));
        assert!(found.version.is_none());

        let unknown = identifier.identify(40000, Protocol::Tcp, Some("garbage"));
        assert_eq!(unknown, ServiceMatch::default());
    }

    #[test]
    fn test_sanitize_banner() {
        assert_eq!(
            sanitize_banner(b"\r\n220 ProFTPD 1.3.5 Server\r\nmore").as_deref(),
            Some("220 ProFTPD 1.3.5 Server")
        );
        assert_eq!(sanitize_banner(b"\x00\x01").as_deref(), Some(".."));
        assert_eq!(sanitize_banner(b"  \r\n"), None);
    }
}
