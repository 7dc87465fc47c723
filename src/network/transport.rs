//! Probe transports
//!
//! A transport moves single probes on and off the wire and reports what came
//! back, without interpreting it. Classification into port states lives in
//! [`ResponseAnalyzer`](crate::network::protocol::ResponseAnalyzer).

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::network::packet::{PacketParser, TcpPacketBuilder};
use crate::network::protocol::NetworkUtils;
use crate::network::socket::RawSocket;
use crate::network::tcp_flags;
use crate::{Result, ScanError};

const BANNER_BUFFER: usize = 1024;
const HTTP_PORTS: [u16; 5] = [80, 8000, 8008, 8080, 8888];

/// Flags of the TCP segment that answered a raw probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpReply {
    pub flags: u8,
}

impl TcpReply {
    pub fn is_syn_ack(&self) -> bool {
        let syn_ack = tcp_flags::SYN | tcp_flags::ACK;
        self.flags & syn_ack == syn_ack
    }

    pub fn is_rst(&self) -> bool {
        self.flags & tcp_flags::RST != 0
    }
}

/// Result of a full TCP handshake attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected { banner: Option<Vec<u8>> },
    Refused,
    TimedOut,
    /// Host or network unreachable, or any other remote-side failure
    Unreachable(String),
}

/// Result of a UDP datagram probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpOutcome {
    Response(Vec<u8>),
    PortUnreachable,
    NoResponse,
}

/// Moves probes to a target and reports raw replies
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Whether crafted TCP segments can be sent
    fn supports_raw(&self) -> bool;

    /// Full handshake, optionally reading a banner for `banner_timeout`
    async fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        banner_timeout: Option<Duration>,
    ) -> Result<ConnectOutcome>;

    /// Send one crafted segment with `flags`, wait up to `timeout` for the answer
    async fn send_tcp(&self, addr: SocketAddr, flags: u8, timeout: Duration) -> Result<Option<TcpReply>>;

    /// Send one datagram and wait up to `timeout` for a reply or an ICMP error
    async fn send_udp(&self, addr: SocketAddr, payload: &[u8], timeout: Duration) -> Result<UdpOutcome>;
}

/// Transport backed by the host network stack
pub struct SystemTransport {
    raw_available: bool,
    source_ip: Option<Ipv4Addr>,
}

impl SystemTransport {
    /// Probe the host once for raw socket privileges and a routable source address
    pub fn new() -> Self {
        let raw_available = RawSocket::is_available();
        let source_ip = if raw_available {
            NetworkUtils::get_local_ip()
                .map_err(|e| log::warn!("cannot determine local address for raw probes: {}", e))
                .ok()
        } else {
            None
        };

        Self {
            raw_available: raw_available && source_ip.is_some(),
            source_ip,
        }
    }

    /// Transport that never attempts raw sockets
    pub fn connect_only() -> Self {
        Self {
            raw_available: false,
            source_ip: None,
        }
    }
}

impl Default for SystemTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProbeTransport for SystemTransport {
    fn supports_raw(&self) -> bool {
        self.raw_available
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        banner_timeout: Option<Duration>,
    ) -> Result<ConnectOutcome> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Err(_) => return Ok(ConnectOutcome::TimedOut),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Ok(ConnectOutcome::Refused)
            }
            Ok(Err(e)) if is_local_exhaustion(&e) => {
                return Err(ScanError::NetworkError(format!("local socket failure: {}", e)))
            }
            Ok(Err(e)) => return Ok(ConnectOutcome::Unreachable(e.to_string())),
            Ok(Ok(stream)) => stream,
        };

        let banner = match banner_timeout {
            Some(wait) => grab_banner(stream, addr.port(), wait).await,
            None => None,
        };
        Ok(ConnectOutcome::Connected { banner })
    }

    async fn send_tcp(&self, addr: SocketAddr, flags: u8, timeout: Duration) -> Result<Option<TcpReply>> {
        let (SocketAddr::V4(v4), Some(source_ip)) = (addr, self.source_ip) else {
            return Err(ScanError::RawSocketError(
                "crafted TCP probes need an IPv4 target and a local IPv4 address".to_string(),
            ));
        };

        tokio::task::spawn_blocking(move || {
            raw_tcp_exchange(source_ip, *v4.ip(), v4.port(), flags, timeout)
        })
        .await
        .map_err(|e| ScanError::NetworkError(format!("raw probe task failed: {}", e)))?
    }

    async fn send_udp(&self, addr: SocketAddr, payload: &[u8], timeout: Duration) -> Result<UdpOutcome> {
        let bind = match addr.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        socket.send(payload).await?;

        let mut buf = vec![0u8; 2048];
        match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
            Err(_) => Ok(UdpOutcome::NoResponse),
            Ok(Ok(size)) => {
                buf.truncate(size);
                Ok(UdpOutcome::Response(buf))
            }
            // Linux reports ICMP port-unreachable on a connected socket this way
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(UdpOutcome::PortUnreachable),
            Ok(Err(e)) => Err(ScanError::NetworkError(format!("udp receive: {}", e))),
        }
    }
}

fn is_local_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS))
}

async fn grab_banner(mut stream: TcpStream, port: u16, wait: Duration) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; BANNER_BUFFER];

    if let Ok(Ok(size)) = tokio::time::timeout(wait, stream.read(&mut buf)).await {
        if size > 0 {
            buf.truncate(size);
            return Some(buf);
        }
    }

    // HTTP servers speak only when spoken to
    if HTTP_PORTS.contains(&port) {
        if stream.write_all(b"HEAD / HTTP/1.0\r\n\r\n").await.is_err() {
            return None;
        }
        if let Ok(Ok(size)) = tokio::time::timeout(wait, stream.read(&mut buf)).await {
            if size > 0 {
                buf.truncate(size);
                return Some(buf);
            }
        }
    }
    None
}

fn raw_tcp_exchange(
    source_ip: Ipv4Addr,
    target: Ipv4Addr,
    port: u16,
    flags: u8,
    timeout: Duration,
) -> Result<Option<TcpReply>> {
    let socket = RawSocket::new_tcp()?;
    let builder = TcpPacketBuilder::new(source_ip, target, NetworkUtils::random_source_port(), port)
        .flags(flags);
    let packet = builder.build()?;
    socket.send_to(&packet, SocketAddr::new(IpAddr::V4(target), 0))?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1500];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        socket.set_read_timeout(deadline - now)?;

        let Some(size) = socket.recv(&mut buf)? else {
            return Ok(None);
        };
        if let Some(response) = PacketParser::parse_tcp_response(&buf[..size]) {
            if response.answers(target, port, builder.source_port()) {
                return Ok(Some(TcpReply { flags: response.flags }));
            }
        }
    }
}

/// Behaviour of one simulated port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedPort {
    /// Accepts connections, answers SYN with SYN-ACK, stays silent to FIN/NULL/XMAS
    Open { banner: Option<Vec<u8>> },
    /// Answers everything with RST (or ICMP port-unreachable for UDP)
    Closed,
    /// Drops every probe
    Dropped,
}

/// In-process responder used for dry runs and tests
pub struct SimulatedTransport {
    ports: HashMap<u16, SimulatedPort>,
    default: SimulatedPort,
    latency: Duration,
    raw: bool,
    probes: AtomicUsize,
}

impl SimulatedTransport {
    pub fn new(default: SimulatedPort) -> Self {
        Self {
            ports: HashMap::new(),
            default,
            latency: Duration::from_millis(1),
            raw: true,
            probes: AtomicUsize::new(0),
        }
    }

    /// Host that resets every TCP probe
    pub fn rst_on_all() -> Self {
        Self::new(SimulatedPort::Closed)
    }

    /// Host that drops every probe
    pub fn silent() -> Self {
        Self::new(SimulatedPort::Dropped)
    }

    pub fn with_port(mut self, port: u16, behaviour: SimulatedPort) -> Self {
        self.ports.insert(port, behaviour);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Pretend raw sockets are not permitted
    pub fn without_raw(mut self) -> Self {
        self.raw = false;
        self
    }

    /// Number of probes that reached the responder
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    async fn behaviour(&self, port: u16) -> SimulatedPort {
        self.probes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.ports.get(&port).cloned().unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl ProbeTransport for SimulatedTransport {
    fn supports_raw(&self) -> bool {
        self.raw
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        banner_timeout: Option<Duration>,
    ) -> Result<ConnectOutcome> {
        match self.behaviour(addr.port()).await {
            SimulatedPort::Open { banner } => Ok(ConnectOutcome::Connected {
                banner: banner_timeout.and(banner),
            }),
            SimulatedPort::Closed => Ok(ConnectOutcome::Refused),
            SimulatedPort::Dropped => {
                tokio::time::sleep(timeout).await;
                Ok(ConnectOutcome::TimedOut)
            }
        }
    }

    async fn send_tcp(&self, addr: SocketAddr, flags: u8, timeout: Duration) -> Result<Option<TcpReply>> {
        if !self.raw {
            return Err(ScanError::PermissionError("Permission denied for raw socket".to_string()));
        }

        let reply = match self.behaviour(addr.port()).await {
            SimulatedPort::Open { .. } if flags & tcp_flags::SYN != 0 => Some(TcpReply {
                flags: tcp_flags::SYN | tcp_flags::ACK,
            }),
            SimulatedPort::Open { .. } if flags == tcp_flags::ACK => Some(TcpReply { flags: tcp_flags::RST }),
            SimulatedPort::Open { .. } => None,
            SimulatedPort::Closed => Some(TcpReply {
                flags: tcp_flags::RST | tcp_flags::ACK,
            }),
            SimulatedPort::Dropped => None,
        };

        if reply.is_none() {
            tokio::time::sleep(timeout).await;
        }
        Ok(reply)
    }

    async fn send_udp(&self, addr: SocketAddr, _payload: &[u8], timeout: Duration) -> Result<UdpOutcome> {
        match self.behaviour(addr.port()).await {
            SimulatedPort::Open { banner } => Ok(UdpOutcome::Response(banner.unwrap_or_default())),
            SimulatedPort::Closed => Ok(UdpOutcome::PortUnreachable),
            SimulatedPort::Dropped => {
                tokio::time::sleep(timeout).await;
                Ok(UdpOutcome::NoResponse)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), port)
    }

    #[test]
    fn test_tcp_reply_flags() {
        assert!(TcpReply { flags: 0x12 }.is_syn_ack());
        assert!(!TcpReply { flags: 0x02 }.is_syn_ack());
        assert!(TcpReply { flags: 0x14 }.is_rst());
    }

    #[tokio::test]
    async fn test_simulated_connect() {
        let transport = SimulatedTransport::silent()
            .with_port(22, SimulatedPort::Open { banner: Some(b"SSH-2.0-OpenSSH_8.9\r\n".to_vec()) })
            .with_port(25, SimulatedPort::Closed);
        let wait = Duration::from_millis(20);

        let open = transport.connect(addr(22), wait, Some(wait)).await.unwrap();
        assert!(matches!(open, ConnectOutcome::Connected { banner: Some(_) }));

        let no_banner = transport.connect(addr(22), wait, None).await.unwrap();
        assert_eq!(no_banner, ConnectOutcome::Connected { banner: None });

        assert_eq!(transport.connect(addr(25), wait, None).await.unwrap(), ConnectOutcome::Refused);
        assert_eq!(transport.connect(addr(443), wait, None).await.unwrap(), ConnectOutcome::TimedOut);
        assert_eq!(transport.probe_count(), 4);
    }

    #[tokio::test]
    async fn test_simulated_raw_disabled() {
        let transport = SimulatedTransport::rst_on_all().without_raw();
        let err = transport
            .send_tcp(addr(80), tcp_flags::SYN, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::PermissionError(_)));
    }

    #[tokio::test]
    async fn test_udp_against_closed_local_port() {
        // Bind then drop to find a port nobody listens on
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let transport = SystemTransport::connect_only();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let outcome = transport
            .send_udp(target, b"Hello\n", Duration::from_millis(300))
            .await
            .unwrap();
        assert!(matches!(outcome, UdpOutcome::PortUnreachable | UdpOutcome::NoResponse));
    }

    #[tokio::test]
    async fn test_connect_to_local_listener_reads_banner() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"220 mail ESMTP Postfix\r\n").await;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        let transport = SystemTransport::connect_only();
        let outcome = transport
            .connect(target, Duration::from_secs(1), Some(Duration::from_millis(500)))
            .await
            .unwrap();
        match outcome {
            ConnectOutcome::Connected { banner: Some(banner) } => {
                assert!(String::from_utf8_lossy(&banner).contains("Postfix"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
