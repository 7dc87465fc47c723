//! Scanning technique execution
//!
//! An executor performs exactly one probe and always produces an outcome.
//! Timeouts, resets and unreachable errors are folded into the port state;
//! only failures to carry out the probe at all yield [`PortState::Error`].

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::network::protocol::ResponseAnalyzer;
use crate::network::transport::{ConnectOutcome, ProbeTransport, SystemTransport, UdpOutcome};
use crate::network::{PortState, Protocol, ScanTechnique};
use crate::scanner::udp::UdpPayloads;
use crate::scanner::ScanJob;
use crate::{Result, ScanError};

/// What to probe
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub target: String,
    pub port: u16,
    pub protocol: Protocol,
    pub technique: ScanTechnique,
    pub timeout: Duration,
    pub grab_banner: bool,
}

impl From<&ScanJob> for ProbeRequest {
    fn from(job: &ScanJob) -> Self {
        Self {
            target: job.target.clone(),
            port: job.port,
            protocol: job.protocol,
            technique: job.technique,
            timeout: job.timeout(),
            grab_banner: job.banner_grab,
        }
    }
}

/// What one probe observed
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub state: PortState,
    /// Technique actually used on the wire
    pub technique: ScanTechnique,
    pub banner: Option<Vec<u8>>,
    pub error: Option<String>,
    pub response_time: Duration,
}

impl ProbeOutcome {
    pub fn new(state: PortState, technique: ScanTechnique, response_time: Duration) -> Self {
        Self {
            state,
            technique,
            banner: None,
            error: None,
            response_time,
        }
    }

    pub fn failed(technique: ScanTechnique, error: impl Into<String>, response_time: Duration) -> Self {
        Self {
            state: PortState::Error,
            technique,
            banner: None,
            error: Some(error.into()),
            response_time,
        }
    }

    pub fn is_error(&self) -> bool {
        self.state == PortState::Error
    }
}

/// Performs one probe and classifies the response
#[async_trait]
pub trait TechniqueExecutor: Send + Sync {
    async fn probe(&self, request: &ProbeRequest) -> ProbeOutcome;
}

/// Default executor over a [`ProbeTransport`]
pub struct ProbeEngine {
    transport: Arc<dyn ProbeTransport>,
    payloads: UdpPayloads,
    banner_timeout: Duration,
    fallback_reported: AtomicBool,
}

impl ProbeEngine {
    pub fn new(transport: Arc<dyn ProbeTransport>) -> Self {
        Self {
            transport,
            payloads: UdpPayloads::new(),
            banner_timeout: Duration::from_millis(500),
            fallback_reported: AtomicBool::new(false),
        }
    }

    /// Engine over the host network stack
    pub fn system() -> Self {
        Self::new(Arc::new(SystemTransport::new()))
    }

    pub fn with_banner_timeout(mut self, banner_timeout: Duration) -> Self {
        self.banner_timeout = banner_timeout;
        self
    }

    /// Raw techniques degrade to a connect probe when raw sockets are unavailable
    fn effective_technique(&self, requested: ScanTechnique) -> ScanTechnique {
        if requested.requires_raw_socket() && !self.transport.supports_raw() {
            if !self.fallback_reported.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "raw sockets unavailable, falling back to connect probes requested={}",
                    requested.name()
                );
            }
            return ScanTechnique::Connect;
        }
        requested
    }

    async fn execute(
        &self,
        technique: ScanTechnique,
        addr: SocketAddr,
        request: &ProbeRequest,
    ) -> Result<(PortState, Option<Vec<u8>>)> {
        match technique {
            ScanTechnique::Connect => {
                let banner_wait = request
                    .grab_banner
                    .then(|| self.banner_timeout.min(request.timeout));
                let outcome = self.transport.connect(addr, request.timeout, banner_wait).await?;
                let state = ResponseAnalyzer::analyze_connect(&outcome);
                let banner = match outcome {
                    ConnectOutcome::Connected { banner } => banner,
                    _ => None,
                };
                Ok((state, banner))
            }
            ScanTechnique::Udp => {
                let payload = self.payloads.payload_for(addr.port());
                let outcome = self.transport.send_udp(addr, payload, request.timeout).await?;
                let state = ResponseAnalyzer::analyze_udp_response(&outcome);
                let banner = match outcome {
                    UdpOutcome::Response(data) if !data.is_empty() => Some(data),
                    _ => None,
                };
                Ok((state, banner))
            }
            raw => {
                let reply = self
                    .transport
                    .send_tcp(addr, raw.tcp_flags(), request.timeout)
                    .await?;
                Ok((ResponseAnalyzer::analyze_tcp_response(raw, reply.as_ref()), None))
            }
        }
    }
}

#[async_trait]
impl TechniqueExecutor for ProbeEngine {
    async fn probe(&self, request: &ProbeRequest) -> ProbeOutcome {
        let start = Instant::now();
        let technique = self.effective_technique(request.technique);

        let addr = match resolve(&request.target, request.port).await {
            Ok(addr) => addr,
            Err(e) => return ProbeOutcome::failed(technique, e.to_string(), start.elapsed()),
        };

        match self.execute(technique, addr, request).await {
            Ok((state, banner)) => {
                let mut outcome = ProbeOutcome::new(state, technique, start.elapsed());
                outcome.banner = banner;
                outcome
            }
            Err(e) => {
                log::debug!("probe failed target={} port={} error={}", request.target, request.port, e);
                ProbeOutcome::failed(technique, e.to_string(), start.elapsed())
            }
        }
    }
}

/// Resolve a literal address or host name to the first usable socket address
pub async fn resolve(target: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = tokio::net::lookup_host((target, port))
        .await
        .map_err(|e| ScanError::InvalidTarget(format!("cannot resolve {}: {}", target, e)))?;
    addrs
        .next()
        .ok_or_else(|| ScanError::InvalidTarget(format!("{} has no addresses", target)))
}
