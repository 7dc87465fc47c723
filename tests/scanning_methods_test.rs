//! Technique classification against simulated responders

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use deimos::{
    network::transport::{SimulatedPort, SimulatedTransport},
    network::{PortState, Protocol, ScanTechnique},
    scanner::{ProbeEngine, ProbeRequest, ScanJob, TechniqueExecutor},
};

async fn classify(transport: SimulatedTransport, port: u16, technique: ScanTechnique) -> PortState {
    let engine = ProbeEngine::new(Arc::new(transport));
    let job = ScanJob::new(Uuid::new_v4(), "10.0.0.5", port, technique).with_timeout(30);
    engine.probe(&ProbeRequest::from(&job)).await.state
}

#[tokio::test]
async fn test_rst_on_all_responder() {
    let expected = [
        (ScanTechnique::Connect, PortState::Closed),
        (ScanTechnique::Syn, PortState::Closed),
        (ScanTechnique::Ack, PortState::Unfiltered),
        (ScanTechnique::Fin, PortState::Closed),
        (ScanTechnique::Null, PortState::Closed),
        (ScanTechnique::Xmas, PortState::Closed),
        (ScanTechnique::Udp, PortState::Closed),
    ];
    for (technique, state) in expected {
        assert_eq!(
            classify(SimulatedTransport::rst_on_all(), 80, technique).await,
            state,
            "{} against RST-on-all",
            technique
        );
    }
}

#[tokio::test]
async fn test_silent_responder() {
    let expected = [
        (ScanTechnique::Connect, PortState::Filtered),
        (ScanTechnique::Syn, PortState::Filtered),
        (ScanTechnique::Ack, PortState::Filtered),
        (ScanTechnique::Fin, PortState::OpenFiltered),
        (ScanTechnique::Null, PortState::OpenFiltered),
        (ScanTechnique::Xmas, PortState::OpenFiltered),
        (ScanTechnique::Udp, PortState::OpenFiltered),
    ];
    for (technique, state) in expected {
        assert_eq!(
            classify(SimulatedTransport::silent(), 80, technique).await,
            state,
            "{} against a silent host",
            technique
        );
    }
}

#[tokio::test]
async fn test_open_port_responder() {
    let open = || SimulatedTransport::rst_on_all().with_port(53, SimulatedPort::Open { banner: None });

    assert_eq!(classify(open(), 53, ScanTechnique::Connect).await, PortState::Open);
    assert_eq!(classify(open(), 53, ScanTechnique::Syn).await, PortState::Open);
    // Stateless firewall-less host: ACK always draws a RST
    assert_eq!(classify(open(), 53, ScanTechnique::Ack).await, PortState::Unfiltered);
    // RFC 793 hosts stay silent on open ports
    assert_eq!(classify(open(), 53, ScanTechnique::Fin).await, PortState::OpenFiltered);
}

#[tokio::test]
async fn test_udp_answer_means_open() {
    let transport = SimulatedTransport::rst_on_all().with_port(
        53,
        SimulatedPort::Open {
            banner: Some(vec![0x12, 0x34, 0x81, 0x80]),
        },
    );
    let engine = ProbeEngine::new(Arc::new(transport));
    let job = ScanJob::new(Uuid::new_v4(), "10.0.0.5", 53, ScanTechnique::Udp).with_timeout(30);
    assert_eq!(job.protocol, Protocol::Udp);

    let outcome = engine.probe(&ProbeRequest::from(&job)).await;
    assert_eq!(outcome.state, PortState::Open);
    assert_eq!(outcome.technique, ScanTechnique::Udp);
}

#[tokio::test]
async fn test_raw_techniques_fall_back_without_privileges() {
    let transport = SimulatedTransport::rst_on_all()
        .with_port(443, SimulatedPort::Open { banner: None })
        .without_raw();
    let engine = ProbeEngine::new(Arc::new(transport));

    for technique in [ScanTechnique::Syn, ScanTechnique::Xmas, ScanTechnique::Ack] {
        let job = ScanJob::new(Uuid::new_v4(), "10.0.0.5", 443, technique).with_timeout(30);
        let outcome = engine.probe(&ProbeRequest::from(&job)).await;
        assert_eq!(outcome.technique, ScanTechnique::Connect);
        assert_eq!(outcome.state, PortState::Open);
    }
}

#[tokio::test]
async fn test_dropped_probe_waits_for_timeout() {
    let engine = ProbeEngine::new(Arc::new(SimulatedTransport::silent()));
    let job = ScanJob::new(Uuid::new_v4(), "10.0.0.5", 8080, ScanTechnique::Syn).with_timeout(60);

    let outcome = engine.probe(&ProbeRequest::from(&job)).await;
    assert_eq!(outcome.state, PortState::Filtered);
    assert!(outcome.response_time >= Duration::from_millis(50));
}
