//! Stress tests for cancellation under load
//! A gated executor holds probes on the wire so the exact number of in-flight
//! jobs at cancel time is known.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use uuid::Uuid;

use deimos::{
    cluster::{ClusterCoordinator, MemoryBroker},
    config::{NodeConfig, RateConfig, TaskConfig},
    network::{PortState, ScanTechnique},
    pool::WorkerPool,
    rate::AdaptiveRateController,
    scanner::{ProbeOutcome, ProbeRequest, ScanJob, TechniqueExecutor},
    task::{control::TaskControls, TaskManager, TaskStatus},
};

/// Probes block until the gate is opened
struct GatedExecutor {
    started: AtomicUsize,
    gate: Semaphore,
}

impl GatedExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        })
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn open(&self) {
        self.gate.add_permits(10_000);
    }

    async fn wait_started(&self, count: usize) {
        timeout(Duration::from_secs(5), async {
            while self.started() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("probes did not start");
    }
}

#[async_trait]
impl TechniqueExecutor for GatedExecutor {
    async fn probe(&self, request: &ProbeRequest) -> ProbeOutcome {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        ProbeOutcome::new(PortState::Open, request.technique, Duration::from_millis(1))
    }
}

fn fast_rate() -> RateConfig {
    RateConfig::default()
        .with_bounds(10.0, 1_000_000.0)
        .with_initial_rate(1_000_000.0)
        .with_burst(100_000.0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_cancel_with_1000_queued() {
    let executor = GatedExecutor::new();
    let controls = Arc::new(TaskControls::new());
    let pool = WorkerPool::new(
        5,
        1000,
        executor.clone(),
        Arc::new(AdaptiveRateController::new(fast_rate())),
        controls.clone(),
    );
    let mut results = pool.results().unwrap();
    let mut discarded = pool.discarded().unwrap();
    pool.start().unwrap();

    let task = Uuid::new_v4();
    for port in 1..=1000u16 {
        pool.submit(ScanJob::new(task, "10.0.0.5", port, ScanTechnique::Connect))
            .unwrap();
    }
    executor.wait_started(5).await;

    controls.cancel(task);
    executor.open();

    let mut dropped = 0;
    while dropped < 995 {
        timeout(Duration::from_secs(5), discarded.recv())
            .await
            .expect("discards stalled")
            .expect("discard channel closed");
        dropped += 1;
    }
    let leftover = pool.stop().await;
    assert!(leftover.is_empty());

    let mut finished = Vec::new();
    while let Some(result) = results.recv().await {
        finished.push(result);
    }
    assert_eq!(finished.len(), 5);
    assert!(finished.iter().all(|r| r.state == PortState::Open));
    assert_eq!(executor.started(), 5);
    assert_eq!(pool.stats().discarded, 995);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_cancel_keeps_only_in_flight_results() {
    let broker = Arc::new(MemoryBroker::new());
    let master = Arc::new(ClusterCoordinator::new(
        NodeConfig::master().with_node_id("master").with_heartbeat_interval(50),
        broker.clone(),
    ));
    let results = master.take_results().unwrap();
    master.start().await.unwrap();

    let executor = GatedExecutor::new();
    let worker = Arc::new(
        ClusterCoordinator::new(
            NodeConfig::worker()
                .with_node_id("w1")
                .with_pool_size(5)
                .with_queue_capacity(5)
                .with_dispatch_window(5)
                .with_heartbeat_interval(50),
            broker.clone(),
        )
        .with_executor(executor.clone())
        .with_rate_config(fast_rate()),
    );
    worker.start().await.unwrap();

    let manager = Arc::new(TaskManager::new(master.clone()));
    let ingestion = manager.clone().spawn_ingestion(results);

    let registry = master.registry();
    timeout(Duration::from_secs(2), async {
        while registry.online_nodes().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let id = manager
        .create_task(TaskConfig::new("10.0.0.5").with_ports("1-1000").with_retries(0))
        .unwrap();
    manager.start_task(id).await.unwrap();
    executor.wait_started(5).await;

    manager.cancel_task(id).await.unwrap();
    executor.open();

    let ledger = master.ledger();
    timeout(Duration::from_secs(5), async {
        while !ledger.task_counts(id).map(|c| c.is_settled()).unwrap_or(false) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ledger never settled");

    let counts = ledger.task_counts(id).unwrap();
    assert_eq!(counts.completed, 5);
    assert_eq!(counts.abandoned, 995);

    worker.stop().await.unwrap();
    master.stop().await.unwrap();
    ingestion.await.unwrap();

    assert_eq!(executor.started(), 5);
    assert_eq!(manager.get_results(id).unwrap().len(), 5);
    let report = manager.get_task_status(id).unwrap();
    assert_eq!(report.status, TaskStatus::Canceled);
    assert_eq!(report.statistics.completed_jobs, 5);
    assert_eq!(report.progress, 0.5);
}
