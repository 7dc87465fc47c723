//! Integration tests for a deimos cluster running in-process

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_test::assert_ok;

use deimos::{
    cluster::{
        Broker, ClusterCoordinator, Heartbeat, JobState, MemoryBroker, NodeLifecycle, NodeRole, NodeStatus,
        WorkerEvent,
    },
    config::{NodeConfig, RateConfig, TaskConfig},
    network::transport::{SimulatedPort, SimulatedTransport},
    network::PortState,
    scanner::{ProbeEngine, ScanResult},
    task::{TaskManager, TaskStatus},
};

fn fast_rate() -> RateConfig {
    RateConfig::default()
        .with_bounds(10.0, 100_000.0)
        .with_initial_rate(100_000.0)
        .with_burst(10_000.0)
}

fn master(broker: Arc<MemoryBroker>) -> Arc<ClusterCoordinator> {
    Arc::new(ClusterCoordinator::new(
        NodeConfig::master()
            .with_node_id("master")
            .with_heartbeat_interval(50)
            .with_dispatch_retries(20, 10),
        broker,
    ))
}

fn worker(broker: Arc<MemoryBroker>, id: &str, transport: SimulatedTransport) -> Arc<ClusterCoordinator> {
    Arc::new(
        ClusterCoordinator::new(
            NodeConfig::worker()
                .with_node_id(id)
                .with_pool_size(8)
                .with_queue_capacity(16)
                .with_dispatch_window(16)
                .with_heartbeat_interval(50),
            broker,
        )
        .with_executor(Arc::new(ProbeEngine::new(Arc::new(transport))))
        .with_rate_config(fast_rate()),
    )
}

async fn wait_for_workers(master: &ClusterCoordinator, count: usize) {
    let registry = master.registry();
    timeout(Duration::from_secs(2), async {
        while registry.online_nodes().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("workers did not register");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_connect_scan() {
    let broker = Arc::new(MemoryBroker::new());
    let master = master(broker.clone());
    let results = master.take_results().unwrap();
    master.start().await.unwrap();

    // Accepts 22 and 80, drops 443
    let transport = SimulatedTransport::rst_on_all()
        .with_port(22, SimulatedPort::Open { banner: Some(b"SSH-2.0-OpenSSH_9.6\r\n".to_vec()) })
        .with_port(80, SimulatedPort::Open { banner: None })
        .with_port(443, SimulatedPort::Dropped);
    let worker = worker(broker.clone(), "w1", transport);
    worker.start().await.unwrap();
    wait_for_workers(&master, 1).await;

    let manager = Arc::new(TaskManager::new(master.clone()));
    let ingestion = manager.clone().spawn_ingestion(results);

    let id = manager
        .create_task(
            TaskConfig::new("10.0.0.5")
                .with_ports("22,80,443")
                .with_timeout(200)
                .with_retries(0),
        )
        .unwrap();
    assert_eq!(manager.get_task_status(id).unwrap().status, TaskStatus::Pending);

    manager.start_task(id).await.unwrap();
    let report = timeout(Duration::from_secs(5), manager.wait_for_completion(id))
        .await
        .expect("task did not finish")
        .unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.progress, 100.0);

    let results = manager.get_results(id).unwrap();
    let states: Vec<(u16, PortState)> = results.iter().map(|r| (r.port, r.state)).collect();
    assert_eq!(
        states,
        vec![(22, PortState::Open), (80, PortState::Open), (443, PortState::Filtered)]
    );
    assert_eq!(results[0].service.as_deref(), Some("ssh"));
    assert!(results.iter().all(|r| r.node_id.as_deref() == Some("w1")));

    let path: Vec<TaskStatus> = manager.get_task(id).unwrap().history.iter().map(|t| t.to).collect();
    assert_eq!(path, vec![TaskStatus::Running, TaskStatus::Completed]);

    let stats = report.statistics;
    assert_eq!((stats.open, stats.filtered, stats.closed), (2, 1, 0));

    assert!(master.ledger().task_counts(id).is_some());
    manager.delete_task(id).unwrap();
    assert!(master.ledger().task_counts(id).is_none());
    assert!(manager.list_tasks().is_empty());

    worker.stop().await.unwrap();
    master.stop().await.unwrap();
    ingestion.await.unwrap();
    assert_eq!(worker.lifecycle(), NodeLifecycle::Stopped);
    assert_eq!(master.lifecycle(), NodeLifecycle::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jobs_of_dead_node_are_reassigned() {
    let broker = Arc::new(MemoryBroker::new());
    let master = master(broker.clone());
    let results = master.take_results().unwrap();
    master.start().await.unwrap();

    let manager = Arc::new(TaskManager::new(master.clone()));
    let ingestion = manager.clone().spawn_ingestion(results);

    // A node that registers, receives work, then goes silent
    let ghost = Heartbeat {
        node_id: "ghost".to_string(),
        role: NodeRole::Worker,
        address: "10.9.9.9".to_string(),
        status: NodeStatus::Online,
        load: 0.0,
        capacity: 4,
        max_pending: 20,
        active_jobs: 0,
        cpu_usage: None,
        memory_bytes: None,
        total_scans: 0,
        failed_scans: 0,
        timestamp: Utc::now(),
    };
    broker.publish_heartbeat(&ghost, Duration::from_millis(300)).await.unwrap();
    wait_for_workers(&master, 1).await;

    let id = manager
        .create_task(TaskConfig::new("10.0.0.5").with_ports("1-20").with_timeout(50).with_retries(0))
        .unwrap();
    manager.start_task(id).await.unwrap();

    timeout(Duration::from_secs(2), async {
        while broker.queue_len("ghost").await.unwrap() < 20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("jobs never reached the ghost node");

    // The ghost picked up one job before dying; its result shows up late
    let stolen = broker.pop_job("ghost", Duration::ZERO).await.unwrap().unwrap();

    let healthy = worker(
        broker.clone(),
        "w2",
        SimulatedTransport::rst_on_all().with_port(stolen.port, SimulatedPort::Open { banner: None }),
    );
    healthy.start().await.unwrap();

    let report = timeout(Duration::from_secs(5), manager.wait_for_completion(id))
        .await
        .expect("reassigned jobs never finished")
        .unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.statistics.completed_jobs, 20);
    assert_eq!(broker.queue_len("ghost").await.unwrap(), 0);
    assert_eq!(master.registry().get("ghost").unwrap().status, NodeStatus::Offline);

    let results = manager.get_results(id).unwrap();
    assert!(results.iter().all(|r| r.node_id.as_deref() == Some("w2")));
    let replacement = results.iter().find(|r| r.port == stolen.port).unwrap().clone();
    assert_eq!(replacement.state, PortState::Open);
    assert!(replacement.sequence > stolen.sequence);

    // Stale duplicate from the node presumed dead must not regress the view
    let mut late = ScanResult::for_job(&stolen, PortState::Closed);
    late.node_id = Some("ghost".to_string());
    broker.publish_event(&WorkerEvent::Finished(late)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let after = manager.get_task_status(id).unwrap();
    assert_eq!(after.statistics.completed_jobs, 20);
    assert_eq!(after.statistics.open, 1);
    assert_eq!(after.statistics.result_count, 21);
    assert_eq!(after.progress, 100.0);
    let kept = manager
        .get_results(id)
        .unwrap()
        .into_iter()
        .find(|r| r.port == stolen.port)
        .unwrap();
    assert_eq!(kept, replacement);

    healthy.stop().await.unwrap();
    master.stop().await.unwrap();
    ingestion.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_result_overrides_dispatch_failure() {
    let broker = Arc::new(MemoryBroker::new());
    // Few dispatch retries so queued work fails fast once the node is gone
    let master = Arc::new(ClusterCoordinator::new(
        NodeConfig::master()
            .with_node_id("master")
            .with_heartbeat_interval(50)
            .with_dispatch_retries(2, 10),
        broker.clone(),
    ));
    let results = master.take_results().unwrap();
    master.start().await.unwrap();

    let manager = Arc::new(TaskManager::new(master.clone()));
    let ingestion = manager.clone().spawn_ingestion(results);

    let ghost = Heartbeat {
        node_id: "ghost".to_string(),
        role: NodeRole::Worker,
        address: "10.9.9.9".to_string(),
        status: NodeStatus::Online,
        load: 0.0,
        capacity: 4,
        max_pending: 4,
        active_jobs: 0,
        cpu_usage: None,
        memory_bytes: None,
        total_scans: 0,
        failed_scans: 0,
        timestamp: Utc::now(),
    };
    broker.publish_heartbeat(&ghost, Duration::from_millis(300)).await.unwrap();
    wait_for_workers(&master, 1).await;

    let id = manager
        .create_task(TaskConfig::new("10.0.0.5").with_ports("22").with_timeout(50).with_retries(0))
        .unwrap();
    manager.start_task(id).await.unwrap();

    let stolen = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(job) = broker.pop_job("ghost", Duration::ZERO).await.unwrap() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job never reached the ghost node");

    // The ghost goes silent and no other node exists, so the job is failed
    let report = timeout(Duration::from_secs(5), manager.wait_for_completion(id))
        .await
        .expect("task never settled without workers")
        .unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.statistics.errors, 1);
    let failed = manager.get_results(id).unwrap()[0].clone();
    assert_eq!(failed.state, PortState::Error);
    assert!(failed.sequence > stolen.sequence);

    // The node presumed dead still delivers its real result
    let mut late = ScanResult::for_job(&stolen, PortState::Open);
    late.node_id = Some("ghost".to_string());
    broker.publish_event(&WorkerEvent::Finished(late)).await.unwrap();

    let recovered = timeout(Duration::from_secs(2), async {
        loop {
            let current = manager.get_results(id).unwrap()[0].clone();
            if current.state != PortState::Error {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("late result never replaced the failure");
    assert_eq!(recovered.state, PortState::Open);
    assert_eq!(recovered.node_id.as_deref(), Some("ghost"));
    assert!(recovered.sequence > failed.sequence);
    assert_eq!(master.ledger().state(stolen.id), Some(JobState::Completed));

    let stats = manager.get_task_status(id).unwrap().statistics;
    assert_eq!((stats.errors, stats.open, stats.completed_jobs), (0, 1, 1));

    master.stop().await.unwrap();
    ingestion.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pause_and_resume_across_cluster() {
    let broker = Arc::new(MemoryBroker::new());
    let master = master(broker.clone());
    let results = master.take_results().unwrap();
    master.start().await.unwrap();

    // Every probe waits out its timeout, so the task is still running when paused
    let worker = worker(broker.clone(), "w1", SimulatedTransport::silent());
    worker.start().await.unwrap();
    wait_for_workers(&master, 1).await;

    let manager = Arc::new(TaskManager::new(master.clone()));
    let ingestion = manager.clone().spawn_ingestion(results);
    let id = manager
        .create_task(TaskConfig::new("10.0.0.5").with_ports("1-64").with_timeout(100).with_retries(0))
        .unwrap();
    manager.start_task(id).await.unwrap();

    let ledger = master.ledger();
    timeout(Duration::from_secs(2), async {
        while ledger.outstanding("w1") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_ok!(manager.pause_task(id).await);

    // Probes on the wire finish; everything else comes back to the master
    timeout(Duration::from_secs(2), async {
        while ledger.outstanding("w1") > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("paused jobs were never handed back");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let frozen = manager.get_task_status(id).unwrap();
    assert_eq!(frozen.status, TaskStatus::Paused);
    assert!(frozen.statistics.completed_jobs < 64);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let still = manager.get_task_status(id).unwrap();
    assert_eq!(still.statistics.completed_jobs, frozen.statistics.completed_jobs);
    assert_eq!(ledger.outstanding("w1"), 0);
    let counts = ledger.task_counts(id).unwrap();
    assert_eq!(counts.queued + counts.completed, 64);

    assert_ok!(manager.resume_task(id).await);
    let report = timeout(Duration::from_secs(10), manager.wait_for_completion(id))
        .await
        .expect("task did not finish after resume")
        .unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.statistics.completed_jobs, 64);
    assert_eq!(report.statistics.filtered, 64);

    let path: Vec<TaskStatus> = manager.get_task(id).unwrap().history.iter().map(|t| t.to).collect();
    assert_eq!(
        path,
        vec![TaskStatus::Running, TaskStatus::Paused, TaskStatus::Running, TaskStatus::Completed]
    );

    worker.stop().await.unwrap();
    master.stop().await.unwrap();
    ingestion.await.unwrap();
}

#[tokio::test]
async fn test_worker_shutdown_returns_undelivered_jobs() {
    let broker = Arc::new(MemoryBroker::new());
    let master = master(broker.clone());
    let results = master.take_results().unwrap();
    master.start().await.unwrap();

    // Every probe waits out its timeout, so jobs pile up on the first worker
    let slow = worker(broker.clone(), "slow", SimulatedTransport::silent());
    slow.start().await.unwrap();
    wait_for_workers(&master, 1).await;

    let manager = Arc::new(TaskManager::new(master.clone()));
    let ingestion = manager.clone().spawn_ingestion(results);
    let id = manager
        .create_task(TaskConfig::new("10.0.0.5").with_ports("1-40").with_timeout(300).with_retries(0))
        .unwrap();
    manager.start_task(id).await.unwrap();

    let ledger = master.ledger();
    timeout(Duration::from_secs(2), async {
        while ledger.outstanding("slow") < 16 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    slow.stop().await.unwrap();
    let fast = worker(broker.clone(), "fast", SimulatedTransport::rst_on_all());
    fast.start().await.unwrap();

    let report = timeout(Duration::from_secs(10), manager.wait_for_completion(id))
        .await
        .expect("task did not finish after drain")
        .unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.statistics.completed_jobs, 40);
    // Probes already on the wire when the slow node drained still count
    assert_eq!(report.statistics.closed + report.statistics.filtered, 40);

    fast.stop().await.unwrap();
    master.stop().await.unwrap();
    ingestion.await.unwrap();
}
