//! Master and worker loops of a cluster node
//!
//! Master: keeps the node registry fresh from heartbeats, expires silent
//! nodes and requeues their jobs, dispatches queued jobs to the least loaded
//! worker, ingests worker events, and periodically rebalances.
//!
//! Worker: publishes heartbeats, pulls jobs from its own broker queue into a
//! local [`WorkerPool`], reports results and applies control signals.
//! Shutdown drains: intake stops, in-flight probes finish, unstarted jobs are
//! handed back to the master, and a final offline heartbeat is sent.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{
    generate_node_id, Broker, ClusterRegistry, Completion, Heartbeat, JobDispatcher, JobLedger, NodeLifecycle,
    NodeRole, NodeStatus, WorkerEvent,
};
use crate::config::{NodeConfig, RateConfig};
use crate::error::ErrorHandler;
use crate::pool::WorkerPool;
use crate::rate::AdaptiveRateController;
use crate::scanner::{ProbeEngine, ScanJob, ScanResult, TaskId, TechniqueExecutor};
use crate::task::control::{Checkpoint, ControlKind, ControlSignal, TaskControls};
use crate::task::ScanTask;
use crate::utils::{CpuMonitor, MemoryMonitor};
use crate::{Result, ScanError};

const PULL_WAIT: Duration = Duration::from_millis(200);
const EVENT_WAIT: Duration = Duration::from_millis(200);
const IDLE_WAIT: Duration = Duration::from_millis(50);
const SUBMIT_RETRY: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn join(handle: Option<JoinHandle<()>>, name: &str) {
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            log::error!("{} task failed: {}", name, e);
        }
    }
}

pub struct ClusterCoordinator {
    config: NodeConfig,
    node_id: String,
    broker: Arc<dyn Broker>,
    registry: Arc<ClusterRegistry>,
    ledger: Arc<JobLedger>,
    controls: Arc<TaskControls>,
    executor: Option<Arc<dyn TechniqueExecutor>>,
    rate_config: RateConfig,
    error_handler: ErrorHandler,
    lifecycle: RwLock<NodeLifecycle>,
    /// Wakes the dispatcher: new jobs, freed slots, resumed tasks
    dispatch_notify: Notify,
    /// Wakes the dispatcher out of a no-healthy-node backoff
    node_notify: Notify,
    shutdown: CancellationToken,
    intake: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    puller: Mutex<Option<JoinHandle<()>>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    results_tx: Mutex<Option<mpsc::UnboundedSender<ScanResult>>>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<ScanResult>>>,
}

impl ClusterCoordinator {
    pub fn new(config: NodeConfig, broker: Arc<dyn Broker>) -> Self {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| generate_node_id(&config.address));
        let error_handler = ErrorHandler::new(config.max_dispatch_retries, config.dispatch_retry_base_ms);
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Self {
            config,
            node_id,
            broker,
            registry: Arc::new(ClusterRegistry::new()),
            ledger: Arc::new(JobLedger::new()),
            controls: Arc::new(TaskControls::new()),
            executor: None,
            rate_config: RateConfig::default(),
            error_handler,
            lifecycle: RwLock::new(NodeLifecycle::Starting),
            dispatch_notify: Notify::new(),
            node_notify: Notify::new(),
            shutdown: CancellationToken::new(),
            intake: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            puller: Mutex::new(None),
            reporter: Mutex::new(None),
            pool: Mutex::new(None),
            results_tx: Mutex::new(Some(results_tx)),
            results_rx: Mutex::new(Some(results_rx)),
        }
    }

    /// Probe executor for the worker pool; defaults to the host network stack
    pub fn with_executor(mut self, executor: Arc<dyn TechniqueExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_rate_config(mut self, rate_config: RateConfig) -> Self {
        self.rate_config = rate_config;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.config.role
    }

    pub fn lifecycle(&self) -> NodeLifecycle {
        match self.lifecycle.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_lifecycle(&self, next: NodeLifecycle) {
        let mut state = match self.lifecycle.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != next {
            log::info!(
                "node lifecycle node={} role={} from={:?} to={:?}",
                self.node_id,
                self.config.role,
                *state,
                next
            );
            *state = next;
        }
    }

    pub fn registry(&self) -> Arc<ClusterRegistry> {
        self.registry.clone()
    }

    pub fn ledger(&self) -> Arc<JobLedger> {
        self.ledger.clone()
    }

    pub fn controls(&self) -> Arc<TaskControls> {
        self.controls.clone()
    }

    /// Local worker pool, once a worker node is started
    pub fn pool(&self) -> Option<Arc<WorkerPool>> {
        lock(&self.pool).clone()
    }

    /// Reconciled-by-ledger result stream of a master; can be taken once
    pub fn take_results(&self) -> Option<mpsc::UnboundedReceiver<ScanResult>> {
        lock(&self.results_rx).take()
    }

    fn spawn_background<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        lock(&self.background).push(tokio::spawn(future));
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.lifecycle() != NodeLifecycle::Starting {
            return Err(ScanError::ConfigError(format!(
                "node {} cannot start from {:?}",
                self.node_id,
                self.lifecycle()
            )));
        }
        self.config.validate()?;

        match self.config.role {
            NodeRole::Master => self.start_master().await?,
            NodeRole::Worker => self.start_worker().await?,
        }
        self.set_lifecycle(NodeLifecycle::Running);
        Ok(())
    }

    /// Drain and leave the cluster. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<()> {
        match self.lifecycle() {
            NodeLifecycle::Stopped | NodeLifecycle::Deregistering => return Ok(()),
            NodeLifecycle::Starting => {
                self.set_lifecycle(NodeLifecycle::Stopped);
                return Ok(());
            }
            NodeLifecycle::Registered | NodeLifecycle::Running => {}
        }
        self.set_lifecycle(NodeLifecycle::Deregistering);

        if self.config.role == NodeRole::Worker {
            self.stop_worker().await;
        }

        self.intake.cancel();
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *lock(&self.background));
        for handle in handles {
            join(Some(handle), "background").await;
        }
        drop(lock(&self.results_tx).take());

        self.set_lifecycle(NodeLifecycle::Stopped);
        Ok(())
    }

    // ---- master ----

    async fn start_master(self: &Arc<Self>) -> Result<()> {
        // Subscribe before seeding so nothing published in between is missed
        let heartbeats = self.broker.subscribe_heartbeats();
        for heartbeat in self.broker.live_heartbeats().await? {
            self.handle_heartbeat(heartbeat).await;
        }
        self.registry.record_heartbeat(&Heartbeat {
            node_id: self.node_id.clone(),
            role: NodeRole::Master,
            address: self.config.address.clone(),
            status: NodeStatus::Online,
            load: 0.0,
            capacity: 0,
            max_pending: 0,
            active_jobs: 0,
            cpu_usage: None,
            memory_bytes: MemoryMonitor::current_usage(),
            total_scans: 0,
            failed_scans: 0,
            timestamp: Utc::now(),
        });
        self.set_lifecycle(NodeLifecycle::Registered);

        let results = lock(&self.results_tx).clone().ok_or(ScanError::PoolNotRunning)?;

        let this = self.clone();
        self.spawn_background(async move { this.heartbeat_listener(heartbeats).await });
        let this = self.clone();
        self.spawn_background(async move { this.health_loop().await });
        let this = self.clone();
        let event_results = results.clone();
        self.spawn_background(async move { this.event_loop(event_results).await });
        let this = self.clone();
        self.spawn_background(async move { this.dispatch_loop(results).await });
        let this = self.clone();
        self.spawn_background(async move { this.rebalance_loop().await });
        Ok(())
    }

    async fn heartbeat_listener(self: Arc<Self>, mut heartbeats: broadcast::Receiver<Heartbeat>) {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = heartbeats.recv() => received,
            };
            match received {
                Ok(heartbeat) => self.handle_heartbeat(heartbeat).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("heartbeat listener lagged skipped={}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_heartbeat(&self, heartbeat: Heartbeat) {
        if heartbeat.role != NodeRole::Worker || heartbeat.node_id == self.node_id {
            return;
        }
        if heartbeat.status == NodeStatus::Offline {
            if self.registry.mark_offline(&heartbeat.node_id) {
                self.reassign_node(&heartbeat.node_id).await;
            }
            return;
        }
        if self.registry.record_heartbeat(&heartbeat) {
            self.node_notify.notify_one();
            self.dispatch_notify.notify_one();
        }
    }

    /// Requeue every job of a node presumed dead
    async fn reassign_node(&self, node_id: &str) {
        let drained = match self.broker.drain_jobs(node_id).await {
            Ok(jobs) => jobs.len(),
            Err(e) => {
                log::warn!("failed to drain queue node={} error={}", node_id, e);
                0
            }
        };
        let requeued = self.ledger.requeue_node(node_id);
        log::warn!(
            "reassigning jobs of offline node node={} requeued={} undelivered={}",
            node_id,
            requeued,
            drained
        );
        self.dispatch_notify.notify_one();
    }

    async fn health_loop(self: Arc<Self>) {
        let period = (self.config.heartbeat_interval() / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for node_id in self.registry.expire_stale(self.config.heartbeat_timeout()) {
                self.reassign_node(&node_id).await;
            }
        }
    }

    async fn event_loop(self: Arc<Self>, results: mpsc::UnboundedSender<ScanResult>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.broker.next_event(EVENT_WAIT) => event,
            };
            match event {
                Ok(Some(event)) => self.handle_event(event, &results),
                Ok(None) => {}
                Err(e) => {
                    log::error!("failed to read worker events: {}", e);
                    tokio::time::sleep(IDLE_WAIT).await;
                }
            }
        }
    }

    fn handle_event(&self, event: WorkerEvent, results: &mpsc::UnboundedSender<ScanResult>) {
        match event {
            WorkerEvent::Started {
                job_id,
                node_id,
                sequence,
            } => {
                self.ledger.mark_in_flight(job_id, &node_id, sequence);
            }
            WorkerEvent::Finished(mut result) => {
                match self.ledger.complete(&result) {
                    Completion::Unknown => {
                        log::warn!("dropping result for unknown job job={}", result.job_id);
                        return;
                    }
                    Completion::Duplicate => log::debug!(
                        "duplicate result job={} node={} sequence={}",
                        result.job_id,
                        result.node_id.as_deref().unwrap_or("-"),
                        result.sequence
                    ),
                    Completion::Recovered(sequence) => {
                        log::info!(
                            "late result supersedes dispatch failure job={} node={}",
                            result.job_id,
                            result.node_id.as_deref().unwrap_or("-")
                        );
                        result.sequence = sequence;
                    }
                    Completion::Accepted => {}
                }
                self.dispatch_notify.notify_one();
                // Duplicates are forwarded too; ingestion keeps the newest sequence
                if results.send(result).is_err() {
                    log::debug!("result receiver dropped");
                }
            }
            WorkerEvent::Discarded { job_id, node_id } => {
                log::debug!("job discarded job={} node={}", job_id, node_id);
                self.ledger.mark_abandoned(job_id);
                self.dispatch_notify.notify_one();
            }
            WorkerEvent::Returned { job_id, node_id } => {
                log::debug!("job returned job={} node={}", job_id, node_id);
                self.ledger.requeue_jobs(&[job_id]);
                self.dispatch_notify.notify_one();
            }
        }
    }

    async fn wait_for_dispatch(&self, timeout: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = self.dispatch_notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }

    async fn dispatch_loop(self: Arc<Self>, results: mpsc::UnboundedSender<ScanResult>) {
        let mut failed_rounds: u32 = 0;

        while !self.shutdown.is_cancelled() {
            match self.dispatch_round().await {
                Ok(dispatched) => {
                    failed_rounds = 0;
                    if dispatched == 0 {
                        self.wait_for_dispatch(IDLE_WAIT).await;
                    }
                }
                Err(error @ ScanError::NoHealthyNode) => {
                    let attempt = failed_rounds;
                    failed_rounds += 1;
                    if !self.error_handler.should_retry(&error, attempt) {
                        self.fail_queued_jobs(&results);
                        failed_rounds = 0;
                        continue;
                    }
                    let delay = self.error_handler.retry_delay(attempt);
                    log::warn!(
                        "no healthy worker node attempt={} retry_in_ms={}",
                        failed_rounds,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = self.node_notify.notified() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    log::error!("dispatch failed: {}", e);
                    self.wait_for_dispatch(IDLE_WAIT).await;
                }
            }
        }
    }

    /// Push queued jobs until nothing is eligible or every node is at its window
    async fn dispatch_round(&self) -> Result<usize> {
        if !self.ledger.has_queued() {
            return Ok(0);
        }

        let mut dispatched = 0;
        loop {
            let Some(node_id) = self.registry.select_least_loaded(|id| self.ledger.outstanding(id))? else {
                return Ok(dispatched);
            };
            let controls = &self.controls;
            let Some(job) = self
                .ledger
                .assign_next(&node_id, |job| controls.is_dispatchable(job.task_id))
            else {
                return Ok(dispatched);
            };

            if let Err(e) = self.broker.push_job(&node_id, &job).await {
                self.ledger.requeue_jobs(&[job.id]);
                return Err(ScanError::BrokerError(format!("push to {} failed: {}", node_id, e)));
            }
            dispatched += 1;
            if dispatched % 256 == 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    fn fail_queued_jobs(&self, results: &mpsc::UnboundedSender<ScanResult>) {
        let controls = &self.controls;
        let abandoned = self
            .ledger
            .abandon_queued(|job| controls.is_dispatchable(job.task_id));
        if abandoned.is_empty() {
            return;
        }
        log::error!(
            "abandoning jobs after {} dispatch retries without a healthy worker count={}",
            self.error_handler.max_retries(),
            abandoned.len()
        );
        for job in abandoned {
            let mut result = ScanResult::failed(&job, "no healthy worker node available");
            result.node_id = Some(self.node_id.clone());
            if results.send(result).is_err() {
                break;
            }
        }
    }

    async fn rebalance_loop(self: Arc<Self>) {
        let period = self.config.rebalance_interval().max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.rebalance().await;
        }
    }

    /// Move undelivered jobs off the most loaded node when load skew exceeds the threshold
    pub async fn rebalance(&self) -> usize {
        let loads: Vec<(String, f64)> = self
            .registry
            .online_nodes()
            .into_iter()
            .map(|node| {
                let load = self.ledger.outstanding(&node.id) as f64 / node.capacity as f64;
                (node.id, load)
            })
            .collect();
        if loads.len() < 2 {
            return 0;
        }

        let (busiest, max_load) = loads
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, load)| (id.clone(), *load))
            .unwrap_or_default();
        let min_load = loads.iter().map(|(_, load)| *load).fold(f64::INFINITY, f64::min);
        let skew = max_load - min_load;
        if skew <= self.config.skew_threshold {
            return 0;
        }

        match self.broker.drain_jobs(&busiest).await {
            Ok(jobs) => {
                let ids: Vec<_> = jobs.iter().map(|job| job.id).collect();
                let requeued = self.ledger.requeue_jobs(&ids);
                log::info!(
                    "rebalanced node={} requeued={} skew={:.2} threshold={:.2}",
                    busiest,
                    requeued,
                    skew,
                    self.config.skew_threshold
                );
                self.dispatch_notify.notify_one();
                requeued
            }
            Err(e) => {
                log::warn!("rebalance drain failed node={} error={}", busiest, e);
                0
            }
        }
    }

    // ---- worker ----

    async fn start_worker(self: &Arc<Self>) -> Result<()> {
        let executor: Arc<dyn TechniqueExecutor> = match &self.executor {
            Some(executor) => executor.clone(),
            None => Arc::new(ProbeEngine::system().with_banner_timeout(self.config.banner_timeout())),
        };
        let rate = Arc::new(AdaptiveRateController::new(self.rate_config.clone()));
        let pool = Arc::new(
            WorkerPool::new(
                self.config.pool_size,
                self.config.queue_capacity,
                executor,
                rate,
                self.controls.clone(),
            )
            .with_node_id(self.node_id.clone()),
        );
        let results = pool.results().ok_or(ScanError::PoolNotRunning)?;
        let discards = pool.discarded().ok_or(ScanError::PoolNotRunning)?;
        let deferrals = pool.deferred().ok_or(ScanError::PoolNotRunning)?;
        pool.start()?;
        *lock(&self.pool) = Some(pool.clone());

        let controls = self.broker.subscribe_control();
        let mut cpu = CpuMonitor::new();
        let registration = self.heartbeat(&pool, &mut cpu, None);
        self.broker
            .publish_heartbeat(&registration, self.config.heartbeat_ttl())
            .await?;
        self.set_lifecycle(NodeLifecycle::Registered);

        let this = self.clone();
        let heartbeat_pool = pool.clone();
        self.spawn_background(async move { this.heartbeat_loop(heartbeat_pool, cpu).await });
        let this = self.clone();
        self.spawn_background(async move { this.control_listener(controls).await });

        let this = self.clone();
        *lock(&self.reporter) = Some(tokio::spawn(async move { this.reporter(results, discards, deferrals).await }));
        let this = self.clone();
        *lock(&self.puller) = Some(tokio::spawn(async move { this.puller(pool).await }));
        Ok(())
    }

    fn heartbeat(&self, pool: &WorkerPool, cpu: &mut CpuMonitor, status: Option<NodeStatus>) -> Heartbeat {
        let stats = pool.stats();
        let status = status.unwrap_or(if stats.load >= 1.0 {
            NodeStatus::Busy
        } else {
            NodeStatus::Online
        });
        Heartbeat {
            node_id: self.node_id.clone(),
            role: NodeRole::Worker,
            address: self.config.address.clone(),
            status,
            load: stats.load,
            capacity: stats.size,
            max_pending: self.config.dispatch_window,
            active_jobs: stats.in_flight,
            cpu_usage: cpu.current_usage(),
            memory_bytes: MemoryMonitor::current_usage(),
            total_scans: stats.completed,
            failed_scans: stats.failed,
            timestamp: Utc::now(),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, pool: Arc<WorkerPool>, mut cpu: CpuMonitor) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let heartbeat = self.heartbeat(&pool, &mut cpu, None);
            if let Err(e) = self
                .broker
                .publish_heartbeat(&heartbeat, self.config.heartbeat_ttl())
                .await
            {
                log::warn!("heartbeat publish failed node={} error={}", self.node_id, e);
            }
        }
    }

    async fn control_listener(self: Arc<Self>, mut signals: broadcast::Receiver<ControlSignal>) {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = signals.recv() => received,
            };
            match received {
                Ok(signal) => {
                    log::info!(
                        "control signal node={} task={} kind={:?}",
                        self.node_id,
                        signal.task_id,
                        signal.kind
                    );
                    self.controls.apply(&signal);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("control listener lagged skipped={}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn emit(&self, event: WorkerEvent) {
        if let Err(e) = self.broker.publish_event(&event).await {
            log::error!("failed to publish worker event node={} error={}", self.node_id, e);
        }
    }

    async fn puller(self: Arc<Self>, pool: Arc<WorkerPool>) {
        loop {
            let popped = tokio::select! {
                _ = self.intake.cancelled() => break,
                popped = self.broker.pop_job(&self.node_id, PULL_WAIT) => popped,
            };
            let job = match popped {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("failed to pull jobs node={} error={}", self.node_id, e);
                    tokio::select! {
                        _ = self.intake.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_WAIT) => continue,
                    }
                }
            };

            match self.controls.checkpoint(job.task_id) {
                Checkpoint::Discard => {
                    self.emit(WorkerEvent::Discarded {
                        job_id: job.id,
                        node_id: self.node_id.clone(),
                    })
                    .await
                }
                Checkpoint::Defer => {
                    self.emit(WorkerEvent::Returned {
                        job_id: job.id,
                        node_id: self.node_id.clone(),
                    })
                    .await
                }
                Checkpoint::Proceed => self.hand_to_pool(&pool, job).await,
            }
        }
    }

    async fn hand_to_pool(&self, pool: &WorkerPool, job: ScanJob) {
        let (job_id, sequence) = (job.id, job.sequence);
        loop {
            match pool.submit(job.clone()) {
                Ok(()) => {
                    self.emit(WorkerEvent::Started {
                        job_id,
                        node_id: self.node_id.clone(),
                        sequence,
                    })
                    .await;
                    return;
                }
                Err(ScanError::QueueFull { .. }) => {
                    tokio::select! {
                        _ = self.intake.cancelled() => break,
                        _ = tokio::time::sleep(SUBMIT_RETRY) => {}
                    }
                }
                Err(e) => {
                    log::warn!("pool rejected job job={} error={}", job_id, e);
                    break;
                }
            }
        }
        self.emit(WorkerEvent::Returned {
            job_id,
            node_id: self.node_id.clone(),
        })
        .await;
    }

    async fn reporter(
        self: Arc<Self>,
        mut results: mpsc::UnboundedReceiver<ScanResult>,
        mut discards: mpsc::UnboundedReceiver<ScanJob>,
        mut deferrals: mpsc::UnboundedReceiver<ScanJob>,
    ) {
        let (mut results_open, mut discards_open, mut deferrals_open) = (true, true, true);
        while results_open || discards_open || deferrals_open {
            tokio::select! {
                result = results.recv(), if results_open => match result {
                    Some(result) => self.emit(WorkerEvent::Finished(result)).await,
                    None => results_open = false,
                },
                job = discards.recv(), if discards_open => match job {
                    Some(job) => self.emit(WorkerEvent::Discarded {
                        job_id: job.id,
                        node_id: self.node_id.clone(),
                    })
                    .await,
                    None => discards_open = false,
                },
                // Paused work goes back to the master until resume
                job = deferrals.recv(), if deferrals_open => match job {
                    Some(job) => self.emit(WorkerEvent::Returned {
                        job_id: job.id,
                        node_id: self.node_id.clone(),
                    })
                    .await,
                    None => deferrals_open = false,
                },
            }
        }
    }

    async fn stop_worker(&self) {
        self.intake.cancel();
        let puller = lock(&self.puller).take();
        join(puller, "puller").await;

        let Some(pool) = self.pool() else { return };
        let mut returned = pool.stop().await;
        let reporter = lock(&self.reporter).take();
        join(reporter, "reporter").await;

        match self.broker.drain_jobs(&self.node_id).await {
            Ok(undelivered) => returned.extend(undelivered),
            Err(e) => log::warn!("failed to drain own queue node={} error={}", self.node_id, e),
        }
        for job in &returned {
            self.emit(WorkerEvent::Returned {
                job_id: job.id,
                node_id: self.node_id.clone(),
            })
            .await;
        }

        let mut cpu = CpuMonitor::new();
        let farewell = self.heartbeat(&pool, &mut cpu, Some(NodeStatus::Offline));
        if let Err(e) = self
            .broker
            .publish_heartbeat(&farewell, self.config.heartbeat_ttl())
            .await
        {
            log::warn!("offline heartbeat failed node={} error={}", self.node_id, e);
        }
        log::info!("node drained node={} returned={}", self.node_id, returned.len());
    }
}

#[async_trait]
impl JobDispatcher for ClusterCoordinator {
    async fn submit_task(&self, task: &ScanTask) -> Result<usize> {
        if self.config.role != NodeRole::Master {
            return Err(ScanError::ConfigError(format!(
                "node {} is a worker and cannot accept tasks",
                self.node_id
            )));
        }
        let jobs = task.expand_jobs();
        let count = self.ledger.enqueue(task.id, task.config.concurrency, jobs);
        log::info!("task queued task={} jobs={}", task.id, count);
        self.dispatch_notify.notify_one();
        Ok(count)
    }

    async fn signal(&self, signal: ControlSignal) -> Result<()> {
        self.controls.apply(&signal);
        match signal.kind {
            ControlKind::Cancel => {
                let dropped = self.ledger.cancel_task(signal.task_id);
                log::info!("task canceled task={} dropped_jobs={}", signal.task_id, dropped);
            }
            ControlKind::Resume => self.dispatch_notify.notify_one(),
            ControlKind::Pause => {}
        }
        self.broker.publish_control(&signal).await
    }

    fn release_task(&self, task_id: TaskId) {
        self.ledger.forget_task(task_id);
        self.controls.forget(task_id);
        log::debug!("task released task={}", task_id);
    }
}
