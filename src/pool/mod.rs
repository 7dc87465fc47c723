//! Bounded worker pool executing scan jobs on one node
//!
//! Jobs enter through a bounded queue; `submit` fails fast with
//! [`ScanError::QueueFull`] instead of blocking. A fixed set of workers pull
//! from the queue, wait for a rate permit, pass the task checkpoint, probe,
//! and push a [`ScanResult`] onto the output stream. Jobs stopped at the
//! checkpoint leave without a result: canceled ones on the discard stream,
//! paused ones on the deferred stream so a worker is never held by a pause.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::network::PortState;
use crate::rate::AdaptiveRateController;
use crate::scanner::service::sanitize_banner;
use crate::scanner::{ProbeOutcome, ProbeRequest, ScanJob, ScanResult, ServiceIdentifier, TechniqueExecutor};
use crate::task::control::{Checkpoint, TaskControls};
use crate::{Result, ScanError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Idle,
    Running,
    Stopped,
}

/// Counters exposed to heartbeats and the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub discarded: u64,
    pub deferred: u64,
    pub load: f64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    deferred: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct WorkerPool {
    size: usize,
    capacity: usize,
    node_id: Option<String>,
    executor: Arc<dyn TechniqueExecutor>,
    rate: Arc<AdaptiveRateController>,
    controls: Arc<TaskControls>,
    identifier: Arc<ServiceIdentifier>,
    counters: Arc<Counters>,
    status: RwLock<PoolStatus>,
    job_tx: Mutex<Option<mpsc::Sender<ScanJob>>>,
    job_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ScanJob>>>,
    result_tx: Mutex<Option<mpsc::UnboundedSender<ScanResult>>>,
    result_rx: Mutex<Option<mpsc::UnboundedReceiver<ScanResult>>>,
    discard_tx: Mutex<Option<mpsc::UnboundedSender<ScanJob>>>,
    discard_rx: Mutex<Option<mpsc::UnboundedReceiver<ScanJob>>>,
    defer_tx: Mutex<Option<mpsc::UnboundedSender<ScanJob>>>,
    defer_rx: Mutex<Option<mpsc::UnboundedReceiver<ScanJob>>>,
    returned: Arc<Mutex<Vec<ScanJob>>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        capacity: usize,
        executor: Arc<dyn TechniqueExecutor>,
        rate: Arc<AdaptiveRateController>,
        controls: Arc<TaskControls>,
    ) -> Self {
        let size = size.max(1);
        let capacity = capacity.max(1);
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let (discard_tx, discard_rx) = mpsc::unbounded_channel();
        let (defer_tx, defer_rx) = mpsc::unbounded_channel();

        Self {
            size,
            capacity,
            node_id: None,
            executor,
            rate,
            controls,
            identifier: Arc::new(ServiceIdentifier::new()),
            counters: Arc::new(Counters::default()),
            status: RwLock::new(PoolStatus::Idle),
            job_tx: Mutex::new(Some(job_tx)),
            job_rx: Arc::new(tokio::sync::Mutex::new(job_rx)),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
            discard_tx: Mutex::new(Some(discard_tx)),
            discard_rx: Mutex::new(Some(discard_rx)),
            defer_tx: Mutex::new(Some(defer_tx)),
            defer_rx: Mutex::new(Some(defer_rx)),
            returned: Arc::new(Mutex::new(Vec::new())),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Stamp results with the executing node
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn status(&self) -> PoolStatus {
        match self.status.read() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_status(&self, status: PoolStatus) {
        match self.status.write() {
            Ok(mut guard) => *guard = status,
            Err(poisoned) => *poisoned.into_inner() = status,
        }
    }

    /// Spawn the workers. Starting a running pool is a no-op.
    pub fn start(&self) -> Result<()> {
        match self.status() {
            PoolStatus::Running => return Ok(()),
            PoolStatus::Stopped => return Err(ScanError::PoolNotRunning),
            PoolStatus::Idle => {}
        }

        let results = lock(&self.result_tx).clone().ok_or(ScanError::PoolNotRunning)?;
        let discards = lock(&self.discard_tx).clone().ok_or(ScanError::PoolNotRunning)?;
        let deferrals = lock(&self.defer_tx).clone().ok_or(ScanError::PoolNotRunning)?;

        let mut workers = lock(&self.workers);
        for worker_id in 0..self.size {
            let worker = Worker {
                id: worker_id,
                node_id: self.node_id.clone(),
                executor: self.executor.clone(),
                rate: self.rate.clone(),
                controls: self.controls.clone(),
                identifier: self.identifier.clone(),
                counters: self.counters.clone(),
                job_rx: self.job_rx.clone(),
                results: results.clone(),
                discards: discards.clone(),
                deferrals: deferrals.clone(),
                returned: self.returned.clone(),
                shutdown: self.shutdown.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        self.set_status(PoolStatus::Running);
        log::info!("worker pool started size={} queue_capacity={}", self.size, self.capacity);
        Ok(())
    }

    /// Enqueue a job without blocking
    pub fn submit(&self, job: ScanJob) -> Result<()> {
        let guard = lock(&self.job_tx);
        let tx = guard.as_ref().ok_or(ScanError::PoolNotRunning)?;

        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(ScanError::QueueFull {
                        capacity: self.capacity,
                    }),
                    mpsc::error::TrySendError::Closed(_) => Err(ScanError::PoolNotRunning),
                }
            }
        }
    }

    /// Result stream; can be taken once
    pub fn results(&self) -> Option<mpsc::UnboundedReceiver<ScanResult>> {
        lock(&self.result_rx).take()
    }

    /// Stream of jobs dropped at the checkpoint because their task was canceled
    pub fn discarded(&self) -> Option<mpsc::UnboundedReceiver<ScanJob>> {
        lock(&self.discard_rx).take()
    }

    /// Stream of jobs handed back at the checkpoint because their task was paused
    pub fn deferred(&self) -> Option<mpsc::UnboundedReceiver<ScanJob>> {
        lock(&self.defer_rx).take()
    }

    /// Stop intake, let in-flight probes finish, and hand back every job that never started
    pub async fn stop(&self) -> Vec<ScanJob> {
        self.set_status(PoolStatus::Stopped);
        drop(lock(&self.job_tx).take());
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *lock(&self.workers));
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                log::error!("worker task failed: {}", e);
            }
        }

        let mut unprocessed = std::mem::take(&mut *lock(&self.returned));
        {
            let mut rx = self.job_rx.lock().await;
            rx.close();
            while let Ok(job) = rx.try_recv() {
                unprocessed.push(job);
            }
        }
        self.counters.queued.store(0, Ordering::SeqCst);

        // Closing the senders ends the output streams once drained
        drop(lock(&self.result_tx).take());
        drop(lock(&self.discard_tx).take());
        drop(lock(&self.defer_tx).take());

        log::info!(
            "worker pool stopped completed={} unprocessed={}",
            self.counters.completed.load(Ordering::SeqCst),
            unprocessed.len()
        );
        unprocessed
    }

    /// In-flight jobs over pool size
    pub fn load(&self) -> f64 {
        self.counters.in_flight.load(Ordering::SeqCst) as f64 / self.size as f64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            queued: self.counters.queued.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            discarded: self.counters.discarded.load(Ordering::SeqCst),
            deferred: self.counters.deferred.load(Ordering::SeqCst),
            load: self.load(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Worker {
    id: usize,
    node_id: Option<String>,
    executor: Arc<dyn TechniqueExecutor>,
    rate: Arc<AdaptiveRateController>,
    controls: Arc<TaskControls>,
    identifier: Arc<ServiceIdentifier>,
    counters: Arc<Counters>,
    job_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ScanJob>>>,
    results: mpsc::UnboundedSender<ScanResult>,
    discards: mpsc::UnboundedSender<ScanJob>,
    deferrals: mpsc::UnboundedSender<ScanJob>,
    returned: Arc<Mutex<Vec<ScanJob>>>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = {
                let mut rx = self.job_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = next else { break };

            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
            self.process(job).await;
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        log::debug!("worker {} exiting", self.id);
    }

    /// Wait for a rate permit; false if the pool is shutting down first
    async fn admit(&self) -> bool {
        loop {
            if self.rate.try_admit() {
                return true;
            }
            let wait = self.rate.delay_until_next().max(Duration::from_millis(1));
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn process(&self, job: ScanJob) {
        if !self.admit().await {
            lock(&self.returned).push(job);
            return;
        }

        match self.controls.checkpoint(job.task_id) {
            Checkpoint::Discard => {
                self.counters.discarded.fetch_add(1, Ordering::SeqCst);
                log::debug!("discarding job of canceled task task={} port={}", job.task_id, job.port);
                let _ = self.discards.send(job);
                return;
            }
            Checkpoint::Defer => {
                self.counters.deferred.fetch_add(1, Ordering::SeqCst);
                log::debug!("deferring job of paused task task={} port={}", job.task_id, job.port);
                if let Err(mpsc::error::SendError(job)) = self.deferrals.send(job) {
                    lock(&self.returned).push(job);
                }
                return;
            }
            Checkpoint::Proceed => {}
        }

        let outcome = self.probe_with_retries(&job).await;
        let result = self.build_result(&job, outcome);

        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        if result.state == PortState::Error {
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
        }
        if self.results.send(result).is_err() {
            log::debug!("result stream closed, dropping result for job {}", job.id);
        }
    }

    async fn probe_with_retries(&self, job: &ScanJob) -> ProbeOutcome {
        let request = ProbeRequest::from(job);
        let mut attempt = 0;
        loop {
            let outcome = self.executor.probe(&request).await;
            self.rate.record_result(!outcome.is_error(), outcome.response_time);

            if !outcome.is_error() || attempt >= job.retries {
                return outcome;
            }
            attempt += 1;
            log::debug!(
                "retrying probe target={} port={} attempt={} error={}",
                job.target,
                job.port,
                attempt,
                outcome.error.as_deref().unwrap_or("")
            );
            tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            if !self.admit().await {
                return outcome;
            }
        }
    }

    fn build_result(&self, job: &ScanJob, outcome: ProbeOutcome) -> ScanResult {
        let mut result = ScanResult::for_job(job, outcome.state);
        result.technique = outcome.technique;
        result.response_time = outcome.response_time;
        result.error = outcome.error;
        result.node_id = self.node_id.clone();

        let banner = outcome.banner.as_deref().and_then(sanitize_banner);
        if job.service_detection && matches!(result.state, PortState::Open | PortState::OpenFiltered) {
            let found = self.identifier.identify(job.port, job.protocol, banner.as_deref());
            result.service = found.service;
            result.version = match (found.product, found.version) {
                (Some(product), Some(version)) => Some(format!("{} {}", product, version)),
                (product, _) => product,
            };
        }
        if job.banner_grab {
            result.banner = banner;
        }
        result
    }
}
