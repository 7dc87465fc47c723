//! Scan task lifecycle, result reconciliation and statistics
//!
//! The [`TaskManager`] owns every user-visible task. It hands started tasks
//! to a [`JobDispatcher`] and receives results back through [`TaskManager::ingest`].
//! Results are reconciled per (task, target, port, protocol): the record with
//! the highest dispatch sequence wins, so a late duplicate from a node that
//! was presumed dead never overwrites the result of its replacement.

pub mod control;
pub mod sink;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cluster::JobDispatcher;
use crate::config::{TaskConfig, MAX_JOBS_PER_TASK};
use crate::network::PortState;
use crate::scanner::{JobKey, ScanJob, ScanResult, TaskId};
use crate::utils::port_parser::parse_ports;
use crate::utils::target_parser::TargetParser;
use crate::utils::Logger;
use crate::{Result, ScanError};

use control::{ControlKind, ControlSignal};
pub use sink::{JsonLinesSink, ResultSink};

pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;

const RESULT_STREAM_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled)
    }

    /// Holds a concurrency slot
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Paused)
    }

    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running | Canceled | Failed)
                | (Running, Paused | Canceled | Completed | Failed)
                | (Paused, Running | Canceled | Completed | Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
}

/// A scan task with its targets and ports already expanded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanTask {
    pub id: TaskId,
    pub name: String,
    pub config: TaskConfig,
    pub targets: Vec<String>,
    pub ports: Vec<u16>,
    pub status: TaskStatus,
    pub total_jobs: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub history: Vec<TaskTransition>,
}

impl ScanTask {
    pub fn new(config: TaskConfig) -> Result<Self> {
        Self::with_parser(config, &TargetParser::default())
    }

    /// Validate the configuration and expand its targets and ports
    pub fn with_parser(config: TaskConfig, parser: &TargetParser) -> Result<Self> {
        config.validate()?;
        let targets = parser.parse_list(&config.targets)?;
        let ports = parse_ports(&config.ports)?;

        let total_jobs = targets.len().saturating_mul(ports.len());
        if total_jobs > MAX_JOBS_PER_TASK {
            return Err(ScanError::PortRangeError(format!(
                "{} targets x {} ports exceeds the limit of {} jobs per task",
                targets.len(),
                ports.len(),
                MAX_JOBS_PER_TASK
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            config,
            targets,
            ports,
            status: TaskStatus::Pending,
            total_jobs,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            history: Vec::new(),
        })
    }

    /// One job per (target, port), shuffled when the task asks for random order
    pub fn expand_jobs(&self) -> Vec<ScanJob> {
        let mut jobs = Vec::with_capacity(self.total_jobs);
        for target in &self.targets {
            for &port in &self.ports {
                jobs.push(
                    ScanJob::new(self.id, target.as_str(), port, self.config.technique)
                        .with_timeout(self.config.timeout_ms)
                        .with_retries(self.config.retries)
                        .with_banner_grab(self.config.banner_grab)
                        .with_service_detection(self.config.service_detection),
                );
            }
        }
        if self.config.random_order {
            jobs.shuffle(&mut rand::thread_rng());
        }
        jobs
    }

    fn transition(&mut self, to: TaskStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(invalid_transition(self.status, to));
        }
        let now = Utc::now();
        log::info!("task transition task={} name={} from={} to={}", self.id, self.name, self.status, to);
        self.history.push(TaskTransition {
            from: self.status,
            to,
            at: now,
        });
        if to == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = to;
        Ok(())
    }
}

fn invalid_transition(from: TaskStatus, to: impl fmt::Display) -> ScanError {
    ScanError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Aggregates over the reconciled result set of one task.
///
/// Maintained incrementally: a replaced result is reverted before its
/// replacement is recorded, so the figures always describe exactly one
/// result per job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub open: usize,
    pub closed: usize,
    pub filtered: usize,
    pub unfiltered: usize,
    pub open_filtered: usize,
    pub errors: usize,
    pub avg_response_time_ms: f64,
    pub services: BTreeMap<String, usize>,
    /// Percentage of completed jobs found open
    pub open_rate: f64,
    /// Percentage of completed jobs found filtered or open|filtered
    pub filtered_rate: f64,
    /// Result records received, duplicates and stale ones included
    pub result_count: usize,
    #[serde(skip)]
    response_time_total_us: u128,
}

impl TaskStatistics {
    pub fn new(total_jobs: usize) -> Self {
        Self {
            total_jobs,
            ..Self::default()
        }
    }

    fn state_count(&mut self, state: PortState) -> &mut usize {
        match state {
            PortState::Open => &mut self.open,
            PortState::Closed => &mut self.closed,
            PortState::Filtered => &mut self.filtered,
            PortState::Unfiltered => &mut self.unfiltered,
            PortState::OpenFiltered => &mut self.open_filtered,
            PortState::Error => &mut self.errors,
        }
    }

    fn record(&mut self, result: &ScanResult) {
        *self.state_count(result.state) += 1;
        self.response_time_total_us += result.response_time.as_micros();
        if let Some(service) = &result.service {
            *self.services.entry(service.clone()).or_default() += 1;
        }
        self.refresh();
    }

    fn revert(&mut self, result: &ScanResult) {
        let count = self.state_count(result.state);
        *count = count.saturating_sub(1);
        self.response_time_total_us = self
            .response_time_total_us
            .saturating_sub(result.response_time.as_micros());
        if let Some(service) = &result.service {
            if let Some(count) = self.services.get_mut(service) {
                *count -= 1;
                if *count == 0 {
                    self.services.remove(service);
                }
            }
        }
        self.refresh();
    }

    fn refresh(&mut self) {
        self.completed_jobs =
            self.open + self.closed + self.filtered + self.unfiltered + self.open_filtered + self.errors;
        if self.completed_jobs == 0 {
            self.avg_response_time_ms = 0.0;
            self.open_rate = 0.0;
            self.filtered_rate = 0.0;
            return;
        }
        let completed = self.completed_jobs as f64;
        self.avg_response_time_ms = self.response_time_total_us as f64 / completed / 1000.0;
        self.open_rate = self.open as f64 * 100.0 / completed;
        self.filtered_rate = (self.filtered + self.open_filtered) as f64 * 100.0 / completed;
    }

    /// completed / total x 100
    pub fn progress(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.0;
        }
        (self.completed_jobs as f64 * 100.0 / self.total_jobs as f64).min(100.0)
    }
}

/// What ingestion did with a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First result for its job
    Recorded,
    /// Superseded an older result for the same job
    Replaced,
    /// Older than or as old as the recorded one; ignored
    Stale,
}

/// Snapshot returned by [`TaskManager::get_task_status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub statistics: TaskStatistics,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

struct TaskRecord {
    task: ScanTask,
    results: HashMap<JobKey, ScanResult>,
    stats: TaskStatistics,
}

impl TaskRecord {
    fn new(task: ScanTask) -> Self {
        let stats = TaskStatistics::new(task.total_jobs);
        Self {
            task,
            results: HashMap::new(),
            stats,
        }
    }

    fn ingest(&mut self, result: &ScanResult) -> IngestOutcome {
        self.stats.result_count += 1;
        match self.results.entry(result.key()) {
            Entry::Vacant(slot) => {
                self.stats.record(result);
                slot.insert(result.clone());
                IngestOutcome::Recorded
            }
            Entry::Occupied(mut slot) if result.sequence > slot.get().sequence => {
                self.stats.revert(slot.get());
                self.stats.record(result);
                slot.insert(result.clone());
                IngestOutcome::Replaced
            }
            Entry::Occupied(_) => IngestOutcome::Stale,
        }
    }

    fn is_done(&self) -> bool {
        self.stats.completed_jobs >= self.task.total_jobs
    }

    fn report(&self) -> TaskReport {
        let progress = if self.task.status == TaskStatus::Completed {
            100.0
        } else {
            self.stats.progress()
        };
        TaskReport {
            id: self.task.id,
            name: self.task.name.clone(),
            status: self.task.status,
            progress,
            statistics: self.stats.clone(),
            created_at: self.task.created_at,
            started_at: self.task.started_at,
            finished_at: self.task.finished_at,
            error: self.task.error.clone(),
        }
    }
}

/// Owns task state; every mutation of a [`ScanTask`] goes through here
pub struct TaskManager {
    dispatcher: Arc<dyn JobDispatcher>,
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    max_concurrent_tasks: usize,
    target_parser: TargetParser,
    results_tx: broadcast::Sender<ScanResult>,
    status_tx: watch::Sender<u64>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl TaskManager {
    pub fn new(dispatcher: Arc<dyn JobDispatcher>) -> Self {
        let (results_tx, _) = broadcast::channel(RESULT_STREAM_CAPACITY);
        let (status_tx, _) = watch::channel(0);
        Self {
            dispatcher,
            tasks: RwLock::new(HashMap::new()),
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            target_parser: TargetParser::default(),
            results_tx,
            status_tx,
            sink: None,
        }
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    pub fn with_target_parser(mut self, parser: TargetParser) -> Self {
        self.target_parser = parser;
        self
    }

    /// Forward every recorded result to a persistence collaborator
    pub fn with_result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, TaskRecord>> {
        match self.tasks.read() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, TaskRecord>> {
        match self.tasks.write() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn status_changed(&self) {
        self.status_tx.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn status_of(&self, id: TaskId) -> Result<TaskStatus> {
        self.read()
            .get(&id)
            .map(|record| record.task.status)
            .ok_or_else(|| ScanError::TaskNotFound(id.to_string()))
    }

    /// Move a task to `to` unless it already got there; transitions made
    /// impossible by a concurrent change are logged and skipped.
    fn settle(&self, id: TaskId, to: TaskStatus) -> Result<()> {
        let changed = {
            let mut tasks = self.write();
            let record = tasks
                .get_mut(&id)
                .ok_or_else(|| ScanError::TaskNotFound(id.to_string()))?;
            if record.task.status == to {
                false
            } else if record.task.status.can_transition(to) {
                record.task.transition(to)?;
                true
            } else {
                log::debug!(
                    "skipping transition task={} from={} to={}",
                    id,
                    record.task.status,
                    to
                );
                false
            }
        };
        if changed {
            self.status_changed();
        }
        Ok(())
    }

    pub fn create_task(&self, config: TaskConfig) -> Result<TaskId> {
        let task = ScanTask::with_parser(config, &self.target_parser)?;
        let id = task.id;
        log::info!(
            "task created task={} name={} targets={} ports={} jobs={}",
            id,
            task.name,
            task.targets.len(),
            task.ports.len(),
            task.total_jobs
        );
        self.write().insert(id, TaskRecord::new(task));
        self.status_changed();
        Ok(id)
    }

    pub async fn start_task(&self, id: TaskId) -> Result<()> {
        let task = {
            let mut tasks = self.write();
            let active = tasks.values().filter(|record| record.task.status.is_active()).count();
            let record = tasks
                .get_mut(&id)
                .ok_or_else(|| ScanError::TaskNotFound(id.to_string()))?;
            match record.task.status {
                TaskStatus::Pending => {}
                TaskStatus::Running | TaskStatus::Paused | TaskStatus::Completed => return Ok(()),
                other => return Err(invalid_transition(other, TaskStatus::Running)),
            }
            if active >= self.max_concurrent_tasks {
                return Err(ScanError::ConfigError(format!(
                    "maximum number of concurrent tasks ({}) reached",
                    self.max_concurrent_tasks
                )));
            }
            record.task.transition(TaskStatus::Running)?;
            record.task.clone()
        };
        self.status_changed();
        Logger::log_task_start(&task.name, task.total_jobs, task.config.technique.name());

        match self.dispatcher.submit_task(&task).await {
            Ok(queued) => {
                if queued != task.total_jobs {
                    log::warn!("task={} expected {} jobs, queued {}", id, task.total_jobs, queued);
                }
                Ok(())
            }
            Err(e) => {
                log::error!("task dispatch failed task={} error={}", id, e);
                {
                    let mut tasks = self.write();
                    if let Some(record) = tasks.get_mut(&id) {
                        record.task.error = Some(e.to_string());
                        if record.task.status.can_transition(TaskStatus::Failed) {
                            record.task.transition(TaskStatus::Failed)?;
                        }
                    }
                }
                self.status_changed();
                Err(e)
            }
        }
    }

    /// In-flight probes finish; nothing new starts until resumed
    pub async fn pause_task(&self, id: TaskId) -> Result<()> {
        match self.status_of(id)? {
            TaskStatus::Paused => return Ok(()),
            TaskStatus::Running => {}
            other => return Err(invalid_transition(other, TaskStatus::Paused)),
        }
        self.dispatcher.signal(ControlSignal::new(id, ControlKind::Pause)).await?;
        self.settle(id, TaskStatus::Paused)
    }

    pub async fn resume_task(&self, id: TaskId) -> Result<()> {
        match self.status_of(id)? {
            TaskStatus::Running => return Ok(()),
            TaskStatus::Paused => {}
            other => return Err(invalid_transition(other, TaskStatus::Running)),
        }
        self.dispatcher.signal(ControlSignal::new(id, ControlKind::Resume)).await?;
        self.settle(id, TaskStatus::Running)
    }

    /// Undispatched jobs are dropped at once; in-flight probes still report
    pub async fn cancel_task(&self, id: TaskId) -> Result<()> {
        match self.status_of(id)? {
            TaskStatus::Canceled => return Ok(()),
            TaskStatus::Pending => return self.settle(id, TaskStatus::Canceled),
            TaskStatus::Running | TaskStatus::Paused => {}
            other => return Err(invalid_transition(other, TaskStatus::Canceled)),
        }
        self.dispatcher.signal(ControlSignal::new(id, ControlKind::Cancel)).await?;
        self.settle(id, TaskStatus::Canceled)
    }

    pub fn get_task_status(&self, id: TaskId) -> Result<TaskReport> {
        self.read()
            .get(&id)
            .map(TaskRecord::report)
            .ok_or_else(|| ScanError::TaskNotFound(id.to_string()))
    }

    pub fn get_task(&self, id: TaskId) -> Result<ScanTask> {
        self.read()
            .get(&id)
            .map(|record| record.task.clone())
            .ok_or_else(|| ScanError::TaskNotFound(id.to_string()))
    }

    /// Reconciled results ordered by target, port and protocol
    pub fn get_results(&self, id: TaskId) -> Result<Vec<ScanResult>> {
        let tasks = self.read();
        let record = tasks
            .get(&id)
            .ok_or_else(|| ScanError::TaskNotFound(id.to_string()))?;
        let mut results: Vec<ScanResult> = record.results.values().cloned().collect();
        results.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(results)
    }

    pub fn list_tasks(&self) -> Vec<TaskReport> {
        let mut reports: Vec<TaskReport> = self.read().values().map(TaskRecord::report).collect();
        reports.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        reports
    }

    /// Only terminal tasks can be deleted
    pub fn delete_task(&self, id: TaskId) -> Result<()> {
        let mut tasks = self.write();
        let status = tasks
            .get(&id)
            .map(|record| record.task.status)
            .ok_or_else(|| ScanError::TaskNotFound(id.to_string()))?;
        if !status.is_terminal() {
            return Err(invalid_transition(status, "deleted"));
        }
        tasks.remove(&id);
        drop(tasks);
        self.dispatcher.release_task(id);
        log::info!("task deleted task={}", id);
        Ok(())
    }

    /// Stream of recorded and replaced results across all tasks
    pub fn subscribe_results(&self) -> broadcast::Receiver<ScanResult> {
        self.results_tx.subscribe()
    }

    /// Reconcile one result into its task without forwarding it
    pub fn record_result(&self, result: &ScanResult) -> Result<IngestOutcome> {
        let (outcome, finished) = {
            let mut tasks = self.write();
            let record = tasks
                .get_mut(&result.task_id)
                .ok_or_else(|| ScanError::TaskNotFound(result.task_id.to_string()))?;
            let outcome = record.ingest(result);

            let finished = if record.task.status.is_active() && record.is_done() {
                record.task.transition(TaskStatus::Completed)?;
                let elapsed = record
                    .task
                    .started_at
                    .and_then(|started| (Utc::now() - started).to_std().ok())
                    .unwrap_or_default();
                Logger::log_task_complete(
                    &record.task.name,
                    elapsed,
                    record.stats.open as u64,
                    record.task.total_jobs,
                );
                true
            } else {
                false
            };
            (outcome, finished)
        };

        if outcome == IngestOutcome::Stale {
            log::debug!(
                "stale result task={} target={} port={} sequence={}",
                result.task_id,
                result.target,
                result.port,
                result.sequence
            );
        }
        if finished || outcome != IngestOutcome::Stale {
            self.status_changed();
        }
        Ok(outcome)
    }

    /// Ingestion entry point: reconcile, then publish and persist unless stale
    pub async fn ingest(&self, result: ScanResult) -> Result<IngestOutcome> {
        let outcome = self.record_result(&result)?;
        if outcome == IngestOutcome::Stale {
            return Ok(outcome);
        }
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.store(&result).await {
                log::error!("failed to persist result task={} port={}: {}", result.task_id, result.port, e);
            }
        }
        // No subscribers is fine
        let _ = self.results_tx.send(result);
        Ok(outcome)
    }

    /// Feed a coordinator's result stream into [`TaskManager::ingest`]
    pub fn spawn_ingestion(self: Arc<Self>, mut results: mpsc::UnboundedReceiver<ScanResult>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                if let Err(e) = self.ingest(result).await {
                    log::warn!("result ingestion failed: {}", e);
                }
            }
        })
    }

    /// Wait until the task reaches a terminal status
    pub async fn wait_for_completion(&self, id: TaskId) -> Result<TaskReport> {
        let mut changes = self.status_tx.subscribe();
        loop {
            let report = self.get_task_status(id)?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            if changes.changed().await.is_err() {
                return Ok(report);
            }
        }
    }

    /// Wait for any status or progress change
    pub async fn changed(&self) {
        let mut changes = self.status_tx.subscribe();
        let _ = changes.changed().await;
    }
}
