//! Message broker between cluster nodes
//!
//! The broker carries three kinds of traffic: heartbeats (pub/sub plus a
//! TTL-keyed snapshot per node), per-node job queues, and a single event
//! queue from workers back to the master. Delivery is at-least-once; the job
//! ledger and result ingestion tolerate duplicates.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};

use super::{Heartbeat, WorkerEvent};
use crate::scanner::ScanJob;
use crate::task::control::ControlSignal;
use crate::{Result, ScanError};

/// Heartbeat topic; snapshot keys are `node_heartbeat:<node id>`
pub const HEARTBEAT_TOPIC: &str = "node_heartbeat";
/// Job queue keys are `scan_jobs:<node id>`
pub const JOB_QUEUE_PREFIX: &str = "scan_jobs";
pub const EVENT_QUEUE: &str = "scan_events";
pub const CONTROL_TOPIC: &str = "task_control";

const CHANNEL_CAPACITY: usize = 1024;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a heartbeat and keep it readable for `ttl`
    async fn publish_heartbeat(&self, heartbeat: &Heartbeat, ttl: Duration) -> Result<()>;

    /// Heartbeats whose TTL has not expired
    async fn live_heartbeats(&self) -> Result<Vec<Heartbeat>>;

    fn subscribe_heartbeats(&self) -> broadcast::Receiver<Heartbeat>;

    async fn push_job(&self, node_id: &str, job: &ScanJob) -> Result<()>;

    /// Block up to `wait` on the node's own queue
    async fn pop_job(&self, node_id: &str, wait: Duration) -> Result<Option<ScanJob>>;

    /// Remove and return everything still queued for the node
    async fn drain_jobs(&self, node_id: &str) -> Result<Vec<ScanJob>>;

    async fn queue_len(&self, node_id: &str) -> Result<usize>;

    async fn publish_event(&self, event: &WorkerEvent) -> Result<()>;

    async fn next_event(&self, wait: Duration) -> Result<Option<WorkerEvent>>;

    async fn publish_control(&self, signal: &ControlSignal) -> Result<()>;

    fn subscribe_control(&self) -> broadcast::Receiver<ControlSignal>;
}

#[derive(Default)]
struct Queue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl Queue {
    fn items(&self) -> MutexGuard<'_, VecDeque<String>> {
        match self.items.lock() {
            Ok(items) => items,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, payload: String) {
        self.items().push_back(payload);
        self.notify.notify_one();
    }

    async fn pop(&self, wait: Duration) -> Option<String> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(payload) = self.items().pop_front() {
                return Some(payload);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            // A push between the check and this wait leaves a stored permit
            if tokio::time::timeout(remaining, self.notify.notified()).await.is_err() {
                return self.items().pop_front();
            }
        }
    }
}

/// In-process broker for single-host clusters and tests.
///
/// Payloads are stored JSON-encoded so the same serialization path is
/// exercised as with an external broker.
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    heartbeats: Mutex<HashMap<String, (String, Instant)>>,
    heartbeat_tx: broadcast::Sender<Heartbeat>,
    control_tx: broadcast::Sender<ControlSignal>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (heartbeat_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (control_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            queues: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            heartbeat_tx,
            control_tx,
        }
    }

    fn queue(&self, key: &str) -> Arc<Queue> {
        let mut queues = match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };
        queues.entry(key.to_string()).or_default().clone()
    }

    fn job_key(node_id: &str) -> String {
        format!("{}:{}", JOB_QUEUE_PREFIX, node_id)
    }

    fn heartbeats(&self) -> MutexGuard<'_, HashMap<String, (String, Instant)>> {
        match self.heartbeats.lock() {
            Ok(heartbeats) => heartbeats,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish_heartbeat(&self, heartbeat: &Heartbeat, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(heartbeat)?;
        let key = format!("{}:{}", HEARTBEAT_TOPIC, heartbeat.node_id);
        self.heartbeats().insert(key, (payload, Instant::now() + ttl));
        // No subscribers is fine
        let _ = self.heartbeat_tx.send(heartbeat.clone());
        Ok(())
    }

    async fn live_heartbeats(&self) -> Result<Vec<Heartbeat>> {
        let now = Instant::now();
        let mut heartbeats = self.heartbeats();
        heartbeats.retain(|_, (_, expires_at)| *expires_at > now);
        heartbeats
            .values()
            .map(|(payload, _)| serde_json::from_str(payload).map_err(ScanError::from))
            .collect()
    }

    fn subscribe_heartbeats(&self) -> broadcast::Receiver<Heartbeat> {
        self.heartbeat_tx.subscribe()
    }

    async fn push_job(&self, node_id: &str, job: &ScanJob) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        self.queue(&Self::job_key(node_id)).push(payload);
        Ok(())
    }

    async fn pop_job(&self, node_id: &str, wait: Duration) -> Result<Option<ScanJob>> {
        match self.queue(&Self::job_key(node_id)).pop(wait).await {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn drain_jobs(&self, node_id: &str) -> Result<Vec<ScanJob>> {
        let drained: Vec<String> = self.queue(&Self::job_key(node_id)).items().drain(..).collect();
        drained
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(ScanError::from))
            .collect()
    }

    async fn queue_len(&self, node_id: &str) -> Result<usize> {
        Ok(self.queue(&Self::job_key(node_id)).items().len())
    }

    async fn publish_event(&self, event: &WorkerEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.queue(EVENT_QUEUE).push(payload);
        Ok(())
    }

    async fn next_event(&self, wait: Duration) -> Result<Option<WorkerEvent>> {
        match self.queue(EVENT_QUEUE).pop(wait).await {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn publish_control(&self, signal: &ControlSignal) -> Result<()> {
        log::debug!("publishing control topic={} task={} kind={:?}", CONTROL_TOPIC, signal.task_id, signal.kind);
        let _ = self.control_tx.send(signal.clone());
        Ok(())
    }

    fn subscribe_control(&self) -> broadcast::Receiver<ControlSignal> {
        self.control_tx.subscribe()
    }
}
