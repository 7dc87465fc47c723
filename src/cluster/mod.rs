//! Cluster membership and coordination
//!
//! Every node runs a [`ClusterCoordinator`] in either the master or the
//! worker role. Nodes only talk through a [`Broker`]: workers publish
//! heartbeats and job events, the master pushes jobs onto per-node queues
//! and broadcasts task control signals.

pub mod broker;
pub mod coordinator;
pub mod ledger;
pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::network::protocol::NetworkUtils;
use crate::scanner::{JobId, ScanResult, TaskId};
use crate::task::control::ControlSignal;
use crate::task::ScanTask;
use crate::Result;

pub use broker::{Broker, MemoryBroker};
pub use coordinator::ClusterCoordinator;
pub use ledger::{Completion, JobLedger, JobState};
pub use registry::ClusterRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    #[default]
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Busy,
}

impl NodeStatus {
    /// Online and busy nodes both accept dispatch
    pub fn is_healthy(&self) -> bool {
        !matches!(self, NodeStatus::Offline)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
            NodeStatus::Busy => write!(f, "busy"),
        }
    }
}

/// Local lifecycle of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLifecycle {
    Starting,
    Registered,
    Running,
    Deregistering,
    Stopped,
}

/// Liveness and load report published by every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub role: NodeRole,
    pub address: String,
    pub status: NodeStatus,
    /// In-flight jobs over pool size
    pub load: f64,
    /// Worker pool size
    pub capacity: usize,
    /// Jobs the master may keep outstanding on this node
    pub max_pending: usize,
    pub active_jobs: usize,
    pub cpu_usage: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub total_scans: u64,
    pub failed_scans: u64,
    pub timestamp: DateTime<Utc>,
}

/// Master-side view of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub role: NodeRole,
    pub address: String,
    pub status: NodeStatus,
    pub load: f64,
    pub capacity: usize,
    pub max_pending: usize,
    pub active_jobs: usize,
    pub cpu_usage: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub total_scans: u64,
    pub failed_scans: u64,
    /// Receipt time on the master's clock
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeInfo {
    pub fn from_heartbeat(heartbeat: &Heartbeat) -> Self {
        Self {
            id: heartbeat.node_id.clone(),
            role: heartbeat.role,
            address: heartbeat.address.clone(),
            status: heartbeat.status,
            load: heartbeat.load,
            capacity: heartbeat.capacity.max(1),
            max_pending: heartbeat.max_pending.max(1),
            active_jobs: heartbeat.active_jobs,
            cpu_usage: heartbeat.cpu_usage,
            memory_bytes: heartbeat.memory_bytes,
            total_scans: heartbeat.total_scans,
            failed_scans: heartbeat.failed_scans,
            last_heartbeat: Utc::now(),
        }
    }
}

/// Job progress reported by a worker to the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Job accepted into the node's pool
    Started {
        job_id: JobId,
        node_id: String,
        sequence: u64,
    },
    Finished(ScanResult),
    /// Dropped before probing because its task was canceled
    Discarded { job_id: JobId, node_id: String },
    /// Handed back unprocessed during node shutdown
    Returned { job_id: JobId, node_id: String },
}

/// Entry point the task manager uses to hand tasks to the cluster
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Expand the task into jobs and queue them; returns the job count
    async fn submit_task(&self, task: &ScanTask) -> Result<usize>;

    /// Apply a pause/resume/cancel signal cluster-wide
    async fn signal(&self, signal: ControlSignal) -> Result<()>;

    /// Drop cluster-side bookkeeping of a deleted task
    fn release_task(&self, _task_id: TaskId) {}
}

/// Node id in the form `hostname-ip-nanos`
pub fn generate_node_id(address: &str) -> String {
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string());
    let ip = NetworkUtils::get_local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| address.to_string());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();

    format!("{}-{}-{}", hostname, ip, nanos)
}
