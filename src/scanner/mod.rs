//! Scan jobs, their results, and the probe executors that turn one into the other

pub mod service;
pub mod techniques;
pub mod udp;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::network::{PortState, Protocol, ScanTechnique};

pub use service::{ServiceIdentifier, ServiceMatch};
pub use techniques::{ProbeEngine, ProbeOutcome, ProbeRequest, TechniqueExecutor};

pub type TaskId = Uuid;
pub type JobId = Uuid;

/// Identity of one probe target inside a task. Results are reconciled on this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub task_id: TaskId,
    pub target: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// A single (target, port, protocol, technique) probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: JobId,
    pub task_id: TaskId,
    pub target: String,
    pub port: u16,
    pub protocol: Protocol,
    pub technique: ScanTechnique,
    pub timeout_ms: u64,
    pub retries: u32,
    pub banner_grab: bool,
    pub service_detection: bool,
    /// Dispatch sequence assigned by the master; higher means newer
    pub sequence: u64,
}

impl ScanJob {
    pub fn new(task_id: TaskId, target: impl Into<String>, port: u16, technique: ScanTechnique) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            target: target.into(),
            port,
            protocol: technique.protocol(),
            technique,
            timeout_ms: 3000,
            retries: 0,
            banner_grab: false,
            service_detection: false,
            sequence: 0,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_banner_grab(mut self, enabled: bool) -> Self {
        self.banner_grab = enabled;
        self
    }

    pub fn with_service_detection(mut self, enabled: bool) -> Self {
        self.service_detection = enabled;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            task_id: self.task_id,
            target: self.target.clone(),
            port: self.port,
            protocol: self.protocol,
        }
    }
}

/// Outcome of one executed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub target: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Technique actually used; differs from the requested one after a connect fallback
    pub technique: ScanTechnique,
    pub state: PortState,
    pub service: Option<String>,
    pub version: Option<String>,
    pub banner: Option<String>,
    pub error: Option<String>,
    #[serde(with = "duration_millis")]
    pub response_time: Duration,
    pub node_id: Option<String>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl ScanResult {
    /// Result carrying only a state, before service data is attached
    pub fn for_job(job: &ScanJob, state: PortState) -> Self {
        Self {
            job_id: job.id,
            task_id: job.task_id,
            target: job.target.clone(),
            port: job.port,
            protocol: job.protocol,
            technique: job.technique,
            state,
            service: None,
            version: None,
            banner: None,
            error: None,
            response_time: Duration::ZERO,
            node_id: None,
            sequence: job.sequence,
            timestamp: Utc::now(),
        }
    }

    /// Error result for a job that could not be executed at all
    pub fn failed(job: &ScanJob, reason: impl Into<String>) -> Self {
        let mut result = Self::for_job(job, PortState::Error);
        result.error = Some(reason.into());
        result
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            task_id: self.task_id,
            target: self.target.clone(),
            port: self.port,
            protocol: self.protocol,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == PortState::Open
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_key_ignores_technique_and_sequence() {
        let task = Uuid::new_v4();
        let mut a = ScanJob::new(task, "10.0.0.5", 22, ScanTechnique::Connect);
        let b = ScanJob::new(task, "10.0.0.5", 22, ScanTechnique::Syn);
        a.sequence = 7;
        assert_ne!(a.id, b.id);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_udp_job_protocol() {
        let job = ScanJob::new(Uuid::new_v4(), "10.0.0.5", 53, ScanTechnique::Udp);
        assert_eq!(job.protocol, Protocol::Udp);
    }

    #[test]
    fn test_failed_result() {
        let job = ScanJob::new(Uuid::new_v4(), "nowhere.invalid", 80, ScanTechnique::Connect);
        let result = ScanResult::failed(&job, "resolution failed");
        assert_eq!(result.state, PortState::Error);
        assert_eq!(result.key(), job.key());
        assert_eq!(result.error.as_deref(), Some("resolution failed"));
    }

    #[test]
    fn test_result_wire_format() {
        let job = ScanJob::new(Uuid::new_v4(), "10.0.0.5", 443, ScanTechnique::Connect);
        let mut result = ScanResult::for_job(&job, PortState::Filtered);
        result.response_time = Duration::from_millis(42);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["state"], "filtered");
        assert_eq!(json["response_time"], 42);

        let back: ScanResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
