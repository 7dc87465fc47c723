//! Deimos - distributed port-scanning core
//!
//! A master node expands scan tasks into per-port jobs and spreads them over
//! worker nodes; each worker runs the jobs through a rate-limited pool of
//! technique executors and reports the results back for reconciliation.

pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod pool;
pub mod rate;
pub mod scanner;
pub mod task;
pub mod utils;

// Re-export commonly used types
pub use cluster::{Broker, ClusterCoordinator, JobDispatcher, MemoryBroker, NodeRole, NodeStatus};
pub use config::{EngineConfig, NodeConfig, RateConfig, TaskConfig};
pub use error::{ErrorHandler, ScanError};
pub use network::{PortState, Protocol, ScanTechnique};
pub use pool::WorkerPool;
pub use rate::AdaptiveRateController;
pub use scanner::{ScanJob, ScanResult};
pub use task::{TaskManager, TaskReport, TaskStatistics, TaskStatus};

pub type Result<T> = std::result::Result<T, ScanError>;
