//! Configuration for deimos nodes, rate control and scan tasks

use crate::cluster::NodeRole;
use crate::network::ScanTechnique;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Upper bound on targets × ports accepted for one task
pub const MAX_JOBS_PER_TASK: usize = 10_000_000;

/// Top-level configuration file layout (`~/.deimos.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub node: NodeConfig,
    pub rate: RateConfig,
    pub task: TaskConfig,
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::ScanError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load_default_config() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let deimos_config = home_dir.join(".deimos.toml");

        if deimos_config.exists() {
            match Self::from_toml_file(&deimos_config) {
                Ok(config) => {
                    log::info!("loaded config from {}", deimos_config.display());
                    return config;
                }
                Err(e) => log::warn!("ignoring {}: {}", deimos_config.display(), e),
            }
        }

        Self::default()
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.node.validate()?;
        self.rate.validate()?;
        Ok(())
    }
}

/// Per-node settings: identity, pool sizing and cluster timers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub role: NodeRole,
    /// Address advertised to the rest of the cluster
    pub address: String,
    /// Explicit node id; generated as `hostname-ip-nanos` when absent
    pub node_id: Option<String>,
    pub pool_size: usize,
    pub queue_capacity: usize,
    /// Jobs the master keeps outstanding on this node at most
    pub dispatch_window: usize,
    pub heartbeat_interval_ms: u64,
    /// Heartbeat timeout as a multiple of the interval
    pub heartbeat_timeout_factor: u32,
    /// Broker-side heartbeat TTL as a multiple of the interval
    pub heartbeat_ttl_factor: u32,
    pub rebalance_interval_ms: u64,
    /// Load difference between most and least loaded node that triggers rebalancing
    pub skew_threshold: f64,
    pub max_dispatch_retries: u32,
    pub dispatch_retry_base_ms: u64,
    pub banner_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let pool_size = num_cpus::get().max(1) * 32;
        Self {
            role: NodeRole::Worker,
            address: "127.0.0.1".to_string(),
            node_id: None,
            pool_size,
            queue_capacity: pool_size * 4,
            dispatch_window: pool_size * 2,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_factor: 2,
            heartbeat_ttl_factor: 6,
            rebalance_interval_ms: 60_000,
            skew_threshold: 0.5,
            max_dispatch_retries: 5,
            dispatch_retry_base_ms: 1000,
            banner_timeout_ms: 500,
        }
    }
}

impl NodeConfig {
    pub fn master() -> Self {
        Self {
            role: NodeRole::Master,
            ..Self::default()
        }
    }

    pub fn worker() -> Self {
        Self::default()
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_dispatch_window(mut self, dispatch_window: usize) -> Self {
        self.dispatch_window = dispatch_window;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_rebalance_interval(mut self, interval_ms: u64) -> Self {
        self.rebalance_interval_ms = interval_ms;
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_dispatch_retries(mut self, max_retries: u32, base_ms: u64) -> Self {
        self.max_dispatch_retries = max_retries;
        self.dispatch_retry_base_ms = base_ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a node is presumed dead
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_timeout_factor
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_ttl_factor
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_millis(self.banner_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.pool_size == 0 {
            return Err(crate::ScanError::ConfigError("pool_size must be greater than 0".to_string()));
        }
        if self.queue_capacity == 0 || self.dispatch_window == 0 {
            return Err(crate::ScanError::ConfigError(
                "queue_capacity and dispatch_window must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_timeout_factor < 2 {
            return Err(crate::ScanError::ConfigError(
                "heartbeat timeout must be at least twice a non-zero interval".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.skew_threshold) {
            return Err(crate::ScanError::ConfigError("skew_threshold must be within [0, 1]".to_string()));
        }
        Ok(())
    }
}

/// Adaptive rate controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Probes per second at start
    pub initial_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    /// Permit bucket capacity
    pub burst: f64,
    /// Completed probes per adjustment round
    pub batch_size: u32,
    /// Latency samples kept for the moving average
    pub latency_window: usize,
    pub increase_success_ratio: f64,
    pub increase_latency_ms: u64,
    pub decrease_success_ratio: f64,
    pub decrease_latency_ms: u64,
    pub growth_factor: f64,
    /// Weight of the new target rate in the smoothed update
    pub smoothing: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            initial_rate: 500.0,
            min_rate: 10.0,
            max_rate: 5000.0,
            burst: 100.0,
            batch_size: 100,
            latency_window: 100,
            increase_success_ratio: 0.95,
            increase_latency_ms: 100,
            decrease_success_ratio: 0.90,
            decrease_latency_ms: 200,
            growth_factor: 1.25,
            smoothing: 0.2,
        }
    }
}

impl RateConfig {
    pub fn with_bounds(mut self, min_rate: f64, max_rate: f64) -> Self {
        self.min_rate = min_rate;
        self.max_rate = max_rate;
        self
    }

    pub fn with_initial_rate(mut self, initial_rate: f64) -> Self {
        self.initial_rate = initial_rate;
        self
    }

    /// Cap the ceiling at `limit`, pulling the floor and start rate down with it
    pub fn with_rate_cap(self, limit: f64) -> Self {
        let (min, initial) = (self.min_rate.min(limit), self.initial_rate.min(limit));
        self.with_bounds(min, limit).with_initial_rate(initial)
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst = burst;
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        if !(self.min_rate > 0.0 && self.min_rate <= self.max_rate) {
            return Err(crate::ScanError::ConfigError(format!(
                "rate bounds invalid: min={} max={}",
                self.min_rate, self.max_rate
            )));
        }
        if self.burst < 1.0 || self.batch_size == 0 || self.latency_window == 0 {
            return Err(crate::ScanError::ConfigError(
                "burst must be >= 1 and batch_size/latency_window > 0".to_string(),
            ));
        }
        if self.growth_factor <= 1.0 || !(0.0..=1.0).contains(&self.smoothing) {
            return Err(crate::ScanError::ConfigError(
                "growth_factor must exceed 1 and smoothing lie within [0, 1]".to_string(),
            ));
        }
        if self.decrease_success_ratio > self.increase_success_ratio
            || self.increase_latency_ms > self.decrease_latency_ms
        {
            return Err(crate::ScanError::ConfigError(
                "decrease thresholds must be looser than increase thresholds".to_string(),
            ));
        }
        Ok(())
    }
}

/// Description of one scan task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub name: String,
    /// Hosts, addresses or CIDR blocks
    pub targets: Vec<String>,
    /// Port specification, e.g. `22,80,1000-2000`
    pub ports: String,
    pub technique: ScanTechnique,
    /// Jobs of this task outstanding across the cluster at most
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub retries: u32,
    pub service_detection: bool,
    pub banner_grab: bool,
    pub random_order: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: "scan".to_string(),
            targets: Vec::new(),
            ports: "1-1024".to_string(),
            technique: ScanTechnique::Connect,
            concurrency: 100,
            timeout_ms: 3000,
            retries: 2,
            service_detection: true,
            banner_grab: true,
            random_order: true,
        }
    }
}

impl TaskConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            targets: vec![target.into()],
            ..Self::default()
        }
    }

    /// Common service ports, short timeout
    pub fn fast() -> Self {
        Self {
            name: "fast".to_string(),
            ports: "21-23,25,80,443,3306,3389,8080".to_string(),
            concurrency: 200,
            timeout_ms: 1000,
            retries: 1,
            service_detection: false,
            banner_grab: false,
            ..Self::default()
        }
    }

    /// Every port, patient timeout
    pub fn full() -> Self {
        Self {
            name: "full".to_string(),
            ports: "1-65535".to_string(),
            timeout_ms: 5000,
            retries: 3,
            ..Self::default()
        }
    }

    /// Half-open SYN probes at reduced concurrency
    pub fn stealth() -> Self {
        Self {
            name: "stealth".to_string(),
            technique: ScanTechnique::Syn,
            concurrency: 50,
            banner_grab: false,
            ..Self::default()
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> crate::Result<Self> {
        match name {
            "default" => Ok(Self::default()),
            "fast" => Ok(Self::fast()),
            "full" => Ok(Self::full()),
            "stealth" => Ok(Self::stealth()),
            other => Err(crate::ScanError::ConfigError(format!("unknown preset '{}'", other))),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_ports(mut self, ports: impl Into<String>) -> Self {
        self.ports = ports.into();
        self
    }

    pub fn with_technique(mut self, technique: ScanTechnique) -> Self {
        self.technique = technique;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_service_detection(mut self, enabled: bool) -> Self {
        self.service_detection = enabled;
        self
    }

    pub fn with_banner_grab(mut self, enabled: bool) -> Self {
        self.banner_grab = enabled;
        self
    }

    pub fn with_random_order(mut self, enabled: bool) -> Self {
        self.random_order = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.targets.iter().all(|t| t.trim().is_empty()) {
            return Err(crate::ScanError::InvalidTarget("Target cannot be empty".to_string()));
        }
        if self.ports.trim().is_empty() {
            return Err(crate::ScanError::PortRangeError("No ports specified".to_string()));
        }
        if self.concurrency == 0 {
            return Err(crate::ScanError::ConfigError("concurrency must be greater than 0".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(crate::ScanError::ConfigError("timeout must be greater than 0".to_string()));
        }
        if self.retries > 10 {
            return Err(crate::ScanError::ConfigError("retries must not exceed 10".to_string()));
        }
        Ok(())
    }
}
