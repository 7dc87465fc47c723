//! Error handling for the deimos scanning core
//!
//! One error type is shared by every layer. Probe-level failures are not
//! errors here: they are folded into a port state by the executor. Only
//! control-path failures (bad input, full queues, broker trouble, illegal
//! task transitions) surface as `ScanError`.

use std::time::Duration;
use thiserror::Error;

/// Main error type for scanning operations
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Permission denied: {0}")]
    PermissionError(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Port range error: {0}")]
    PortRangeError(String),

    #[error("Timeout error")]
    TimeoutError,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Raw socket error: {0}")]
    RawSocketError(String),

    #[error("Worker queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    #[error("Worker pool is not running")]
    PoolNotRunning,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("No healthy worker node available")]
    NoHealthyNode,

    #[error("Broker error: {0}")]
    BrokerError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl ScanError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScanError::NetworkError(_)
                | ScanError::TimeoutError
                | ScanError::QueueFull { .. }
                | ScanError::NoHealthyNode
                | ScanError::BrokerError(_)
        )
    }
}

/// Backoff policy for recoverable control-path failures
#[derive(Debug, Clone)]
pub struct ErrorHandler {
    max_retries: u32,
    retry_delay_ms: u64,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl ErrorHandler {
    /// Create a new error handler with custom settings
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether the zero-based failed `attempt` may be tried again
    pub fn should_retry(&self, error: &ScanError, attempt: u32) -> bool {
        error.is_recoverable() && attempt < self.max_retries
    }

    /// Calculate retry delay with exponential backoff
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponential_delay = self
            .retry_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt.min(10)));
        Duration::from_millis(std::cmp::min(exponential_delay, 30_000)) // Cap at 30 seconds
    }
}

impl From<std::net::AddrParseError> for ScanError {
    fn from(e: std::net::AddrParseError) -> Self {
        ScanError::InvalidTarget(e.to_string())
    }
}

impl From<std::num::ParseIntError> for ScanError {
    fn from(e: std::num::ParseIntError) -> Self {
        ScanError::ParseError(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ScanError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ScanError::TimeoutError
    }
}

impl From<toml::de::Error> for ScanError {
    fn from(e: toml::de::Error) -> Self {
        ScanError::ConfigError(e.to_string())
    }
}
