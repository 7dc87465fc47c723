//! Utility modules for the scanner

pub mod port_parser;
pub mod target_parser;

use std::time::{Duration, Instant};

/// Memory usage monitoring
pub struct MemoryMonitor;

impl MemoryMonitor {
    /// Get current memory usage in bytes (Unix only)
    #[cfg(unix)]
    pub fn current_usage() -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        status
            .lines()
            .find(|line| line.starts_with("VmRSS:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    }

    #[cfg(not(unix))]
    pub fn current_usage() -> Option<u64> {
        None
    }

    /// Format bytes in human-readable format
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// CPU usage of this process between two samples
#[derive(Default)]
pub struct CpuMonitor {
    last_measurement: Option<CpuMeasurement>,
}

#[derive(Debug, Clone)]
struct CpuMeasurement {
    timestamp: Instant,
    ticks: u64,
}

impl CpuMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Percentage since the previous call; `None` on the first sample
    #[cfg(unix)]
    pub fn current_usage(&mut self) -> Option<f64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // Fields after the parenthesised command name; utime and stime are 14 and 15
        let rest = stat.rsplit_once(')')?.1;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 13 {
            return None;
        }
        let user: u64 = fields[11].parse().ok()?;
        let system: u64 = fields[12].parse().ok()?;

        let current = CpuMeasurement {
            timestamp: Instant::now(),
            ticks: user + system,
        };

        let usage = self.last_measurement.as_ref().and_then(|last| {
            let elapsed = current.timestamp.duration_since(last.timestamp).as_secs_f64();
            if elapsed <= 0.0 {
                return None;
            }
            // 100 clock ticks per second
            let busy = current.ticks.saturating_sub(last.ticks) as f64 / 100.0;
            Some((busy / elapsed * 100.0).min(100.0))
        });
        self.last_measurement = Some(current);
        usage
    }

    #[cfg(not(unix))]
    pub fn current_usage(&mut self) -> Option<f64> {
        None
    }
}

/// Logging utilities
pub struct Logger;

impl Logger {
    /// Initialize logger with specified level; `RUST_LOG` still overrides per module
    pub fn init(level: log::LevelFilter) {
        let _ = env_logger::Builder::from_default_env()
            .filter_level(level)
            .format_timestamp_secs()
            .try_init();
    }

    pub fn log_task_start(name: &str, jobs: usize, technique: &str) {
        log::info!("starting task name={} jobs={} technique={}", name, jobs, technique);
    }

    pub fn log_task_complete(name: &str, duration: Duration, open_ports: u64, total_jobs: usize) {
        log::info!(
            "task finished name={} elapsed={:.2}s open={}/{}",
            name,
            duration.as_secs_f64(),
            open_ports,
            total_jobs
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(MemoryMonitor::format_bytes(512), "512.00 B");
        assert_eq!(MemoryMonitor::format_bytes(1536), "1.50 KB");
        assert_eq!(MemoryMonitor::format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_monitors_read_procfs() {
        assert!(MemoryMonitor::current_usage().unwrap_or(0) > 0);
        let mut cpu = CpuMonitor::new();
        assert!(cpu.current_usage().is_none());
        std::thread::sleep(Duration::from_millis(20));
        let usage = cpu.current_usage().unwrap();
        assert!((0.0..=100.0).contains(&usage));
    }
}
