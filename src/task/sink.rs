//! Persistence hand-off for reconciled results

use async_trait::async_trait;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::scanner::ScanResult;
use crate::Result;

/// Receives every result the task manager records or replaces
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(&self, result: &ScanResult) -> Result<()>;
}

/// Appends results as JSON lines; a replaced result is appended again and
/// readers keep the line with the highest sequence per job.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// `~/.deimos/results/<name>.jsonl`
    pub fn in_home(name: &str) -> Result<Self> {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".deimos").join("results").join(format!("{}.jsonl", name)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn store(&self, result: &ScanResult) -> Result<()> {
        let mut line = serde_json::to_string(result)?;
        line.push('\n');
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PortState, ScanTechnique};
    use crate::scanner::ScanJob;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("nested").join("scan.jsonl")).unwrap();

        let job = ScanJob::new(Uuid::new_v4(), "10.0.0.5", 22, ScanTechnique::Connect);
        sink.store(&ScanResult::for_job(&job, PortState::Open)).await.unwrap();
        sink.store(&ScanResult::for_job(&job, PortState::Closed)).await.unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let states: Vec<PortState> = content
            .lines()
            .map(|line| serde_json::from_str::<ScanResult>(line).unwrap().state)
            .collect();
        assert_eq!(states, vec![PortState::Open, PortState::Closed]);
    }
}
