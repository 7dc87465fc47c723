//! Per-task pause and cancel signals
//!
//! Each node keeps its own `TaskControls`; the master broadcasts
//! [`ControlSignal`]s and every node applies them locally. Workers consult
//! [`TaskControls::checkpoint`] right before a probe starts, so a signal
//! never interrupts a probe already on the wire. The checkpoint never waits:
//! a paused job is handed back rather than holding a worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::scanner::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Pause,
    Resume,
    Cancel,
}

/// Control message broadcast from the master to every node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSignal {
    pub task_id: TaskId,
    pub kind: ControlKind,
    pub issued_at: DateTime<Utc>,
}

impl ControlSignal {
    pub fn new(task_id: TaskId, kind: ControlKind) -> Self {
        Self {
            task_id,
            kind,
            issued_at: Utc::now(),
        }
    }
}

/// Decision taken at a job's start checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Proceed,
    /// Task paused; give the job back for later dispatch
    Defer,
    /// Task canceled; drop the job
    Discard,
}

#[derive(Default)]
struct TaskToken {
    paused: AtomicBool,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct TaskControls {
    tokens: RwLock<HashMap<TaskId, Arc<TaskToken>>>,
}

impl TaskControls {
    pub fn new() -> Self {
        Self::default()
    }

    fn token(&self, task_id: TaskId) -> Arc<TaskToken> {
        if let Ok(tokens) = self.tokens.read() {
            if let Some(token) = tokens.get(&task_id) {
                return token.clone();
            }
        }
        let mut tokens = match self.tokens.write() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };
        tokens
            .entry(task_id)
            .or_insert_with(|| Arc::new(TaskToken::default()))
            .clone()
    }

    pub fn apply(&self, signal: &ControlSignal) {
        match signal.kind {
            ControlKind::Pause => self.pause(signal.task_id),
            ControlKind::Resume => self.resume(signal.task_id),
            ControlKind::Cancel => self.cancel(signal.task_id),
        }
    }

    pub fn pause(&self, task_id: TaskId) {
        self.token(task_id).paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self, task_id: TaskId) {
        self.token(task_id).paused.store(false, Ordering::SeqCst);
    }

    /// Cancellation is permanent for the task id
    pub fn cancel(&self, task_id: TaskId) {
        self.token(task_id).cancel.cancel();
    }

    pub fn is_paused(&self, task_id: TaskId) -> bool {
        self.token(task_id).paused.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self, task_id: TaskId) -> bool {
        self.token(task_id).cancel.is_cancelled()
    }

    /// Whether the master may hand out jobs of this task right now
    pub fn is_dispatchable(&self, task_id: TaskId) -> bool {
        let token = self.token(task_id);
        !token.cancel.is_cancelled() && !token.paused.load(Ordering::SeqCst)
    }

    /// Decide a job's fate right before its probe; cancel wins over pause
    pub fn checkpoint(&self, task_id: TaskId) -> Checkpoint {
        let token = self.token(task_id);
        if token.cancel.is_cancelled() {
            Checkpoint::Discard
        } else if token.paused.load(Ordering::SeqCst) {
            Checkpoint::Defer
        } else {
            Checkpoint::Proceed
        }
    }

    /// Drop the state of a finished task
    pub fn forget(&self, task_id: TaskId) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.remove(&task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_unknown_task_proceeds() {
        let controls = TaskControls::new();
        assert_eq!(controls.checkpoint(Uuid::new_v4()), Checkpoint::Proceed);
    }

    #[test]
    fn test_cancel_discards() {
        let controls = TaskControls::new();
        let task = Uuid::new_v4();
        controls.apply(&ControlSignal::new(task, ControlKind::Cancel));
        assert_eq!(controls.checkpoint(task), Checkpoint::Discard);
        assert!(!controls.is_dispatchable(task));
    }

    #[test]
    fn test_pause_defers_until_resume() {
        let controls = TaskControls::new();
        let task = Uuid::new_v4();
        controls.apply(&ControlSignal::new(task, ControlKind::Pause));
        assert!(controls.is_paused(task));
        assert!(!controls.is_dispatchable(task));
        assert_eq!(controls.checkpoint(task), Checkpoint::Defer);

        controls.apply(&ControlSignal::new(task, ControlKind::Resume));
        assert!(controls.is_dispatchable(task));
        assert_eq!(controls.checkpoint(task), Checkpoint::Proceed);
    }

    #[test]
    fn test_cancel_while_paused_discards() {
        let controls = TaskControls::new();
        let task = Uuid::new_v4();
        controls.pause(task);
        controls.cancel(task);
        assert_eq!(controls.checkpoint(task), Checkpoint::Discard);

        // Cancel is permanent
        controls.resume(task);
        assert_eq!(controls.checkpoint(task), Checkpoint::Discard);
        assert!(controls.is_canceled(task));
    }

    #[test]
    fn test_forget_resets_state() {
        let controls = TaskControls::new();
        let task = Uuid::new_v4();
        controls.pause(task);
        controls.forget(task);
        assert!(!controls.is_paused(task));
        assert_eq!(controls.checkpoint(task), Checkpoint::Proceed);
    }
}
