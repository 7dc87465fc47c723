//! Master-side job ledger
//!
//! Tracks every job of every submitted task through
//! `queued -> assigned(node) -> in-flight(node) -> completed | abandoned`.
//! Jobs of a failed node go back to `queued`. Each assignment stamps the job
//! with a fresh, strictly increasing sequence number so results from an
//! earlier assignment can be told apart from the current one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::scanner::{JobId, ScanJob, ScanResult, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Assigned(String),
    InFlight(String),
    Completed,
    Abandoned,
}

impl JobState {
    fn node(&self) -> Option<&str> {
        match self {
            JobState::Assigned(node) | JobState::InFlight(node) => Some(node),
            _ => None,
        }
    }
}

/// How a reported result relates to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// First result for the job
    Accepted,
    /// Result for a job failed for lack of workers; it supersedes the failure
    /// and must be forwarded with the carried sequence
    Recovered(u64),
    /// Job already completed or abandoned
    Duplicate,
    /// Job id never seen by this ledger
    Unknown,
}

/// Per-task job counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskJobCounts {
    pub total: usize,
    pub queued: usize,
    /// Assigned or in flight
    pub outstanding: usize,
    pub completed: usize,
    pub abandoned: usize,
    /// Outstanding jobs allowed at once
    pub concurrency: usize,
}

impl TaskJobCounts {
    fn leave(&mut self, state: &JobState) {
        match state {
            JobState::Queued => self.queued = self.queued.saturating_sub(1),
            JobState::Assigned(_) | JobState::InFlight(_) => self.outstanding = self.outstanding.saturating_sub(1),
            JobState::Completed => self.completed = self.completed.saturating_sub(1),
            JobState::Abandoned => self.abandoned = self.abandoned.saturating_sub(1),
        }
    }

    fn enter(&mut self, state: &JobState) {
        match state {
            JobState::Queued => self.queued += 1,
            JobState::Assigned(_) | JobState::InFlight(_) => self.outstanding += 1,
            JobState::Completed => self.completed += 1,
            JobState::Abandoned => self.abandoned += 1,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.queued == 0 && self.outstanding == 0
    }
}

struct LedgerEntry {
    job: ScanJob,
    state: JobState,
    attempts: u32,
    /// Abandoned because no worker was reachable, not by a cancel
    unreachable: bool,
}

#[derive(Default)]
struct LedgerInner {
    entries: HashMap<JobId, LedgerEntry>,
    pending: VecDeque<JobId>,
    tasks: HashMap<TaskId, TaskJobCounts>,
    node_outstanding: HashMap<String, usize>,
    next_sequence: u64,
}

impl LedgerInner {
    fn transition(&mut self, job_id: JobId, next: JobState) -> Option<JobState> {
        let entry = self.entries.get_mut(&job_id)?;
        let previous = std::mem::replace(&mut entry.state, next.clone());

        let counts = self.tasks.entry(entry.job.task_id).or_default();
        counts.leave(&previous);
        counts.enter(&next);

        if let Some(node) = previous.node() {
            if let Some(count) = self.node_outstanding.get_mut(node) {
                *count = count.saturating_sub(1);
            }
        }
        if let Some(node) = next.node() {
            *self.node_outstanding.entry(node.to_string()).or_default() += 1;
        }
        Some(previous)
    }

    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn requeue(&mut self, job_id: JobId) -> bool {
        let outstanding = matches!(
            self.entries.get(&job_id).map(|entry| &entry.state),
            Some(JobState::Assigned(_)) | Some(JobState::InFlight(_))
        );
        if !outstanding {
            return false;
        }
        self.transition(job_id, JobState::Queued);
        if let Some(entry) = self.entries.get_mut(&job_id) {
            entry.attempts += 1;
        }
        // Reassigned work goes first
        self.pending.push_front(job_id);
        true
    }
}

#[derive(Default)]
pub struct JobLedger {
    inner: RwLock<LedgerInner>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerInner> {
        match self.inner.read() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerInner> {
        match self.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a task's jobs
    pub fn enqueue(&self, task_id: TaskId, concurrency: usize, jobs: Vec<ScanJob>) -> usize {
        let mut guard = self.write();
        let inner = &mut *guard;
        let counts = inner.tasks.entry(task_id).or_default();
        counts.concurrency = concurrency.max(1);
        counts.total += jobs.len();
        counts.queued += jobs.len();

        let added = jobs.len();
        for job in jobs {
            inner.pending.push_back(job.id);
            inner.entries.insert(
                job.id,
                LedgerEntry {
                    job,
                    state: JobState::Queued,
                    attempts: 0,
                    unreachable: false,
                },
            );
        }
        added
    }

    /// Assign the first eligible queued job to `node_id`.
    ///
    /// Jobs rejected by `dispatchable` (paused tasks) and jobs of tasks at
    /// their concurrency limit stay queued in place.
    pub fn assign_next<F>(&self, node_id: &str, dispatchable: F) -> Option<ScanJob>
    where
        F: Fn(&ScanJob) -> bool,
    {
        let mut guard = self.write();
        let inner = &mut *guard;
        let waiting_tasks = inner.tasks.values().filter(|counts| counts.queued > 0).count();
        let mut blocked = HashSet::new();
        let mut index = 0;
        while index < inner.pending.len() && blocked.len() < waiting_tasks {
            let job_id = inner.pending[index];
            let Some(entry) = inner.entries.get(&job_id) else {
                inner.pending.remove(index);
                continue;
            };
            if entry.state != JobState::Queued {
                // Settled while queued (late result or cancel)
                inner.pending.remove(index);
                continue;
            }
            let at_limit = inner
                .tasks
                .get(&entry.job.task_id)
                .map(|counts| counts.outstanding >= counts.concurrency)
                .unwrap_or(false);
            if at_limit || !dispatchable(&entry.job) {
                blocked.insert(entry.job.task_id);
                index += 1;
                continue;
            }

            inner.pending.remove(index);
            let sequence = inner.next_sequence();
            inner.transition(job_id, JobState::Assigned(node_id.to_string()));
            let entry = inner.entries.get_mut(&job_id)?;
            entry.job.sequence = sequence;
            return Some(entry.job.clone());
        }
        None
    }

    /// Worker accepted the job into its pool
    pub fn mark_in_flight(&self, job_id: JobId, node_id: &str, sequence: u64) -> bool {
        let mut guard = self.write();
        let inner = &mut *guard;
        let current = match inner.entries.get(&job_id) {
            Some(entry) => entry.state == JobState::Assigned(node_id.to_string()) && entry.job.sequence == sequence,
            None => false,
        };
        if current {
            inner.transition(job_id, JobState::InFlight(node_id.to_string()));
        }
        current
    }

    /// Settle a job with its result
    pub fn complete(&self, result: &ScanResult) -> Completion {
        let mut guard = self.write();
        let inner = &mut *guard;
        let (state, unreachable) = match inner.entries.get(&result.job_id) {
            Some(entry) => (entry.state.clone(), entry.unreachable),
            None => return Completion::Unknown,
        };
        match state {
            JobState::Abandoned if unreachable => {
                let sequence = inner.next_sequence();
                inner.transition(result.job_id, JobState::Completed);
                if let Some(entry) = inner.entries.get_mut(&result.job_id) {
                    entry.unreachable = false;
                    entry.job.sequence = sequence;
                }
                Completion::Recovered(sequence)
            }
            JobState::Completed | JobState::Abandoned => Completion::Duplicate,
            _ => {
                // A result for a requeued job still counts; its queue slot is skipped later
                inner.transition(result.job_id, JobState::Completed);
                Completion::Accepted
            }
        }
    }

    /// Job dropped by a worker because its task was canceled
    pub fn mark_abandoned(&self, job_id: JobId) -> bool {
        let mut guard = self.write();
        let inner = &mut *guard;
        match inner.entries.get(&job_id).map(|entry| entry.state.clone()) {
            Some(JobState::Completed) | Some(JobState::Abandoned) | None => false,
            Some(_) => {
                inner.transition(job_id, JobState::Abandoned);
                true
            }
        }
    }

    /// Return every outstanding job of a node to the queue
    pub fn requeue_node(&self, node_id: &str) -> usize {
        let mut guard = self.write();
        let inner = &mut *guard;
        let ids: Vec<JobId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.node() == Some(node_id))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter(|id| inner.requeue(*id)).count()
    }

    /// Return specific outstanding jobs to the queue
    pub fn requeue_jobs(&self, job_ids: &[JobId]) -> usize {
        let mut guard = self.write();
        let inner = &mut *guard;
        job_ids.iter().filter(|id| inner.requeue(**id)).count()
    }

    /// Abandon a task's queued jobs; outstanding ones are left to finish
    pub fn cancel_task(&self, task_id: TaskId) -> usize {
        let mut guard = self.write();
        let inner = &mut *guard;
        let ids: Vec<JobId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.job.task_id == task_id && entry.state == JobState::Queued)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            inner.transition(*id, JobState::Abandoned);
        }
        ids.len()
    }

    /// Abandon queued jobs accepted by `filter`, returning them stamped with a fresh sequence.
    ///
    /// A result reported later for one of these jobs still completes it.
    pub fn abandon_queued<F>(&self, filter: F) -> Vec<ScanJob>
    where
        F: Fn(&ScanJob) -> bool,
    {
        let mut guard = self.write();
        let inner = &mut *guard;
        let ids: Vec<JobId> = inner.pending.drain(..).collect();
        let mut abandoned = Vec::new();
        for id in ids {
            let eligible = match inner.entries.get(&id) {
                Some(entry) if entry.state == JobState::Queued => filter(&entry.job),
                _ => continue,
            };
            if !eligible {
                inner.pending.push_back(id);
                continue;
            }
            let sequence = inner.next_sequence();
            inner.transition(id, JobState::Abandoned);
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.job.sequence = sequence;
                entry.unreachable = true;
                abandoned.push(entry.job.clone());
            }
        }
        abandoned
    }

    /// Jobs assigned or in flight on a node
    pub fn outstanding(&self, node_id: &str) -> usize {
        self.read().node_outstanding.get(node_id).copied().unwrap_or(0)
    }

    pub fn has_queued(&self) -> bool {
        self.read().tasks.values().any(|counts| counts.queued > 0)
    }

    pub fn state(&self, job_id: JobId) -> Option<JobState> {
        self.read().entries.get(&job_id).map(|entry| entry.state.clone())
    }

    pub fn attempts(&self, job_id: JobId) -> Option<u32> {
        self.read().entries.get(&job_id).map(|entry| entry.attempts)
    }

    pub fn task_counts(&self, task_id: TaskId) -> Option<TaskJobCounts> {
        self.read().tasks.get(&task_id).cloned()
    }

    /// Drop all bookkeeping of a task
    pub fn forget_task(&self, task_id: TaskId) {
        let mut guard = self.write();
        let inner = &mut *guard;
        let ids: Vec<JobId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.job.task_id == task_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            inner.transition(id, JobState::Abandoned);
            inner.entries.remove(&id);
        }
        inner.tasks.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PortState, ScanTechnique};
    use uuid::Uuid;

    fn jobs(task: TaskId, count: u16) -> Vec<ScanJob> {
        (1..=count)
            .map(|port| ScanJob::new(task, "10.0.0.5", port, ScanTechnique::Connect))
            .collect()
    }

    #[test]
    fn test_assign_stamps_increasing_sequences() {
        let ledger = JobLedger::new();
        let task = Uuid::new_v4();
        ledger.enqueue(task, 10, jobs(task, 3));

        let a = ledger.assign_next("n1", |_| true).unwrap();
        let b = ledger.assign_next("n2", |_| true).unwrap();
        assert!(b.sequence > a.sequence);
        assert_eq!(ledger.outstanding("n1"), 1);
        assert_eq!(ledger.state(a.id), Some(JobState::Assigned("n1".to_string())));

        assert!(ledger.mark_in_flight(a.id, "n1", a.sequence));
        assert!(!ledger.mark_in_flight(b.id, "n1", b.sequence));
        assert_eq!(ledger.outstanding("n1"), 1);
    }

    #[test]
    fn test_task_concurrency_limit() {
        let ledger = JobLedger::new();
        let task = Uuid::new_v4();
        ledger.enqueue(task, 2, jobs(task, 5));

        assert!(ledger.assign_next("n1", |_| true).is_some());
        assert!(ledger.assign_next("n1", |_| true).is_some());
        assert!(ledger.assign_next("n1", |_| true).is_none());
        assert_eq!(ledger.task_counts(task).unwrap().queued, 3);
    }

    #[test]
    fn test_paused_tasks_are_skipped() {
        let ledger = JobLedger::new();
        let paused = Uuid::new_v4();
        let running = Uuid::new_v4();
        ledger.enqueue(paused, 10, jobs(paused, 2));
        ledger.enqueue(running, 10, jobs(running, 1));

        let job = ledger.assign_next("n1", |job| job.task_id != paused).unwrap();
        assert_eq!(job.task_id, running);
        assert!(ledger.assign_next("n1", |job| job.task_id != paused).is_none());
        assert_eq!(ledger.task_counts(paused).unwrap().queued, 2);
    }

    #[test]
    fn test_node_failure_requeues_outstanding() {
        let ledger = JobLedger::new();
        let task = Uuid::new_v4();
        ledger.enqueue(task, 10, jobs(task, 4));

        let first = ledger.assign_next("dead", |_| true).unwrap();
        let second = ledger.assign_next("dead", |_| true).unwrap();
        ledger.mark_in_flight(second.id, "dead", second.sequence);
        let done = ledger.assign_next("dead", |_| true).unwrap();
        ledger.complete(&ScanResult::for_job(&done, PortState::Open));

        assert_eq!(ledger.requeue_node("dead"), 2);
        assert_eq!(ledger.outstanding("dead"), 0);
        assert_eq!(ledger.attempts(first.id), Some(1));

        // Requeued jobs come back before untouched ones
        let next = ledger.assign_next("alive", |_| true).unwrap();
        assert!(next.id == first.id || next.id == second.id);
        assert!(next.sequence > done.sequence);
    }

    #[test]
    fn test_duplicate_completion() {
        let ledger = JobLedger::new();
        let task = Uuid::new_v4();
        ledger.enqueue(task, 10, jobs(task, 1));

        let job = ledger.assign_next("n1", |_| true).unwrap();
        let result = ScanResult::for_job(&job, PortState::Closed);
        assert_eq!(ledger.complete(&result), Completion::Accepted);
        assert_eq!(ledger.complete(&result), Completion::Duplicate);

        let stranger = ScanJob::new(task, "10.0.0.9", 1, ScanTechnique::Connect);
        assert_eq!(ledger.complete(&ScanResult::for_job(&stranger, PortState::Open)), Completion::Unknown);

        let counts = ledger.task_counts(task).unwrap();
        assert_eq!(counts.completed, 1);
        assert!(counts.is_settled());
    }

    #[test]
    fn test_late_result_for_requeued_job() {
        let ledger = JobLedger::new();
        let task = Uuid::new_v4();
        ledger.enqueue(task, 10, jobs(task, 1));

        let job = ledger.assign_next("slow", |_| true).unwrap();
        ledger.requeue_node("slow");
        assert_eq!(ledger.complete(&ScanResult::for_job(&job, PortState::Open)), Completion::Accepted);
        // The stale queue entry is skipped
        assert!(ledger.assign_next("other", |_| true).is_none());
    }

    #[test]
    fn test_cancel_and_abandon() {
        let ledger = JobLedger::new();
        let task = Uuid::new_v4();
        ledger.enqueue(task, 10, jobs(task, 10));
        let running = ledger.assign_next("n1", |_| true).unwrap();

        assert_eq!(ledger.cancel_task(task), 9);
        assert!(!ledger.has_queued());
        assert_eq!(ledger.state(running.id), Some(JobState::Assigned("n1".to_string())));

        let other = Uuid::new_v4();
        ledger.enqueue(other, 10, jobs(other, 3));
        let abandoned = ledger.abandon_queued(|_| true);
        assert_eq!(abandoned.len(), 3);
        assert!(abandoned.iter().all(|job| job.sequence > running.sequence));
        assert_eq!(ledger.task_counts(other).unwrap().abandoned, 3);
    }

    #[test]
    fn test_result_after_unreachable_abandon_wins() {
        let ledger = JobLedger::new();
        let task = Uuid::new_v4();
        ledger.enqueue(task, 10, jobs(task, 2));

        let assigned = ledger.assign_next("lost", |_| true).unwrap();
        ledger.requeue_node("lost");
        let abandoned = ledger.abandon_queued(|_| true);
        assert_eq!(abandoned.len(), 2);
        let failed = abandoned.iter().find(|job| job.id == assigned.id).unwrap().sequence;

        let late = ScanResult::for_job(&assigned, PortState::Open);
        let sequence = match ledger.complete(&late) {
            Completion::Recovered(sequence) => sequence,
            other => panic!("expected recovery, got {:?}", other),
        };
        assert!(sequence > failed);
        assert_eq!(ledger.state(assigned.id), Some(JobState::Completed));
        assert_eq!(ledger.complete(&late), Completion::Duplicate);

        let counts = ledger.task_counts(task).unwrap();
        assert_eq!((counts.completed, counts.abandoned), (1, 1));
    }

    #[test]
    fn test_cancel_abandon_is_final() {
        let ledger = JobLedger::new();
        let task = Uuid::new_v4();
        ledger.enqueue(task, 10, jobs(task, 2));

        let running = ledger.assign_next("n1", |_| true).unwrap();
        assert!(ledger.mark_abandoned(running.id));
        assert_eq!(ledger.complete(&ScanResult::for_job(&running, PortState::Open)), Completion::Duplicate);

        let queued = ledger.assign_next("n1", |_| true).unwrap();
        ledger.requeue_jobs(&[queued.id]);
        assert_eq!(ledger.cancel_task(task), 1);
        assert_eq!(ledger.complete(&ScanResult::for_job(&queued, PortState::Open)), Completion::Duplicate);
        assert_eq!(ledger.state(queued.id), Some(JobState::Abandoned));
    }
}
