//! Per-category priority queue with retry scheduling and history retention.

use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::job::{JobArtifact, JobCategory, JobError, JobId, JobRecord, JobState, RetryPolicy};
use crate::config::CategoryConfig;
use crate::error::{ErrorCode, Result, RollcallError};

/// A ready job in the heap.
///
/// The heap is a max-heap, so the ordering is reversed: the lowest priority
/// value wins, then the lowest arrival sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedJob {
    pub priority: u8,
    pub seq: u64,
    pub id: JobId,
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A job waiting out its backoff.
#[derive(Debug, Clone, Copy)]
struct DelayedJob {
    due: Instant,
    id: JobId,
}

/// What happened to a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Requeued; eligible again after the delay
    Retrying { delay: Duration },
    /// Terminal failure
    Failed,
}

/// Queue statistics for one category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryStats {
    pub category: Option<JobCategory>,
    /// Queued jobs, including those backing off
    pub queued: usize,
    pub active: usize,
    /// Completed jobs still retained
    pub completed: usize,
    /// Failed jobs still retained
    pub failed: usize,
    pub stalled: usize,
    /// Attempts that reached a terminal state since start
    pub processed: u64,
    pub succeeded: u64,
    pub failed_total: u64,
    /// Queued jobs per priority value
    pub depth_by_priority: BTreeMap<u8, usize>,
    pub concurrency: usize,
}

#[derive(Default)]
struct QueueState {
    records: HashMap<JobId, JobRecord>,
    ready: BinaryHeap<QueuedJob>,
    delayed: Vec<DelayedJob>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    tokens: HashMap<JobId, CancellationToken>,
    next_seq: u64,
    processed: u64,
    succeeded: u64,
    failed_total: u64,
}

impl QueueState {
    fn push_ready(&mut self, id: JobId, priority: u8) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(QueuedJob { priority, seq, id });
    }

    fn retain(&mut self, retain_completed: usize, retain_failed: usize) {
        while self.completed.len() > retain_completed {
            if let Some(id) = self.completed.pop_front() {
                self.records.remove(&id);
            }
        }
        while self.failed.len() > retain_failed {
            if let Some(id) = self.failed.pop_front() {
                self.records.remove(&id);
            }
        }
    }
}

/// The queue of one job category.
pub struct CategoryQueue {
    category: JobCategory,
    config: CategoryConfig,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl CategoryQueue {
    pub fn new(category: JobCategory, config: CategoryConfig) -> Self {
        Self {
            category,
            policy: config.retry_policy(),
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn category(&self) -> JobCategory {
        self.category
    }

    pub fn config(&self) -> &CategoryConfig {
        &self.config
    }

    /// Resolves when a job was enqueued or requeued since the last call.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Add a new job and wake the dispatcher.
    pub fn enqueue(&self, mut record: JobRecord) -> JobId {
        let id = record.id;
        record.state = JobState::Queued;
        {
            let mut state = self.state.lock();
            state.push_ready(id, record.priority);
            state.records.insert(id, record);
        }
        self.notify.notify_one();
        id
    }

    /// Move delayed jobs whose backoff has elapsed into the ready heap.
    /// Each gets a fresh arrival sequence.
    pub fn promote_due(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let (due, waiting): (Vec<DelayedJob>, Vec<DelayedJob>) =
            state.delayed.drain(..).partition(|d| d.due <= now);
        state.delayed = waiting;

        let mut promoted = 0;
        for job in due {
            let priority = match state.records.get_mut(&job.id) {
                Some(record) if record.state == JobState::Queued => {
                    record.next_attempt_at = None;
                    record.priority
                }
                _ => continue,
            };
            state.push_ready(job.id, priority);
            promoted += 1;
        }
        promoted
    }

    /// Time until the earliest delayed job becomes due.
    pub fn next_due_in(&self, now: Instant) -> Option<Duration> {
        self.state
            .lock()
            .delayed
            .iter()
            .map(|d| d.due.saturating_duration_since(now))
            .min()
    }

    /// Pop the best ready job and mark it active.
    ///
    /// Entries whose record is no longer queued (cancelled, pruned) are
    /// discarded on the way.
    pub fn take_next(&self) -> Option<(JobRecord, CancellationToken)> {
        let mut state = self.state.lock();
        while let Some(entry) = state.ready.pop() {
            let snapshot = match state.records.get_mut(&entry.id) {
                Some(record) if record.state == JobState::Queued => {
                    record.mark_active();
                    record.clone()
                }
                _ => continue,
            };
            let token = CancellationToken::new();
            state.tokens.insert(entry.id, token.clone());
            return Some((snapshot, token));
        }
        None
    }

    /// In-memory progress update from a running job.
    pub fn update_progress(&self, id: JobId, percent: u8, message: &str) {
        let mut state = self.state.lock();
        if let Some(record) = state.records.get_mut(&id) {
            record.record_progress(percent, message);
        }
    }

    /// Store the artifact of a successful attempt.
    pub fn complete(&self, id: JobId, artifact: JobArtifact) {
        let mut state = self.state.lock();
        state.tokens.remove(&id);
        let Some(record) = state.records.get_mut(&id) else {
            return;
        };
        if record.state != JobState::Active {
            return;
        }
        record.mark_completed(artifact);
        state.completed.push_back(id);
        state.processed += 1;
        state.succeeded += 1;
        state.retain(self.config.retain_completed, self.config.retain_failed);
    }

    /// Record a failed attempt and decide between retry and terminal failure.
    pub fn fail_attempt(&self, id: JobId, error: JobError) -> AttemptOutcome {
        let outcome = {
            let mut state = self.state.lock();
            state.tokens.remove(&id);
            let Some(record) = state.records.get_mut(&id) else {
                return AttemptOutcome::Failed;
            };
            if record.state != JobState::Active {
                return AttemptOutcome::Failed;
            }

            if self.policy.should_retry(record.attempts, &error) {
                let delay = self.policy.next_retry_delay(record.attempts);
                let next_at = Utc::now() + TimeDelta::from_std(delay).unwrap_or_else(|_| TimeDelta::zero());
                record.mark_retrying(error, next_at);
                state.delayed.push(DelayedJob {
                    due: Instant::now() + delay,
                    id,
                });
                AttemptOutcome::Retrying { delay }
            } else {
                let error = if error.retryable && record.attempts >= record.max_attempts {
                    JobError {
                        message: format!("{} (gave up after {} attempts)", error.message, record.attempts),
                        retryable: false,
                        code: ErrorCode::JobAttemptsExhausted,
                    }
                } else {
                    error
                };
                record.mark_failed(error);
                state.failed.push_back(id);
                state.processed += 1;
                state.failed_total += 1;
                state.retain(self.config.retain_completed, self.config.retain_failed);
                AttemptOutcome::Failed
            }
        };
        if matches!(outcome, AttemptOutcome::Retrying { .. }) {
            self.notify.notify_one();
        }
        outcome
    }

    /// Cancel a job.
    ///
    /// A queued job fails immediately; an active job has its token triggered
    /// and fails when its handler observes it. Terminal jobs are left as is.
    pub fn cancel(&self, id: JobId) -> Result<JobRecord> {
        let mut state = self.state.lock();
        let current = state
            .records
            .get(&id)
            .map(|r| r.state)
            .ok_or_else(|| RollcallError::job_not_found(id))?;

        match current {
            JobState::Queued => {
                state.delayed.retain(|d| d.id != id);
                if let Some(record) = state.records.get_mut(&id) {
                    record.mark_failed(JobError::cancelled());
                }
                state.failed.push_back(id);
                state.processed += 1;
                state.failed_total += 1;
            }
            JobState::Active => {
                if let Some(token) = state.tokens.get(&id) {
                    token.cancel();
                }
            }
            JobState::Completed | JobState::Failed => {}
        }

        let snapshot = state
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| RollcallError::job_not_found(id))?;
        state.retain(self.config.retain_completed, self.config.retain_failed);
        Ok(snapshot)
    }

    /// Trigger cancellation of every active job.
    pub fn cancel_active(&self) -> usize {
        let state = self.state.lock();
        for token in state.tokens.values() {
            token.cancel();
        }
        state.tokens.len()
    }

    /// Flag active jobs not updated within `threshold`. Returns the newly
    /// flagged ids.
    pub fn flag_stalled(&self, threshold: Duration) -> Vec<JobId> {
        let threshold = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        let mut state = self.state.lock();
        state
            .records
            .values_mut()
            .filter(|r| r.state == JobState::Active && !r.stalled && now - r.updated_at > threshold)
            .map(|r| {
                r.stalled = true;
                r.id
            })
            .collect()
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.state.lock().records.get(&id).cloned()
    }

    pub fn stats(&self) -> CategoryStats {
        let state = self.state.lock();
        let mut stats = CategoryStats {
            category: Some(self.category),
            processed: state.processed,
            succeeded: state.succeeded,
            failed_total: state.failed_total,
            concurrency: self.config.concurrency,
            ..CategoryStats::default()
        };
        for record in state.records.values() {
            match record.state {
                JobState::Queued => {
                    stats.queued += 1;
                    *stats.depth_by_priority.entry(record.priority).or_insert(0) += 1;
                }
                JobState::Active => {
                    stats.active += 1;
                    if record.stalled {
                        stats.stalled += 1;
                    }
                }
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

impl std::fmt::Debug for CategoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategoryQueue")
            .field("category", &self.category)
            .field("concurrency", &self.config.concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{BackoffStrategy, JobPayload, Role, Submitter};
    use chrono::NaiveDate;

    fn payload() -> JobPayload {
        JobPayload::StudentAttendance {
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            class_id: None,
        }
    }

    fn record(role: Role) -> JobRecord {
        JobRecord::new(JobCategory::Download, payload(), Submitter::new(1, role), 3)
    }

    fn queue() -> CategoryQueue {
        let config = CategoryConfig {
            backoff: BackoffStrategy::fixed(0),
            retain_completed: 2,
            retain_failed: 1,
            ..CategoryConfig::download()
        };
        CategoryQueue::new(JobCategory::Download, config)
    }

    fn artifact() -> JobArtifact {
        JobArtifact {
            path: "/tmp/report.xlsx".into(),
            file_name: "report.xlsx".into(),
            row_count: 0,
            size_bytes: 0,
        }
    }

    #[test]
    fn test_priority_then_fifo() {
        let queue = queue();
        let student = queue.enqueue(record(Role::Student));
        let admin_1 = queue.enqueue(record(Role::Admin));
        let other = queue.enqueue(record(Role::Other("parent".into())));
        let admin_2 = queue.enqueue(record(Role::Admin));
        let teacher = queue.enqueue(record(Role::Teacher));

        let order: Vec<JobId> = std::iter::from_fn(|| queue.take_next().map(|(r, _)| r.id)).collect();
        assert_eq!(order, vec![admin_1, admin_2, teacher, student, other]);
    }

    #[test]
    fn test_retry_gets_fresh_sequence() {
        let queue = queue();
        let first = queue.enqueue(record(Role::Student));
        let (taken, _) = queue.take_next().unwrap();
        assert_eq!(taken.id, first);
        let second = queue.enqueue(record(Role::Student));

        let outcome = queue.fail_attempt(first, JobError::retryable("io"));
        assert_eq!(outcome, AttemptOutcome::Retrying { delay: Duration::ZERO });
        assert_eq!(queue.promote_due(Instant::now()), 1);

        assert_eq!(queue.take_next().unwrap().0.id, second);
        let (retried, _) = queue.take_next().unwrap();
        assert_eq!(retried.id, first);
        assert_eq!(retried.attempts, 2);
    }

    #[test]
    fn test_exhausted_attempts_fail_terminally() {
        let queue = queue();
        let id = queue.enqueue(record(Role::Admin));
        for attempt in 1..=3 {
            let (taken, _) = queue.take_next().unwrap();
            assert_eq!(taken.attempts, attempt);
            let outcome = queue.fail_attempt(id, JobError::retryable(format!("attempt {}", attempt)));
            if attempt < 3 {
                assert!(matches!(outcome, AttemptOutcome::Retrying { .. }));
                queue.promote_due(Instant::now());
            } else {
                assert_eq!(outcome, AttemptOutcome::Failed);
            }
        }

        let record = queue.get(id).unwrap();
        assert_eq!(record.state, JobState::Failed);
        let error = record.last_error.unwrap();
        assert_eq!(error.code, ErrorCode::JobAttemptsExhausted);
        assert!(error.message.contains("attempt 3"));
        assert!(queue.take_next().is_none());
    }

    #[test]
    fn test_fatal_error_is_not_retried() {
        let queue = queue();
        let id = queue.enqueue(record(Role::Admin));
        queue.take_next().unwrap();
        assert_eq!(queue.fail_attempt(id, JobError::fatal("bad")), AttemptOutcome::Failed);
        assert_eq!(queue.get(id).unwrap().last_error.unwrap().message, "bad");
    }

    #[test]
    fn test_cancel_queued_and_active() {
        let queue = queue();
        let active = queue.enqueue(record(Role::Admin));
        let queued = queue.enqueue(record(Role::Student));
        let (_, token) = queue.take_next().unwrap();

        let cancelled = queue.cancel(queued).unwrap();
        assert_eq!(cancelled.state, JobState::Failed);
        assert!(queue.take_next().is_none());

        let still_active = queue.cancel(active).unwrap();
        assert_eq!(still_active.state, JobState::Active);
        assert!(token.is_cancelled());

        assert!(queue.cancel(JobId::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_history_retention() {
        let queue = queue();
        let ids: Vec<JobId> = (0..3).map(|_| queue.enqueue(record(Role::Admin))).collect();
        for id in &ids {
            queue.take_next().unwrap();
            queue.complete(*id, artifact());
        }
        assert!(queue.get(ids[0]).is_none());
        assert!(queue.get(ids[2]).is_some());

        let stats = queue.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.succeeded, 3);
    }

    #[test]
    fn test_stats_depth_by_priority() {
        let queue = queue();
        queue.enqueue(record(Role::Admin));
        queue.enqueue(record(Role::Student));
        queue.enqueue(record(Role::Student));
        queue.take_next().unwrap();

        let stats = queue.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.depth_by_priority.get(&3), Some(&2));
        assert_eq!(stats.depth_by_priority.get(&1), None);
    }

    #[test]
    fn test_stall_flag_cleared_by_progress() {
        let queue = queue();
        let id = queue.enqueue(record(Role::Admin));
        queue.take_next().unwrap();

        assert!(queue.flag_stalled(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(queue.flag_stalled(Duration::ZERO), vec![id]);
        assert!(queue.flag_stalled(Duration::ZERO).is_empty());
        assert_eq!(queue.stats().stalled, 1);

        queue.update_progress(id, 40, "rows");
        let record = queue.get(id).unwrap();
        assert!(!record.stalled);
        assert_eq!(record.state, JobState::Active);
    }

    #[test]
    fn test_unbounded_stall_threshold_never_flags() {
        let queue = queue();
        queue.enqueue(record(Role::Admin));
        queue.take_next().unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(queue.flag_stalled(Duration::MAX).is_empty());
        assert_eq!(queue.stats().stalled, 0);
    }
}
