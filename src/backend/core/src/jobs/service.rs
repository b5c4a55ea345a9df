//! The job service: submission, status, statistics and lifecycle.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::handlers::JobHandler;
use super::job::{JobCategory, JobId, JobPayload, JobRecord, JobType, Submitter};
use super::queue::{CategoryQueue, CategoryStats};
use super::worker::Dispatcher;
use crate::config::JobsConfig;
use crate::error::{ErrorCode, Result, RollcallError};
use crate::telemetry::JobMetrics;

/// Returned by [`JobService::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub category: JobCategory,
    pub job_type: JobType,
    pub priority: u8,
}

/// Statistics for every category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub categories: BTreeMap<JobCategory, CategoryStats>,
}

impl QueueStatistics {
    pub fn category(&self, category: JobCategory) -> Option<&CategoryStats> {
        self.categories.get(&category)
    }
}

/// Priority job queue with a bounded worker pool per category.
///
/// Constructed explicitly and owned by the caller; jobs may be submitted
/// before [`JobService::start`] and simply wait until dispatch begins.
pub struct JobService {
    config: JobsConfig,
    handler: Arc<dyn JobHandler>,
    queues: BTreeMap<JobCategory, Arc<CategoryQueue>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl JobService {
    pub fn new(config: JobsConfig, handler: Arc<dyn JobHandler>) -> Self {
        let queues = JobCategory::ALL
            .iter()
            .map(|&category| {
                let queue = CategoryQueue::new(category, config.category(category).clone());
                (category, Arc::new(queue))
            })
            .collect();

        Self {
            config,
            handler,
            queues,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Spawn one dispatcher per category plus the stall monitor.
    ///
    /// Must be called from within a tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RollcallError::new(ErrorCode::QueueShutdown, "Job service has been stopped"));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = self.tasks.lock();
        for queue in self.queues.values() {
            let dispatcher = Dispatcher::new(
                queue.clone(),
                self.handler.clone(),
                self.tracker.clone(),
                self.shutdown.clone(),
                self.config.poll_interval(),
            );
            tasks.push(tokio::spawn(dispatcher.run()));
        }
        tasks.push(tokio::spawn(stall_monitor(
            self.queues.values().cloned().collect(),
            self.config.stall_check_interval(),
            self.shutdown.clone(),
        )));

        tracing::info!(
            categories = self.queues.len(),
            poll_interval_ms = self.config.poll_interval_ms,
            "Job service started"
        );
        Ok(())
    }

    /// Stop dispatching, cancel running jobs and wait for them to finish.
    ///
    /// Returns `true` when every active job finished within the shutdown
    /// timeout.
    pub async fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return true;
        }
        tracing::info!("Job service stopping");

        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Dispatcher task ended abnormally");
            }
        }

        let cancelled: usize = self.queues.values().map(|q| q.cancel_active()).sum();
        self.tracker.close();
        let drained = tokio::time::timeout(self.config.shutdown_timeout(), self.tracker.wait())
            .await
            .is_ok();

        if drained {
            tracing::info!(cancelled_jobs = cancelled, "Job service stopped");
        } else {
            tracing::warn!(
                cancelled_jobs = cancelled,
                still_running = self.tracker.len(),
                timeout_secs = self.config.shutdown_timeout_secs,
                "Job service stop timed out with jobs still running"
            );
        }
        drained
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Validate and enqueue a job. Never waits for execution.
    pub fn submit(&self, category: JobCategory, payload: JobPayload, submitter: Submitter) -> Result<JobHandle> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RollcallError::new(ErrorCode::QueueShutdown, "Job service is not accepting jobs"));
        }
        payload.validate()?;

        let queue = self.queue(category)?;
        let record = JobRecord::new(category, payload, submitter, queue.config().max_attempts);
        let handle = JobHandle {
            id: record.id,
            category,
            job_type: record.job_type,
            priority: record.priority,
        };
        queue.enqueue(record);

        JobMetrics::submitted(category.as_str(), handle.job_type.as_str());
        tracing::info!(
            job_id = %handle.id,
            category = %category,
            job_type = %handle.job_type,
            priority = handle.priority,
            "Job submitted"
        );
        Ok(handle)
    }

    /// Parse a loosely typed payload, then submit it.
    pub fn submit_json(
        &self,
        category: JobCategory,
        job_type: &str,
        payload: serde_json::Value,
        submitter: Submitter,
    ) -> Result<JobHandle> {
        let job_type: JobType = job_type.parse()?;
        let payload = JobPayload::from_json(job_type, payload)?;
        self.submit(category, payload, submitter)
    }

    /// Snapshot of a job; `JobNotFound` for unknown or pruned ids.
    pub fn status(&self, id: JobId) -> Result<JobRecord> {
        self.queues
            .values()
            .find_map(|q| q.get(id))
            .ok_or_else(|| RollcallError::job_not_found(id))
    }

    pub fn statistics(&self) -> QueueStatistics {
        QueueStatistics {
            categories: self
                .queues
                .iter()
                .map(|(category, queue)| (*category, queue.stats()))
                .collect(),
        }
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait_for(&self, id: JobId, timeout: Duration) -> Result<JobRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = self.config.poll_interval().min(Duration::from_millis(50));
        loop {
            let record = self.status(id)?;
            if record.state.is_terminal() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RollcallError::new(
                    ErrorCode::JobWaitTimeout,
                    format!("Job {} did not finish within {:?}", id, timeout),
                )
                .with_context("state", record.state.to_string())
                .with_context("progress", record.progress));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Cancel a queued or active job.
    pub fn cancel(&self, id: JobId) -> Result<JobRecord> {
        let queue = self
            .queues
            .values()
            .find(|q| q.get(id).is_some())
            .ok_or_else(|| RollcallError::job_not_found(id))?;
        let record = queue.cancel(id)?;
        tracing::info!(job_id = %id, state = %record.state, "Job cancellation requested");
        Ok(record)
    }

    fn queue(&self, category: JobCategory) -> Result<&Arc<CategoryQueue>> {
        self.queues.get(&category).ok_or_else(|| {
            RollcallError::new(ErrorCode::InvalidInput, format!("no queue for category {}", category))
        })
    }
}

impl Drop for JobService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Flags active jobs that stopped reporting progress. Never fails a job.
async fn stall_monitor(queues: Vec<Arc<CategoryQueue>>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for queue in &queues {
            let threshold = queue.config().stall_threshold();
            for id in queue.flag_stalled(threshold) {
                JobMetrics::stalled(queue.category().as_str());
                tracing::warn!(
                    job_id = %id,
                    category = %queue.category(),
                    threshold_ms = threshold.as_millis() as u64,
                    "Job stalled"
                );
            }
        }
    }
}
