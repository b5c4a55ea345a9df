//! Dispatcher loop: one per job category, bounded by a semaphore.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::handlers::JobHandler;
use super::job::{JobContext, JobError, JobRecord};
use super::queue::{AttemptOutcome, CategoryQueue};
use crate::telemetry::JobMetrics;

/// Pulls jobs from one category queue whenever a slot is free.
pub(crate) struct Dispatcher {
    queue: Arc<CategoryQueue>,
    handler: Arc<dyn JobHandler>,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: Arc<CategoryQueue>,
        handler: Arc<dyn JobHandler>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        let concurrency = queue.config().concurrency.max(1);
        Self {
            queue,
            handler,
            slots: Arc::new(Semaphore::new(concurrency)),
            tracker,
            shutdown,
            poll_interval,
        }
    }

    pub(crate) async fn run(self) {
        let category = self.queue.category();
        tracing::info!(
            category = %category,
            concurrency = self.queue.config().concurrency,
            "Job dispatcher started"
        );

        loop {
            // A slot first, so the choice is made among everything queued
            // at the moment a worker is actually free.
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let Some((record, token)) = self.next_job().await else {
                break;
            };

            let queue = self.queue.clone();
            let handler = self.handler.clone();
            self.tracker.spawn(execute(queue, handler, record, token, permit));
        }

        tracing::info!(category = %category, "Job dispatcher stopped");
    }

    /// Wait until a job is ready or shutdown is requested.
    async fn next_job(&self) -> Option<(JobRecord, CancellationToken)> {
        loop {
            let now = Instant::now();
            self.queue.promote_due(now);
            if let Some(next) = self.queue.take_next() {
                return Some(next);
            }

            let wait = self
                .queue
                .next_due_in(now)
                .map_or(self.poll_interval, |due| due.min(self.poll_interval));

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Run one attempt and record its outcome.
async fn execute(
    queue: Arc<CategoryQueue>,
    handler: Arc<dyn JobHandler>,
    record: JobRecord,
    token: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let category = record.category.as_str();
    let ctx = JobContext::new(&record, queue.clone(), token);
    let span = tracing::info_span!(
        "job",
        job_id = %record.id,
        category = category,
        job_type = %record.job_type,
        attempt = record.attempts,
        priority = record.priority,
    );

    let started = Instant::now();
    let result = AssertUnwindSafe(handler.handle(&ctx))
        .catch_unwind()
        .instrument(span.clone())
        .await
        .unwrap_or_else(|panic| Err(JobError::fatal(format!("job panicked: {}", panic_message(&*panic)))));
    let elapsed = started.elapsed().as_secs_f64();

    // Errors raised after cancellation count as the cancellation itself.
    let result = match result {
        Err(error) if ctx.cancellation().is_cancelled() && !error.is_cancellation() => {
            Err(JobError::cancelled())
        }
        other => other,
    };

    let _guard = span.enter();
    match result {
        Ok(artifact) => {
            JobMetrics::finished(category, true, elapsed);
            tracing::info!(
                file = %artifact.file_name,
                rows = artifact.row_count,
                duration_secs = elapsed,
                "Job completed"
            );
            queue.complete(record.id, artifact);
        }
        Err(error) => {
            JobMetrics::finished(category, false, elapsed);
            match queue.fail_attempt(record.id, error.clone()) {
                AttemptOutcome::Retrying { delay } => {
                    JobMetrics::retried(category);
                    tracing::warn!(
                        error = %error,
                        retry_in_ms = delay.as_millis() as u64,
                        "Job attempt failed, retrying"
                    );
                }
                AttemptOutcome::Failed => {
                    JobMetrics::failed(category);
                    tracing::error!(error = %error, "Job failed");
                }
            }
        }
    }

    let stats = queue.stats();
    JobMetrics::set_depth(category, stats.queued, stats.active);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*boxed), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }
}
