//! Integration tests for the priority job queue.
//!
//! Tests cover:
//! - Priority-then-FIFO dispatch across roles
//! - Per-category concurrency limits
//! - Retry exhaustion and fatal errors
//! - Payload validation on submit
//! - Cancellation and unknown ids
//! - End-to-end report rendering through the service

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rollcall_core::config::{CategoryConfig, JobsConfig};
use rollcall_core::db::{Row, SqlValue, SqliteDatabase};
use rollcall_core::error::ErrorCode;
use rollcall_core::jobs::{
    BackoffStrategy, JobArtifact, JobCategory, JobContext, JobError, JobHandler, JobPayload, JobService,
    JobState, ReportJobHandler, Submitter,
};
use rollcall_core::report::ReportRenderer;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

// ============================================================================
// Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(10);

fn category(concurrency: usize, max_attempts: u32) -> CategoryConfig {
    CategoryConfig {
        concurrency,
        max_attempts,
        backoff: BackoffStrategy::fixed(10),
        retain_completed: 100,
        retain_failed: 100,
        stall_threshold_ms: 60_000,
    }
}

fn jobs_config(concurrency: usize, max_attempts: u32) -> JobsConfig {
    JobsConfig {
        download: category(concurrency, max_attempts),
        report_generation: category(concurrency, max_attempts),
        poll_interval_ms: 20,
        stall_check_interval_ms: 1_000,
        shutdown_timeout_secs: 5,
    }
}

fn january() -> JobPayload {
    JobPayload::StudentAttendance {
        start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        class_id: None,
    }
}

fn artifact(name: &str) -> JobArtifact {
    JobArtifact {
        path: name.into(),
        file_name: name.to_string(),
        row_count: 0,
        size_bytes: 0,
    }
}

/// Records the order in which submitters' jobs start. User 0 holds the
/// worker until the gate opens.
struct OrderHandler {
    gate: Semaphore,
    order: Mutex<Vec<i64>>,
}

#[async_trait]
impl JobHandler for OrderHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<JobArtifact, JobError> {
        self.order.lock().push(ctx.submitter.user_id);
        if ctx.submitter.user_id == 0 {
            let _permit = self.gate.acquire().await.map_err(|e| JobError::fatal(e.to_string()))?;
        }
        Ok(artifact("order"))
    }
}

/// Tracks the highest number of simultaneously running jobs.
#[derive(Default)]
struct ConcurrencyHandler {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl JobHandler for ConcurrencyHandler {
    async fn handle(&self, _ctx: &JobContext) -> Result<JobArtifact, JobError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(artifact("concurrency"))
    }
}

/// Always fails, retryably or not.
struct FailingHandler {
    retryable: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, _ctx: &JobContext) -> Result<JobArtifact, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.retryable {
            Err(JobError::retryable("database busy"))
        } else {
            Err(JobError::fatal("bad template"))
        }
    }
}

async fn wait_until_active(service: &JobService, id: rollcall_core::jobs::JobId) {
    for _ in 0..500 {
        if service.status(id).unwrap().state == JobState::Active {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never became active", id);
}

// ============================================================================
// Dispatch Order
// ============================================================================

#[tokio::test]
async fn test_admin_job_overtakes_earlier_student_job() {
    let handler = Arc::new(OrderHandler {
        gate: Semaphore::new(0),
        order: Mutex::new(Vec::new()),
    });
    let service = JobService::new(jobs_config(1, 1), handler.clone());
    service.start().unwrap();

    let blocker = service
        .submit(JobCategory::Download, january(), Submitter::with_role_name(0, "admin"))
        .unwrap();
    wait_until_active(&service, blocker.id).await;

    let student = service
        .submit(JobCategory::Download, january(), Submitter::with_role_name(3, "siswa"))
        .unwrap();
    let teacher = service
        .submit(JobCategory::Download, january(), Submitter::with_role_name(2, "guru"))
        .unwrap();
    let admin = service
        .submit(JobCategory::Download, january(), Submitter::with_role_name(1, "admin"))
        .unwrap();
    assert_eq!((student.priority, teacher.priority, admin.priority), (3, 2, 1));

    handler.gate.add_permits(1);
    for id in [blocker.id, student.id, teacher.id, admin.id] {
        let record = service.wait_for(id, WAIT).await.unwrap();
        assert_eq!(record.state, JobState::Completed);
    }

    assert_eq!(*handler.order.lock(), vec![0, 1, 2, 3]);
    assert!(service.stop().await);
}

#[tokio::test]
async fn test_same_priority_runs_in_submission_order() {
    let handler = Arc::new(OrderHandler {
        gate: Semaphore::new(0),
        order: Mutex::new(Vec::new()),
    });
    let service = JobService::new(jobs_config(1, 1), handler.clone());
    service.start().unwrap();

    let blocker = service
        .submit(JobCategory::ReportGeneration, january(), Submitter::with_role_name(0, "admin"))
        .unwrap();
    wait_until_active(&service, blocker.id).await;

    let mut ids = Vec::new();
    for user in [11, 12, 13] {
        ids.push(
            service
                .submit(JobCategory::ReportGeneration, january(), Submitter::with_role_name(user, "guru"))
                .unwrap()
                .id,
        );
    }
    handler.gate.add_permits(1);
    for id in ids {
        service.wait_for(id, WAIT).await.unwrap();
    }

    assert_eq!(*handler.order.lock(), vec![0, 11, 12, 13]);
    service.stop().await;
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let handler = Arc::new(ConcurrencyHandler::default());
    let service = JobService::new(jobs_config(2, 1), handler.clone());
    service.start().unwrap();

    let handles: Vec<_> = (0..6)
        .map(|user| {
            service
                .submit(JobCategory::ReportGeneration, january(), Submitter::with_role_name(user, "admin"))
                .unwrap()
        })
        .collect();
    for handle in &handles {
        let record = service.wait_for(handle.id, WAIT).await.unwrap();
        assert_eq!(record.state, JobState::Completed);
    }

    let peak = handler.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrency was {}", peak);
    assert!(peak >= 1);

    let stats = service.statistics();
    let report_stats = stats.category(JobCategory::ReportGeneration).unwrap();
    assert_eq!(report_stats.succeeded, 6);
    assert_eq!(report_stats.active, 0);
    service.stop().await;
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_retryable_failure_exhausts_attempts() {
    let handler = Arc::new(FailingHandler {
        retryable: true,
        calls: AtomicUsize::new(0),
    });
    let service = JobService::new(jobs_config(1, 3), handler.clone());
    service.start().unwrap();

    let handle = service
        .submit(JobCategory::Download, january(), Submitter::with_role_name(5, "guru"))
        .unwrap();
    let record = service.wait_for(handle.id, WAIT).await.unwrap();

    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    let error = record.last_error.unwrap();
    assert_eq!(error.code, ErrorCode::JobAttemptsExhausted);
    assert!(error.message.contains("database busy"));
    service.stop().await;
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let handler = Arc::new(FailingHandler {
        retryable: false,
        calls: AtomicUsize::new(0),
    });
    let service = JobService::new(jobs_config(1, 3), handler.clone());
    service.start().unwrap();

    let handle = service
        .submit(JobCategory::Download, january(), Submitter::with_role_name(5, "guru"))
        .unwrap();
    let record = service.wait_for(handle.id, WAIT).await.unwrap();

    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    service.stop().await;
}

// ============================================================================
// Submission
// ============================================================================

#[tokio::test]
async fn test_submit_json_validation() {
    let service = JobService::new(jobs_config(1, 1), Arc::new(ConcurrencyHandler::default()));

    let err = service
        .submit_json(
            JobCategory::Download,
            "student-attendance",
            json!({"end_date": "2025-01-31"}),
            Submitter::with_role_name(1, "admin"),
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingRequiredField);

    let err = service
        .submit_json(
            JobCategory::Download,
            "student-attendance",
            json!({"start_date": "31/01/2025", "end_date": "2025-01-31"}),
            Submitter::with_role_name(1, "admin"),
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidFormat);

    assert!(service
        .submit_json(
            JobCategory::Download,
            "student-attendance",
            json!({"start_date": "2025-02-01", "end_date": "2025-01-01"}),
            Submitter::with_role_name(1, "admin"),
        )
        .is_err());

    let handle = service
        .submit_json(
            JobCategory::ReportGeneration,
            "semester-report",
            json!({"semester": "ganjil", "year": 2024}),
            Submitter::with_role_name(1, "wali"),
        )
        .unwrap();
    assert_eq!(handle.priority, rollcall_core::jobs::LOWEST_PRIORITY);

    // not started: the job waits in the queue
    assert_eq!(service.status(handle.id).unwrap().state, JobState::Queued);
}

#[tokio::test]
async fn test_cancel_and_unknown_ids() {
    let service = JobService::new(jobs_config(1, 1), Arc::new(ConcurrencyHandler::default()));
    let handle = service
        .submit(JobCategory::Download, january(), Submitter::with_role_name(1, "admin"))
        .unwrap();

    let record = service.cancel(handle.id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert!(record.last_error.unwrap().is_cancellation());

    let unknown = rollcall_core::jobs::JobId::new();
    assert_eq!(service.status(unknown).unwrap_err().code(), ErrorCode::JobNotFound);
    assert_eq!(service.cancel(unknown).unwrap_err().code(), ErrorCode::JobNotFound);
}

#[tokio::test]
async fn test_submit_after_stop_is_rejected() {
    let service = JobService::new(jobs_config(1, 1), Arc::new(ConcurrencyHandler::default()));
    service.start().unwrap();
    assert!(service.stop().await);
    assert!(!service.is_running());

    let err = service
        .submit(JobCategory::Download, january(), Submitter::with_role_name(1, "admin"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::QueueShutdown);
}

// ============================================================================
// End to End
// ============================================================================

#[tokio::test]
async fn test_report_job_produces_workbook() {
    let db = SqliteDatabase::with_school_schema().await.unwrap();
    db.insert_row("classes", Row::new().with("id", 1).with("name", "7A").with("grade", 7))
        .await
        .unwrap();
    db.insert_row(
        "student_attendance",
        Row::new()
            .with("id", 1)
            .with("student_id", 4)
            .with("class_id", 1)
            .with("date", SqlValue::Date("2025-01-06".into()))
            .with("status", "late"),
    )
    .await
    .unwrap();

    let downloads = tempfile::tempdir().unwrap();
    let renderer = Arc::new(ReportRenderer::new(Arc::new(db), downloads.path()));
    let service = JobService::new(jobs_config(2, 1), Arc::new(ReportJobHandler::new(renderer)));
    service.start().unwrap();

    let handle = service
        .submit_json(
            JobCategory::Download,
            "student-attendance",
            json!({"start_date": "2025-01-01", "end_date": "2025-01-31"}),
            Submitter::with_role_name(7, "guru"),
        )
        .unwrap();
    let record = service.wait_for(handle.id, WAIT).await.unwrap();

    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.progress, 100);
    let artifact = record.result.unwrap();
    assert_eq!(artifact.row_count, 1);
    assert!(artifact.file_name.starts_with("student_attendance_20250101_20250131_"));
    assert!(artifact.path.exists());
    service.stop().await;
}
