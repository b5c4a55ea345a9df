//! Priority job queue for report generation.
//!
//! - **Job**: typed payloads, role-based priority, retry policy
//! - **Queue**: one priority queue per category (priority, then arrival)
//! - **Worker**: a dispatcher per category bounded by a semaphore
//! - **Service**: submission, status, statistics and the start/stop lifecycle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             JobService                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  submit ──▶ CategoryQueue(download) ──▶ Dispatcher ──▶ JobHandler    │
//! │         └─▶ CategoryQueue(report)   ──▶ Dispatcher ──▶ JobHandler    │
//! │                      ▲                        │                      │
//! │                      └── retry with backoff ◀─┘                      │
//! │  stall monitor: flags active jobs without recent progress            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let service = JobService::new(config.jobs.clone(), Arc::new(ReportJobHandler::new(renderer)));
//! service.start()?;
//!
//! let handle = service.submit_json(
//!     JobCategory::Download,
//!     "teacher-attendance",
//!     json!({"start_date": "2025-01-01", "end_date": "2025-01-31"}),
//!     Submitter::with_role_name(7, "guru"),
//! )?;
//! let done = service.wait_for(handle.id, Duration::from_secs(30)).await?;
//! ```

pub mod handlers;
pub mod job;
pub mod queue;
pub mod service;
pub mod worker;

pub use handlers::{JobHandler, ReportJobHandler};
pub use job::{
    BackoffStrategy, JobArtifact, JobCategory, JobContext, JobError, JobId, JobPayload, JobRecord, JobState,
    JobType, RetryPolicy, Role, Submitter, LOWEST_PRIORITY,
};
pub use queue::{AttemptOutcome, CategoryQueue, CategoryStats};
pub use service::{JobHandle, JobService, QueueStatistics};
