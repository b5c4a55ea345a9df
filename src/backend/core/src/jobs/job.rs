//! Job definitions.
//!
//! - **JobPayload**: the typed request for one report, validated at submit time
//! - **Submitter/Role**: who asked, which decides the job's priority
//! - **JobRecord**: the queue's view of a job across its attempts
//! - **RetryPolicy**: retry behaviour with backoff strategies

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::calendar::{self, DateRange, Semester};
use crate::error::{ErrorCode, Result, RollcallError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = RollcallError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| RollcallError::new(ErrorCode::InvalidFormat, format!("invalid job id '{}'", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Categories and Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Independent queues, each with its own concurrency and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobCategory {
    /// Per-user exports; high throughput
    Download,
    /// Heavy summaries; few at a time
    ReportGeneration,
}

impl JobCategory {
    pub const ALL: [JobCategory; 2] = [JobCategory::Download, JobCategory::ReportGeneration];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::ReportGeneration => "report-generation",
        }
    }
}

impl fmt::Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobCategory {
    type Err = RollcallError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "download" => Ok(Self::Download),
            "report-generation" | "report" => Ok(Self::ReportGeneration),
            other => Err(RollcallError::new(
                ErrorCode::InvalidInput,
                format!("unknown job category '{}'", other),
            )),
        }
    }
}

/// Which report a job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    StudentAttendance,
    TeacherAttendance,
    AnalyticsReport,
    SemesterReport,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StudentAttendance => "student-attendance",
            Self::TeacherAttendance => "teacher-attendance",
            Self::AnalyticsReport => "analytics-report",
            Self::SemesterReport => "semester-report",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = RollcallError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "student-attendance" => Ok(Self::StudentAttendance),
            "teacher-attendance" => Ok(Self::TeacherAttendance),
            "analytics-report" | "analytics" => Ok(Self::AnalyticsReport),
            "semester-report" | "semester" => Ok(Self::SemesterReport),
            other => Err(RollcallError::new(
                ErrorCode::InvalidInput,
                format!("unknown job type '{}'", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Payload
// ═══════════════════════════════════════════════════════════════════════════════

/// Parameters of one report request. Each variant carries the filters its
/// report requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobPayload {
    StudentAttendance {
        start_date: NaiveDate,
        end_date: NaiveDate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class_id: Option<i64>,
    },
    TeacherAttendance {
        start_date: NaiveDate,
        end_date: NaiveDate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        teacher_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class_id: Option<i64>,
    },
    AnalyticsReport {
        start_date: NaiveDate,
        end_date: NaiveDate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class_id: Option<i64>,
    },
    SemesterReport {
        semester: Semester,
        year: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class_id: Option<i64>,
    },
}

impl JobPayload {
    /// Parse a loosely typed payload for `job_type`.
    ///
    /// An absent required field is a `MissingRequiredField` error; a present
    /// but malformed one is an `InvalidFormat` error.
    pub fn from_json(job_type: JobType, value: serde_json::Value) -> Result<Self> {
        let mut object = match value {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(RollcallError::new(
                    ErrorCode::InvalidFormat,
                    format!("payload must be an object, got {}", other),
                ))
            }
        };
        let required: &[&str] = match job_type {
            JobType::SemesterReport => &["semester", "year"],
            _ => &["start_date", "end_date"],
        };
        for field in required {
            if object.get(*field).map_or(true, serde_json::Value::is_null) {
                return Err(RollcallError::missing_field(field));
            }
        }
        object.insert("type".to_string(), serde_json::Value::from(job_type.as_str()));
        let payload: JobPayload = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| RollcallError::new(ErrorCode::InvalidFormat, format!("invalid payload: {}", e)))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Self::StudentAttendance { .. } => JobType::StudentAttendance,
            Self::TeacherAttendance { .. } => JobType::TeacherAttendance,
            Self::AnalyticsReport { .. } => JobType::AnalyticsReport,
            Self::SemesterReport { .. } => JobType::SemesterReport,
        }
    }

    /// Resolve the date range this payload covers.
    pub fn date_range(&self) -> Result<DateRange> {
        match self {
            Self::StudentAttendance { start_date, end_date, .. }
            | Self::TeacherAttendance { start_date, end_date, .. }
            | Self::AnalyticsReport { start_date, end_date, .. } => DateRange::new(*start_date, *end_date),
            Self::SemesterReport { semester, year, .. } => {
                calendar::validate_year(*year)?;
                semester.date_range(*year)
            }
        }
    }

    pub fn class_id(&self) -> Option<i64> {
        match self {
            Self::StudentAttendance { class_id, .. }
            | Self::TeacherAttendance { class_id, .. }
            | Self::AnalyticsReport { class_id, .. }
            | Self::SemesterReport { class_id, .. } => *class_id,
        }
    }

    pub fn teacher_id(&self) -> Option<i64> {
        match self {
            Self::TeacherAttendance { teacher_id, .. } => *teacher_id,
            _ => None,
        }
    }

    /// Reject ranges that end before they start and out-of-range years.
    pub fn validate(&self) -> Result<()> {
        self.date_range().map(|_| ())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Submitter and Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Role of the requesting user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Other(String),
}

impl Role {
    /// Queue priority for this role; lower runs first.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Admin => 1,
            Self::Teacher => 2,
            Self::Student => 3,
            Self::Other(_) => LOWEST_PRIORITY,
        }
    }
}

/// Priority assigned to roles outside the table.
pub const LOWEST_PRIORITY: u8 = 10;

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "teacher" | "guru" => Self::Teacher,
            "student" | "siswa" => Self::Student,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => f.write_str("admin"),
            Self::Teacher => f.write_str("teacher"),
            Self::Student => f.write_str("student"),
            Self::Other(other) => f.write_str(other),
        }
    }
}

/// Who submitted a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitter {
    pub user_id: i64,
    pub role: Role,
}

impl Submitter {
    pub fn new(user_id: i64, role: Role) -> Self {
        Self { user_id, role }
    }

    /// Parse the role from its stored name (`admin`, `guru`, `siswa`, ...).
    pub fn with_role_name(user_id: i64, role: &str) -> Self {
        let role = match role.parse::<Role>() {
            Ok(role) => role,
            Err(never) => match never {},
        };
        Self { user_id, role }
    }

    pub fn priority(&self) -> u8 {
        self.role.priority()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a slot, possibly backing off before a retry
    Queued,
    /// Currently being executed
    Active,
    /// Finished successfully
    Completed,
    /// Failed terminally
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether this error is retryable
    pub retryable: bool,
    /// Error code of the underlying failure
    pub code: ErrorCode,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: ErrorCode::JobExecutionFailed,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: ErrorCode::InternalError,
        }
    }

    /// Cancellation is never retried.
    pub fn cancelled() -> Self {
        Self {
            message: "cancelled".to_string(),
            retryable: false,
            code: ErrorCode::JobCancelled,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == ErrorCode::JobCancelled
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)
    }
}

impl std::error::Error for JobError {}

impl From<RollcallError> for JobError {
    fn from(error: RollcallError) -> Self {
        Self {
            message: error.reason(),
            retryable: error.is_retryable(),
            code: error.code(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Exponential increase in delay (initial * multiplier^retry)
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before retry number `retry` (0 = the first retry).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                let delay = (*initial_ms as f64) * multiplier.powi(retry as i32);
                delay.min(*max_ms as f64) as u64
            }
        };
        Duration::from_millis(ms)
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self::Fixed { delay_ms }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for job retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
    /// Whether to retry on any error or only retryable errors
    pub retry_all_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            retry_all_errors: false,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt follows `attempts_made` failed ones.
    pub fn should_retry(&self, attempts_made: u32, error: &JobError) -> bool {
        if error.is_cancellation() {
            return false;
        }
        if attempts_made >= self.max_attempts {
            return false;
        }
        self.retry_all_errors || error.retryable
    }

    /// Delay before the attempt following `attempts_made` failed ones.
    pub fn next_retry_delay(&self, attempts_made: u32) -> Duration {
        self.backoff.delay_for_retry(attempts_made.saturating_sub(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// The file a successful job produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArtifact {
    pub path: std::path::PathBuf,
    pub file_name: String,
    pub row_count: u64,
    pub size_bytes: u64,
}

/// Everything known about one job. Returned by status queries as a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub category: JobCategory,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub submitter: Submitter,
    /// Lower runs first
    pub priority: u8,
    pub state: JobState,
    /// 0..=100, never decreases within one attempt
    pub progress: u8,
    pub progress_message: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<JobArtifact>,
    pub last_error: Option<JobError>,
    pub stalled: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Set while the job is backing off before its next attempt
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(category: JobCategory, payload: JobPayload, submitter: Submitter, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            category,
            job_type: payload.job_type(),
            priority: submitter.priority(),
            payload,
            submitter,
            state: JobState::Queued,
            progress: 0,
            progress_message: None,
            attempts: 0,
            max_attempts,
            result: None,
            last_error: None,
            stalled: false,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            next_attempt_at: None,
        }
    }

    /// Start a new attempt.
    pub fn mark_active(&mut self) {
        let now = Utc::now();
        self.state = JobState::Active;
        self.attempts += 1;
        self.progress = 0;
        self.progress_message = None;
        self.stalled = false;
        self.next_attempt_at = None;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Record progress; lower values than already reported are ignored.
    pub fn record_progress(&mut self, percent: u8, message: &str) -> bool {
        if self.state != JobState::Active {
            return false;
        }
        let percent = percent.min(100);
        self.updated_at = Utc::now();
        self.stalled = false;
        if percent < self.progress {
            return false;
        }
        self.progress = percent;
        self.progress_message = Some(message.to_string());
        true
    }

    pub fn mark_completed(&mut self, artifact: JobArtifact) {
        let now = Utc::now();
        self.state = JobState::Completed;
        self.progress = 100;
        self.result = Some(artifact);
        self.stalled = false;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Back to the queue until `next_attempt_at`.
    pub fn mark_retrying(&mut self, error: JobError, next_attempt_at: DateTime<Utc>) {
        self.state = JobState::Queued;
        self.last_error = Some(error);
        self.stalled = false;
        self.next_attempt_at = Some(next_attempt_at);
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: JobError) {
        let now = Utc::now();
        self.state = JobState::Failed;
        self.last_error = Some(error);
        self.stalled = false;
        self.next_attempt_at = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Run time of the latest attempt, if finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context handed to a handler for one attempt.
///
/// Progress reports only touch the in-memory record.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub category: JobCategory,
    pub payload: JobPayload,
    pub submitter: Submitter,
    /// 1-based attempt number
    pub attempt: u32,
    queue: std::sync::Arc<super::queue::CategoryQueue>,
    cancel: tokio_util::sync::CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        record: &JobRecord,
        queue: std::sync::Arc<super::queue::CategoryQueue>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            job_id: record.id,
            category: record.category,
            payload: record.payload.clone(),
            submitter: record.submitter.clone(),
            attempt: record.attempts,
            queue,
            cancel,
        }
    }

    /// Token triggered when the job is cancelled or the service stops.
    pub fn cancellation(&self) -> &tokio_util::sync::CancellationToken {
        &self.cancel
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job_id,
            category = %self.category,
            attempt = self.attempt,
            "{}",
            message
        );
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job_id,
            category = %self.category,
            attempt = self.attempt,
            "{}",
            message
        );
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("category", &self.category)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl crate::report::ProgressSink for JobContext {
    fn report(&self, percent: u8, message: &str) {
        self.queue.update_progress(self.job_id, percent, message);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
