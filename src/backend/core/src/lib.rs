#![allow(clippy::result_large_err)]
//! # Rollcall Core
//!
//! Report jobs and data safety for a school attendance system.
//!
//! ## Architecture
//!
//! - **Jobs**: Priority job queue with per-category concurrency, retries and stall detection
//! - **Reports**: Spreadsheet rendering of attendance, permission and summary data
//! - **Backup**: SQL dump, workbook snapshot, checksummed manifest and optional zip
//! - **Archive**: Migration of aged attendance rows into archive tables
//! - **Restore**: Replay of a backup's dump, statement by statement or atomically
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod archive;
pub mod backup;
pub mod calendar;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod report;
pub mod restore;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, RollcallError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::archive::{ArchiveMigrator, ArchiveReport, PruneReport};
    pub use crate::backup::{
        BackupEntry, BackupOrchestrator, BackupSpec, BackupType, CreatedBackup, Manifest, Schedule,
        VerificationReport,
    };
    pub use crate::calendar::{DateRange, Semester};
    pub use crate::config::Config;
    pub use crate::db::{Database, PgDatabase, Row, SqlValue, SqliteDatabase};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, RollcallError};
    pub use crate::jobs::{
        JobCategory, JobError, JobHandle, JobHandler, JobId, JobPayload, JobRecord, JobService, JobState,
        ReportJobHandler, Role, Submitter,
    };
    pub use crate::report::{NoopProgress, ProgressSink, ReportFilter, ReportKind, ReportRenderer};
    pub use crate::restore::{RestoreEngine, RestoreMode, RestoreOutcome};
}
