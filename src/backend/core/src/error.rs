//! Error handling for Rollcall Core.
//!
//! This module provides:
//! - A single error type with machine-readable codes and context chaining
//! - User-friendly messages vs detailed internal messages
//! - Retry classification used by the job queue
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use rollcall_core::error::{RollcallError, Result, ErrorContext, ErrorCode};
//!
//! fn read_dump(path: &Path) -> Result<String> {
//!     std::fs::read_to_string(path).with_error_code(ErrorCode::BackupFileMissing)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Rollcall operations.
pub type Result<T> = std::result::Result<T, RollcallError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    JobExecutionFailed,
    JobAttemptsExhausted,
    JobCancelled,
    QueueShutdown,
    JobWaitTimeout,

    // Backup Errors (1100-1199)
    BackupNotFound,
    BackupFileMissing,
    BackupStepFailed,
    BackupIntegrityFailed,
    ManifestAlreadyExists,

    // Restore / Archive Errors (1200-1299)
    RestoreFailed,
    RestoreStatementFailed,
    ArchiveFailed,

    // Report Errors (1300-1399)
    ReportRenderFailed,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    DatabaseTransactionFailed,
    RecordNotFound,
    DuplicateRecord,
    UnsupportedStatement,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Filesystem Errors (2300-2399)
    IoError,
    CompressionFailed,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,
    MissingRequiredField,
    InvalidFormat,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    NotImplemented,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Job Errors
            Self::JobNotFound => 1000,
            Self::JobExecutionFailed => 1001,
            Self::JobAttemptsExhausted => 1002,
            Self::JobCancelled => 1003,
            Self::QueueShutdown => 1004,
            Self::JobWaitTimeout => 1005,

            // Backup Errors
            Self::BackupNotFound => 1100,
            Self::BackupFileMissing => 1101,
            Self::BackupStepFailed => 1102,
            Self::BackupIntegrityFailed => 1103,
            Self::ManifestAlreadyExists => 1104,

            // Restore / Archive Errors
            Self::RestoreFailed => 1200,
            Self::RestoreStatementFailed => 1201,
            Self::ArchiveFailed => 1202,

            // Report Errors
            Self::ReportRenderFailed => 1300,

            // Database Errors
            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::DatabaseTransactionFailed => 2003,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,
            Self::UnsupportedStatement => 2006,

            // Serialization Errors
            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            // Filesystem Errors
            Self::IoError => 2300,
            Self::CompressionFailed => 2301,

            // Validation Errors
            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,
            Self::MissingRequiredField => 4102,
            Self::InvalidFormat => 4103,

            // Configuration Errors
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            // Internal Errors
            Self::InternalError => 9000,
            Self::NotImplemented => 9001,
            Self::UnknownError => 9099,
        }
    }

    /// Check if this error is transient and worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::DatabaseTransactionFailed
                | Self::IoError
                | Self::ReportRenderFailed
                | Self::JobExecutionFailed
        )
    }

    /// Check if this error means the addressed entity does not exist.
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound | Self::BackupNotFound | Self::BackupFileMissing | Self::RecordNotFound
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "backup",
            1200..=1299 => "restore",
            1300..=1399 => "report",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            2300..=2399 => "filesystem",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown ids)
    Low,
    /// Operational issues (single statement failures, cancelled jobs)
    Medium,
    /// System errors (database failures, broken backups)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidFormat
            | ErrorCode::JobNotFound
            | ErrorCode::BackupNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord => Self::Low,

            ErrorCode::JobCancelled
            | ErrorCode::QueueShutdown
            | ErrorCode::JobWaitTimeout
            | ErrorCode::RestoreStatementFailed
            | ErrorCode::UnsupportedStatement
            | ErrorCode::CompressionFailed
            | ErrorCode::ManifestAlreadyExists
            | ErrorCode::NotImplemented => Self::Medium,

            ErrorCode::JobExecutionFailed
            | ErrorCode::JobAttemptsExhausted
            | ErrorCode::BackupFileMissing
            | ErrorCode::BackupStepFailed
            | ErrorCode::RestoreFailed
            | ErrorCode::ArchiveFailed
            | ErrorCode::ReportRenderFailed
            | ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::DatabaseTransactionFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson
            | ErrorCode::IoError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::BackupIntegrityFailed
            | ErrorCode::DatabaseConnectionFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, backup, table)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.entity_type.is_none()
            && self.suggested_action.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Rollcall Core.
#[derive(Error, Debug)]
pub struct RollcallError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to callers)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for RollcallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl RollcallError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a missing-field validation error.
    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("Missing required field: {}", field),
        )
        .with_details(ErrorDetails::new().with_context("field", field))
    }

    /// Create a job-not-found error.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id))
    }

    /// Create a backup-not-found error.
    pub fn backup_not_found(backup_id: &str) -> Self {
        Self::new(ErrorCode::BackupNotFound, format!("Backup not found: {}", backup_id))
            .with_details(ErrorDetails::new().with_entity("backup", backup_id))
    }

    /// Create an error for a fatal backup step.
    pub fn backup_step(step: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::BackupStepFailed,
            format!("Backup step '{}' failed", step),
            reason,
        )
        .with_details(ErrorDetails::new().with_context("step", step))
    }

    /// Create a statement replay error.
    pub fn restore_statement(index: usize, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::RestoreStatementFailed,
            format!("Statement {} failed during restore", index),
            reason,
        )
    }

    /// Create an unsupported statement error (in-memory store).
    pub fn unsupported_statement(statement: &str) -> Self {
        let preview: String = statement.chars().take(80).collect();
        Self::new(
            ErrorCode::UnsupportedStatement,
            format!("Unsupported statement: {}", preview),
        )
    }

    /// Create a database query error with internal detail.
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::DatabaseQueryFailed, "A database query failed", message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Check if this error is a not-found outcome.
    pub fn is_not_found(&self) -> bool {
        self.code.is_not_found()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Human-readable reason combining the user and internal messages.
    pub fn reason(&self) -> String {
        match &self.internal_message {
            Some(internal) => format!("{}: {}", self.user_message, internal),
            None => self.user_message.to_string(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "rollcall_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Structured Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured failure outcome handed to callers of job, backup and restore operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Whether the operation was successful (always false for errors)
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code
    pub numeric_code: u32,

    /// User-friendly error message
    pub message: String,

    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&RollcallError> for ErrorResponse {
    fn from(error: &RollcallError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.is_empty() {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let message = message.into();
            RollcallError::internal(format!("{}: {}", message, e)).with_source(e)
        })
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| RollcallError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| RollcallError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| RollcallError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for RollcallError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                if let Some(constraint) = db_err.constraint() {
                    if constraint.contains("unique") || constraint.contains("pkey") {
                        return Self::with_internal(
                            ErrorCode::DuplicateRecord,
                            "A record with this identifier already exists",
                            format!("Constraint violation: {}", constraint),
                        )
                        .with_source(error);
                    }
                }
                (ErrorCode::DatabaseQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for RollcallError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for RollcallError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::BackupFileMissing, "File or directory not found"),
            ErrorKind::AlreadyExists => (ErrorCode::ManifestAlreadyExists, "File already exists"),
            _ => (ErrorCode::IoError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<zip::result::ZipError> for RollcallError {
    fn from(error: zip::result::ZipError) -> Self {
        Self::with_internal(
            ErrorCode::CompressionFailed,
            "Archive compression or extraction failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<rust_xlsxwriter::XlsxError> for RollcallError {
    fn from(error: rust_xlsxwriter::XlsxError) -> Self {
        Self::with_internal(
            ErrorCode::ReportRenderFailed,
            "Failed to write spreadsheet",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<tokio::task::JoinError> for RollcallError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "A background task did not complete",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<tokio::sync::AcquireError> for RollcallError {
    fn from(error: tokio::sync::AcquireError) -> Self {
        Self::with_internal(
            ErrorCode::QueueShutdown,
            "Worker pool is closed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<anyhow::Error> for RollcallError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<RollcallError>() {
            Ok(rollcall_error) => rollcall_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for RollcallError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file could not be parsed",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::DatabaseQueryFailed.is_retryable());
        assert!(ErrorCode::IoError.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::JobCancelled.is_retryable());
        assert!(!ErrorCode::BackupNotFound.is_retryable());
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::JobNotFound.category(), "job");
        assert_eq!(ErrorCode::BackupStepFailed.category(), "backup");
        assert_eq!(ErrorCode::RestoreStatementFailed.category(), "restore");
        assert_eq!(ErrorCode::DatabaseError.category(), "database");
        assert_eq!(ErrorCode::MissingRequiredField.category(), "validation");
    }

    #[test]
    fn test_error_creation() {
        let err = RollcallError::validation("start_date must not be after end_date");
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(err.user_message(), "start_date must not be after end_date");
        assert!(err.internal_message().is_none());
    }

    #[test]
    fn test_not_found_errors() {
        let err = RollcallError::backup_not_found("semester-20250101-000000000");
        assert!(err.is_not_found());
        assert_eq!(err.details().entity_type.as_deref(), Some("backup"));

        let err = RollcallError::job_not_found("abc");
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        ));
        let err = result.context("writing dump").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert!(err.internal_message().unwrap().contains("disk full"));

        let none: Option<u8> = None;
        let err = none.with_error_code(ErrorCode::JobNotFound).unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }

    #[test]
    fn test_error_response_serialization() {
        let err = RollcallError::missing_field("start_date");
        let response = ErrorResponse::from(&err);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "MISSING_REQUIRED_FIELD");
        assert_eq!(json["error"]["numeric_code"], 4102);
        assert_eq!(json["error"]["details"]["context"]["field"], "start_date");
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            RollcallError::validation("bad").severity(),
            ErrorSeverity::Low
        );
        assert_eq!(
            RollcallError::backup_step("dump", "disk full").severity(),
            ErrorSeverity::High
        );
        assert_eq!(
            RollcallError::internal("boom").severity(),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_io_not_found_maps_to_missing_file() {
        let err: RollcallError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file").into();
        assert_eq!(err.code(), ErrorCode::BackupFileMissing);
    }

    #[test]
    fn test_error_display_and_reason() {
        let err = RollcallError::backup_step("dump", "disk full");
        let display = format!("{}", err);
        assert!(display.contains("BackupStepFailed"));
        assert!(display.contains("disk full"));
        assert_eq!(err.reason(), "Backup step 'dump' failed: disk full");
    }
}
