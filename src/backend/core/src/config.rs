//! Configuration management.
//!
//! Values come from an optional file layered under environment variables
//! prefixed with `ROLLCALL` and separated by `__`, e.g.
//! `ROLLCALL__DATABASE__URL` or `ROLLCALL__JOBS__DOWNLOAD__CONCURRENCY`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::{BackoffStrategy, JobCategory, RetryPolicy};
use crate::restore::RestoreMode;
use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ROLLCALL";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Deployment environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Job queue configuration
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Filesystem locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Backup, archive and restore behaviour
    #[serde(default)]
    pub backup: BackupConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            database: DatabaseConfig::default(),
            jobs: JobsConfig::default(),
            storage: StorageConfig::default(),
            backup: BackupConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a free connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Queries slower than this are logged at warn level
    #[serde(default = "default_slow_query_ms")]
    pub slow_query_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            slow_query_ms: default_slow_query_ms(),
        }
    }
}

impl DatabaseConfig {
    /// The URL with any password replaced by `****`, for display.
    pub fn redacted_url(&self) -> String {
        redact_url(&self.url)
    }
}

/// Per-category queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Maximum simultaneously active jobs
    pub concurrency: usize,

    /// Attempts before a job fails terminally
    pub max_attempts: u32,

    /// Delay between attempts
    pub backoff: BackoffStrategy,

    /// Completed records kept for status queries
    #[serde(default = "default_retain_completed")]
    pub retain_completed: usize,

    /// Failed records kept for status queries
    #[serde(default = "default_retain_failed")]
    pub retain_failed: usize,

    /// An active job without progress for this long is flagged as stalled
    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,
}

impl CategoryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: self.backoff.clone(),
            retry_all_errors: false,
        }
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    /// High-throughput exports: many concurrent jobs, exponential retries.
    pub fn download() -> Self {
        Self {
            concurrency: 80,
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                initial_ms: 1_000,
                max_ms: 30_000,
                multiplier: 2.0,
            },
            retain_completed: default_retain_completed(),
            retain_failed: default_retain_failed(),
            stall_threshold_ms: default_stall_threshold_ms(),
        }
    }

    /// Heavy summaries: few concurrent jobs, one fixed-delay retry.
    pub fn report_generation() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 2,
            backoff: BackoffStrategy::Fixed { delay_ms: 5_000 },
            retain_completed: default_retain_completed(),
            retain_failed: default_retain_failed(),
            stall_threshold_ms: default_stall_threshold_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "CategoryConfig::download")]
    pub download: CategoryConfig,

    #[serde(default = "CategoryConfig::report_generation")]
    pub report_generation: CategoryConfig,

    /// How often delayed jobs are promoted and idle dispatchers re-check
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often active jobs are checked for stalls
    #[serde(default = "default_stall_check_interval_ms")]
    pub stall_check_interval_ms: u64,

    /// How long `stop()` waits for active jobs
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            download: CategoryConfig::download(),
            report_generation: CategoryConfig::report_generation(),
            poll_interval_ms: default_poll_interval_ms(),
            stall_check_interval_ms: default_stall_check_interval_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl JobsConfig {
    pub fn category(&self, category: JobCategory) -> &CategoryConfig {
        match category {
            JobCategory::Download => &self.download,
            JobCategory::ReportGeneration => &self.report_generation,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_millis(self.stall_check_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root under which each backup gets its own directory
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Where rendered report files are written
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Scratch space for restore extraction; system temp dir when unset
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            download_dir: default_download_dir(),
            temp_dir: None,
        }
    }
}

impl StorageConfig {
    /// All three locations under one root. Handy for tests.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            backup_dir: root.join("backups"),
            download_dir: root.join("downloads"),
            temp_dir: Some(root.join("tmp")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Attendance older than this many months moves to the archive tables
    #[serde(default = "default_retention_months")]
    pub retention_months: u32,

    /// Whether a zip of the backup directory is produced
    #[serde(default = "default_compress")]
    pub compress: bool,

    /// Rows per INSERT statement in the SQL dump
    #[serde(default = "default_dump_batch_size")]
    pub dump_batch_size: usize,

    /// Verify manifest checksums before replaying a dump
    #[serde(default = "default_verify_before_restore")]
    pub verify_before_restore: bool,

    /// Statement-by-statement or all-or-nothing replay
    #[serde(default)]
    pub restore_mode: RestoreMode,

    /// Delete archived rows from the live tables after copying them
    #[serde(default)]
    pub delete_live_rows_after_archive: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention_months: default_retention_months(),
            compress: default_compress(),
            dump_batch_size: default_dump_batch_size(),
            verify_before_restore: default_verify_before_restore(),
            restore_mode: RestoreMode::default(),
            delete_live_rows_after_archive: false,
        }
    }
}

// Default value functions
fn default_environment() -> String { "production".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout_secs() -> u64 { 5 }
fn default_slow_query_ms() -> u64 { 500 }
fn default_retain_completed() -> usize { 10 }
fn default_retain_failed() -> usize { 5 }
fn default_stall_threshold_ms() -> u64 { 300_000 }
fn default_poll_interval_ms() -> u64 { 250 }
fn default_stall_check_interval_ms() -> u64 { 30_000 }
fn default_shutdown_timeout_secs() -> u64 { 30 }
fn default_backup_dir() -> PathBuf { PathBuf::from("storage/backups") }
fn default_download_dir() -> PathBuf { PathBuf::from("storage/downloads") }
fn default_retention_months() -> u32 { 12 }
fn default_compress() -> bool { true }
fn default_dump_batch_size() -> usize { 1000 }
fn default_verify_before_restore() -> bool { true }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::from_environment(environment(None))
    }

    /// Load configuration from the given variables instead of the process
    /// environment. Keys use the same `ROLLCALL__` form.
    pub fn from_vars<I>(vars: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self::from_environment(environment(Some(vars.into_iter().collect())))
    }

    fn from_environment(env: config::Environment) -> anyhow::Result<Self> {
        let config = config::Config::builder().add_source(env).build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, overridden by the environment.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment(None))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// A configuration for local use that keeps all files under `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            environment: "development".to_string(),
            storage: StorageConfig::rooted_at(root),
            ..Self::default()
        }
    }
}

fn environment(vars: Option<config::Map<String, String>>) -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX).separator("__").source(vars)
}

/// Mask the password component of a connection URL.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at) = rest.find('@') else {
        return url.to_string();
    };
    let credentials = &rest[..at];
    match credentials.find(':') {
        Some(colon) => format!(
            "{}{}:****{}",
            &url[..scheme_end + 3],
            &credentials[..colon],
            &rest[at..]
        ),
        None => url.to_string(),
    }
}
