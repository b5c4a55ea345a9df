//! Prometheus metrics for the job queue and the backup pipeline.
//!
//! Metric names are described once in [`register_metric_descriptions`]; the
//! rest of the crate records through the small typed helpers below so label
//! sets stay consistent.
//!
//! ```rust,no_run
//! use rollcall_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::submitted("download", "student-attendance");
//! JobMetrics::finished("download", true, 1.25);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is installed
    #[serde(default)]
    pub enabled: bool,

    /// Listen address of the scrape endpoint (e.g. "0.0.0.0:9090")
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Histogram buckets for durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
}

/// Result of [`init_metrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsHandle {
    /// Address the scrape endpoint listens on, when installed.
    pub listening: Option<SocketAddr>,
}

/// Install the Prometheus exporter.
///
/// Does nothing unless metrics are enabled *and* an endpoint is configured.
/// Must be called from inside a tokio runtime because the exporter serves
/// scrapes on a background task.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsHandle> {
    let endpoint = match (&config.enabled, &config.endpoint) {
        (true, Some(endpoint)) => endpoint,
        _ => return Ok(MetricsHandle::default()),
    };
    let addr: SocketAddr = endpoint.parse()?;

    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.add_global_label("service", service_name);
    builder = builder.set_buckets(&config.duration_buckets)?;
    builder.install()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, endpoint = %addr, "Metrics initialized");

    Ok(MetricsHandle {
        listening: Some(addr),
    })
}

/// Register all metric descriptions.
pub fn register_metric_descriptions() {
    // Errors
    describe_counter!("rollcall_errors_total", "Errors constructed, by code and severity");

    // Job queue
    describe_counter!("rollcall_jobs_submitted_total", "Jobs accepted by the queue");
    describe_counter!("rollcall_jobs_completed_total", "Jobs that finished successfully");
    describe_counter!("rollcall_jobs_failed_total", "Jobs that failed terminally");
    describe_counter!("rollcall_jobs_retried_total", "Attempts rescheduled after an error");
    describe_counter!("rollcall_jobs_stalled_total", "Active jobs flagged as stalled");
    describe_histogram!("rollcall_job_duration_seconds", "Duration of a single job attempt");
    describe_gauge!("rollcall_queue_depth", "Jobs waiting per category");
    describe_gauge!("rollcall_jobs_active", "Jobs running per category");

    // Backup pipeline
    describe_counter!("rollcall_backups_total", "Backups attempted, by outcome");
    describe_histogram!("rollcall_backup_duration_seconds", "Wall time of a backup run");
    describe_histogram!("rollcall_backup_step_duration_seconds", "Wall time per backup step");
    describe_gauge!("rollcall_backup_size_bytes", "Size of the most recent backup");
    describe_counter!("rollcall_archive_rows_total", "Rows copied into archive tables");
    describe_counter!("rollcall_pruned_rows_total", "Archived rows deleted from live tables");
    describe_counter!("rollcall_restores_total", "Restores attempted, by outcome");
    describe_counter!(
        "rollcall_restore_statements_total",
        "Statements replayed during restore, by outcome"
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Metrics
// ═══════════════════════════════════════════════════════════════════════════════

/// Recorders for the job queue.
pub struct JobMetrics;

impl JobMetrics {
    pub fn submitted(category: &'static str, job_type: &'static str) {
        counter!(
            "rollcall_jobs_submitted_total",
            "category" => category,
            "job_type" => job_type,
        )
        .increment(1);
    }

    /// One attempt finished; `success` distinguishes the outcome label.
    pub fn finished(category: &'static str, success: bool, duration_seconds: f64) {
        let outcome = if success { "success" } else { "error" };
        histogram!(
            "rollcall_job_duration_seconds",
            "category" => category,
            "outcome" => outcome,
        )
        .record(duration_seconds);
        if success {
            counter!("rollcall_jobs_completed_total", "category" => category).increment(1);
        }
    }

    pub fn failed(category: &'static str) {
        counter!("rollcall_jobs_failed_total", "category" => category).increment(1);
    }

    pub fn retried(category: &'static str) {
        counter!("rollcall_jobs_retried_total", "category" => category).increment(1);
    }

    pub fn stalled(category: &'static str) {
        counter!("rollcall_jobs_stalled_total", "category" => category).increment(1);
    }

    pub fn set_depth(category: &'static str, queued: usize, active: usize) {
        gauge!("rollcall_queue_depth", "category" => category).set(queued as f64);
        gauge!("rollcall_jobs_active", "category" => category).set(active as f64);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backup Metrics
// ═══════════════════════════════════════════════════════════════════════════════

/// Recorders for backup, archive and restore.
pub struct BackupMetrics;

impl BackupMetrics {
    pub fn backup_finished(success: bool, duration: Duration, size_bytes: u64) {
        let outcome = if success { "success" } else { "error" };
        counter!("rollcall_backups_total", "outcome" => outcome).increment(1);
        histogram!("rollcall_backup_duration_seconds").record(duration.as_secs_f64());
        if success {
            gauge!("rollcall_backup_size_bytes").set(size_bytes as f64);
        }
    }

    pub fn archived(table: &'static str, rows: u64) {
        counter!("rollcall_archive_rows_total", "table" => table).increment(rows);
    }

    pub fn pruned(table: &'static str, rows: u64) {
        counter!("rollcall_pruned_rows_total", "table" => table).increment(rows);
    }

    pub fn restore_finished(success: bool, executed: u64, failed: u64) {
        let outcome = if success { "success" } else { "error" };
        counter!("rollcall_restores_total", "outcome" => outcome).increment(1);
        counter!("rollcall_restore_statements_total", "outcome" => "executed").increment(executed);
        counter!("rollcall_restore_statements_total", "outcome" => "failed").increment(failed);
    }
}

/// Times one named step and records it on [`StepTimer::finish`].
pub struct StepTimer {
    start: Instant,
    step: &'static str,
}

impl StepTimer {
    pub fn start(step: &'static str) -> Self {
        Self {
            start: Instant::now(),
            step,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        histogram!("rollcall_backup_step_duration_seconds", "step" => self.step)
            .record(duration.as_secs_f64());
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        assert!(config.endpoint.is_none());
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_metrics_install_nothing() {
        let config = MetricsConfig {
            enabled: true,
            ..MetricsConfig::default()
        };
        let handle = init_metrics(&config, "rollcall-test").unwrap();
        assert!(handle.listening.is_none());
    }

    #[test]
    fn test_step_timer() {
        let timer = StepTimer::start("dump");
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.finish().as_millis() >= 10);
    }

    #[test]
    fn test_recorders_without_exporter() {
        // Recording with no recorder installed is a no-op.
        JobMetrics::submitted("download", "student-attendance");
        JobMetrics::finished("download", false, 0.5);
        BackupMetrics::archived("student_attendance", 3);
    }
}
