//! Telemetry: structured logging and Prometheus metrics.
//!
//! ```rust,no_run
//! use rollcall_core::config::Config;
//! use rollcall_core::telemetry::init_telemetry;
//!
//! let config = Config::load().expect("configuration");
//! init_telemetry(&config.logging, &config.metrics, &config.environment)
//!     .expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use metrics::{init_metrics, BackupMetrics, JobMetrics, MetricsConfig, MetricsHandle, StepTimer};

/// Service name attached to metrics and the startup log line.
pub const SERVICE_NAME: &str = "rollcall";

/// Initialize logging, then metrics.
///
/// # Errors
///
/// Returns an error if either component fails to initialize.
pub fn init_telemetry(
    logging: &LoggingConfig,
    metrics: &MetricsConfig,
    environment: &str,
) -> anyhow::Result<TelemetryHandle> {
    init_logging(logging, environment)?;
    let metrics = init_metrics(metrics, SERVICE_NAME)?;

    ::tracing::info!(
        service = SERVICE_NAME,
        version = env!("CARGO_PKG_VERSION"),
        environment = %environment,
        metrics_endpoint = ?metrics.listening,
        "Telemetry initialized"
    );

    Ok(TelemetryHandle { metrics })
}

/// Handle for the telemetry lifecycle.
#[derive(Debug)]
pub struct TelemetryHandle {
    pub metrics: MetricsHandle,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        ::tracing::info!("Telemetry shutdown complete");
    }
}
