//! Rollcall Server - Main entry point
//!
//! Runs the report job service against PostgreSQL until Ctrl-C or SIGTERM.

use std::sync::Arc;

use rollcall_core::{
    config::Config,
    db::{Database, PgDatabase},
    jobs::{JobService, ReportJobHandler},
    report::ReportRenderer,
    telemetry::{self, SERVICE_NAME},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("ROLLCALL_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load()?,
    };

    // Initialize telemetry
    let telemetry = telemetry::init_telemetry(&config.logging, &config.metrics, &config.environment)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        service = SERVICE_NAME,
        "Starting Rollcall server"
    );

    // Connect to database
    let db = PgDatabase::connect(&config.database).await?;
    let latency = db.ping().await?;
    tracing::info!(
        database = %config.database.redacted_url(),
        latency_ms = latency.as_millis() as u64,
        "Connected to database"
    );
    let db: Arc<dyn Database> = Arc::new(db);

    // Start the job service
    tokio::fs::create_dir_all(&config.storage.download_dir).await?;
    let renderer = Arc::new(ReportRenderer::new(db, config.storage.download_dir.clone()));
    let service = JobService::new(config.jobs.clone(), Arc::new(ReportJobHandler::new(renderer)));
    service.start()?;
    tracing::info!(
        download_dir = %config.storage.download_dir.display(),
        "Job service started"
    );

    shutdown_signal().await;

    if !service.stop().await {
        tracing::warn!("Some jobs were still running when the shutdown timeout expired");
    }
    telemetry.shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
