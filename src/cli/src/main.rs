//! Rollcall CLI - Administration of attendance backups, archives and exports.
//!
//! Provides commands for backup, archive, export, and configuration management.

mod commands;
mod output;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use commands::{archive, backup, config, export};
use output::OutputFormat;
use rollcall_core::config::Config;
use rollcall_core::db::{Database, PgDatabase};

/// Rollcall - attendance backups, archiving and report exports
#[derive(Parser)]
#[command(
    name = "rollcall",
    version,
    about = "Rollcall - attendance backups, archiving and report exports",
    long_about = "CLI tool for creating, verifying and restoring attendance backups, archiving old attendance and exporting reports.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "ROLLCALL_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Log progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backup management operations
    #[command(subcommand)]
    Backup(backup::BackupCommands),

    /// Archive migration operations
    #[command(subcommand)]
    Archive(archive::ArchiveCommands),

    /// Render a report through the job queue
    Export(export::ExportArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

/// Settings and connections shared by every command.
pub struct Context {
    pub config: Config,
    pub format: OutputFormat,
}

impl Context {
    pub async fn database(&self) -> Result<Arc<dyn Database>> {
        let db = PgDatabase::connect(&self.config.database)
            .await
            .with_context(|| format!("Could not connect to {}", self.config.database.redacted_url()))?;
        Ok(Arc::new(db))
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => {
            let path = path.to_str().context("Configuration path is not valid UTF-8")?;
            Config::from_file(path)?
        }
        None => Config::load().context("Invalid ROLLCALL__ environment configuration")?,
    };
    config::apply_overrides(&mut cfg, &config::load_cli_config()?);
    if let Some(url) = &cli.database_url {
        cfg.database.url = url.clone();
    }
    Ok(cfg)
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = load_config(&cli)?;
    if cli.verbose {
        rollcall_core::telemetry::init_logging(&cfg.logging, &cfg.environment)?;
    }
    let ctx = Context { config: cfg, format: cli.output };

    match cli.command {
        Commands::Backup(cmd) => backup::execute(cmd, &ctx).await,
        Commands::Archive(cmd) => archive::execute(cmd, &ctx).await,
        Commands::Export(args) => export::execute(args, &ctx).await,
        Commands::Config(cmd) => config::execute(cmd, &ctx).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
