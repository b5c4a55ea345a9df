//! Configuration management commands.
//!
//! Stores CLI configuration in `~/.rollcall/config.toml`.

use anyhow::{Context as _, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::output::{self, OutputFormat};
use crate::Context;
use rollcall_core::config::{redact_url, Config};

/// Keys the CLI understands in its own config file.
const KNOWN_KEYS: [&str; 3] = ["database-url", "backup-dir", "temp-dir"];

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set a configuration value
    Set {
        /// Configuration key (database-url, backup-dir or temp-dir)
        key: String,
        /// Value to set
        value: String,
    },

    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },

    /// Show the effective configuration
    Show,

    /// Reset configuration to defaults
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

/// Persistent CLI configuration stored on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// Return the path to the configuration file (`~/.rollcall/config.toml`).
fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".rollcall").join("config.toml"))
}

/// Load the CLI configuration from disk, returning defaults if the file does
/// not exist.
pub fn load_cli_config() -> Result<CliConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let cfg: CliConfig = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    Ok(cfg)
}

fn save_config(cfg: &CliConfig) -> Result<()> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Layer values from the CLI config file over the core configuration.
pub fn apply_overrides(config: &mut Config, cli: &CliConfig) {
    if let Some(url) = cli.values.get("database-url") {
        config.database.url = url.clone();
    }
    if let Some(dir) = cli.values.get("backup-dir") {
        config.storage.backup_dir = PathBuf::from(dir);
    }
    if let Some(dir) = cli.values.get("temp-dir") {
        config.storage.temp_dir = Some(PathBuf::from(dir));
    }
}

fn display_value(key: &str, value: &str) -> String {
    if key == "database-url" {
        redact_url(value)
    } else {
        value.to_string()
    }
}

pub async fn execute(cmd: ConfigCommands, ctx: &Context) -> Result<()> {
    let format = ctx.format;
    match cmd {
        ConfigCommands::Set { key, value } => {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                anyhow::bail!("Unknown key '{}' (expected one of: {})", key, KNOWN_KEYS.join(", "));
            }
            let mut cfg = load_cli_config()?;
            cfg.values.insert(key.clone(), value.clone());
            save_config(&cfg)?;

            let shown = display_value(&key, &value);
            match format {
                OutputFormat::Table => output::print_success(&format!("{} = {}", key, shown)),
                _ => output::print_item(&serde_json::json!({ "key": key, "value": shown }), format)?,
            }
        }

        ConfigCommands::Get { key } => {
            let cfg = load_cli_config()?;
            let value = cfg
                .values
                .get(&key)
                .with_context(|| format!("Key '{}' not found", key))?;
            let shown = display_value(&key, value);
            match format {
                OutputFormat::Table => println!("{}", shown),
                _ => output::print_item(&serde_json::json!({ "key": key, "value": shown }), format)?,
            }
        }

        ConfigCommands::Show => {
            let mut effective = ctx.config.clone();
            effective.database.url = effective.database.redacted_url();

            match format {
                OutputFormat::Table => {
                    output::print_header("Configuration");
                    output::print_detail("Environment", &effective.environment);
                    output::print_detail("Database", &effective.database.url);
                    output::print_detail("Backup dir", effective.storage.backup_dir.display());
                    output::print_detail("Download dir", effective.storage.download_dir.display());
                    if let Some(tmp) = &effective.storage.temp_dir {
                        output::print_detail("Temp dir", tmp.display());
                    }
                    output::print_detail("Retention", format!("{} months", effective.backup.retention_months));
                    output::print_detail("Compress", effective.backup.compress);
                    output::print_detail("Restore mode", effective.backup.restore_mode);
                    output::print_detail("Verify before restore", effective.backup.verify_before_restore);
                    output::print_detail(
                        "Prune after archive",
                        effective.backup.delete_live_rows_after_archive,
                    );
                    output::print_detail(
                        "Download workers",
                        effective.jobs.download.concurrency,
                    );
                    output::print_detail(
                        "Report workers",
                        effective.jobs.report_generation.concurrency,
                    );
                }
                _ => output::print_item(&effective, format)?,
            }
        }

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info("This will reset all CLI configuration. Use --force to confirm.");
                return Ok(());
            }

            let path = config_path()?;
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }

            output::print_success("Configuration reset to defaults");
        }
    }

    Ok(())
}
