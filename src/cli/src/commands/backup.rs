//! Backup management commands.

use anyhow::{bail, Context as _, Result};
use chrono::NaiveDate;
use clap::{Args, Subcommand};
use colored::*;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{self, OutputFormat};
use crate::Context;
use rollcall_core::backup::{ArchiveStep, BackupEntry, BackupOrchestrator, BackupSpec, FileStatus, Manifest};
use rollcall_core::calendar::Semester;
use rollcall_core::restore::{RestoreEngine, RestoreMode};

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create a new backup
    Create(CreateArgs),

    /// List backups, newest first
    List,

    /// Show a backup's manifest
    Show {
        /// Backup ID
        id: String,
    },

    /// Verify a backup's checksums
    Verify {
        /// Backup ID
        id: String,
    },

    /// Delete a backup directory and its zip
    Delete {
        /// Backup ID
        id: String,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Replay a backup's SQL dump into the database
    Restore {
        /// Backup ID
        id: String,

        /// Replay mode (partial or atomic)
        #[arg(long)]
        mode: Option<String>,

        /// Skip the checksum check before replaying
        #[arg(long)]
        no_verify: bool,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    /// Semester (ganjil or genap)
    #[arg(long, requires = "year", conflicts_with_all = ["from", "schedule"])]
    semester: Option<String>,

    /// Academic year for --semester
    #[arg(long)]
    year: Option<i32>,

    /// First day of a date-range backup (YYYY-MM-DD)
    #[arg(long, requires = "to", conflicts_with = "schedule")]
    from: Option<NaiveDate>,

    /// Last day of a date-range backup (YYYY-MM-DD)
    #[arg(long)]
    to: Option<NaiveDate>,

    /// Scheduled backup (daily, weekly, monthly or full)
    #[arg(long)]
    schedule: Option<String>,
}

impl CreateArgs {
    fn spec(self) -> Result<BackupSpec> {
        if let Some(semester) = self.semester {
            let semester: Semester = semester.parse()?;
            let year = self.year.context("--year is required with --semester")?;
            return Ok(BackupSpec::semester(semester, year));
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            return Ok(BackupSpec::date_range(from, to));
        }
        if let Some(schedule) = self.schedule {
            return Ok(BackupSpec::scheduled(schedule));
        }
        bail!("Specify one of --semester/--year, --from/--to or --schedule")
    }
}

#[derive(Tabled, Serialize)]
struct BackupRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    backup_type: String,
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Rows")]
    rows: u64,
    #[tabled(rename = "Stored")]
    stored: String,
}

impl From<&BackupEntry> for BackupRow {
    fn from(entry: &BackupEntry) -> Self {
        let m = &entry.manifest;
        let stored = match (&entry.directory, &entry.archive) {
            (Some(_), Some(_)) => "dir+zip",
            (Some(_), None) => "dir",
            (None, Some(_)) => "zip",
            (None, None) => "-",
        };
        Self {
            id: m.backup_id.clone(),
            backup_type: m.backup_type.to_string(),
            scope: format!("{}..{}", m.scope.start_date, m.scope.end_date),
            created: m.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            rows: m.statistics.total_rows_dumped(),
            stored: stored.to_string(),
        }
    }
}

fn orchestrator(ctx: &Context, db: std::sync::Arc<dyn rollcall_core::db::Database>) -> BackupOrchestrator {
    BackupOrchestrator::new(db, &ctx.config.storage, ctx.config.backup.clone())
}

fn print_manifest(manifest: &Manifest) {
    output::print_header(&format!("Backup {}", manifest.backup_id));
    output::print_detail("Type", manifest.backup_type);
    output::print_detail("Scope", format!("{}..{}", manifest.scope.start_date, manifest.scope.end_date));
    if let (Some(semester), Some(year)) = (manifest.scope.semester, manifest.scope.year) {
        output::print_detail("Semester", format!("{} {}", semester, year));
    }
    if let Some(schedule) = manifest.scope.schedule {
        output::print_detail("Schedule", schedule);
    }
    output::print_detail("Created", manifest.timestamp.to_rfc3339());
    output::print_detail("Files", manifest.files.join(", "));

    let stats = &manifest.statistics;
    output::print_detail("Database size", output::format_bytes(stats.database_size_bytes));
    output::print_detail("Report rows", stats.report_rows);
    for (table, rows) in &stats.rows_dumped {
        output::print_detail(&format!("Dumped {}", table), rows);
    }
    match &stats.archive {
        ArchiveStep::Skipped => output::print_detail("Archive", "skipped"),
        ArchiveStep::Completed(report) => output::print_detail(
            "Archive",
            format!("{} rows before {}", report.total(), report.cutoff),
        ),
        ArchiveStep::Failed { cutoff, error } => {
            output::print_detail("Archive", format!("{} (cutoff {})", "failed".red(), cutoff));
            output::print_warning(error);
        }
    }
}

pub async fn execute(cmd: BackupCommands, ctx: &Context) -> Result<()> {
    let format = ctx.format;
    let orch = orchestrator(ctx, ctx.database().await?);

    match cmd {
        BackupCommands::Create(args) => {
            let spec = args.spec()?;
            let created = orch.create_backup(&spec).await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!(
                        "Backup {} created in {} ms",
                        created.manifest.backup_id, created.duration_ms
                    ));
                    print_manifest(&created.manifest);
                    output::print_detail("Directory", created.directory.display());
                    if let Some(zip) = &created.archive {
                        output::print_detail("Zip", zip.display());
                    }
                }
                _ => output::print_item(&created.manifest, format)?,
            }
        }

        BackupCommands::List => {
            let entries = orch.list_backups().await?;
            let rows: Vec<BackupRow> = entries.iter().map(BackupRow::from).collect();
            output::print_list(&rows, format)?;
        }

        BackupCommands::Show { id } => {
            let entry = orch.get_backup(&id).await?;
            match format {
                OutputFormat::Table => {
                    print_manifest(&entry.manifest);
                    if let Some(dir) = &entry.directory {
                        output::print_detail("Directory", dir.display());
                    }
                    if let Some(zip) = &entry.archive {
                        output::print_detail("Zip", zip.display());
                    }
                }
                _ => output::print_item(&entry.manifest, format)?,
            }
        }

        BackupCommands::Verify { id } => {
            let report = orch.verify_backup(&id).await?;
            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Verification of {}", report.backup_id));
                    for file in &report.files {
                        let status = match &file.status {
                            FileStatus::Ok => "ok".green().to_string(),
                            FileStatus::Missing => "missing".red().to_string(),
                            FileStatus::Mismatch { actual, .. } => {
                                format!("{} (got {})", "checksum mismatch".red(), actual)
                            }
                        };
                        output::print_detail(&file.name, status);
                    }
                    println!();
                }
                _ => output::print_item(&report, format)?,
            }
            if !report.is_ok() {
                bail!("{} file(s) failed verification", report.failures().count());
            }
            if matches!(format, OutputFormat::Table) {
                output::print_success("All checksums match");
            }
        }

        BackupCommands::Delete { id, force } => {
            if !force {
                output::print_info(&format!(
                    "This will permanently delete backup {}. Use --force to confirm.",
                    id
                ));
                return Ok(());
            }
            let deleted = orch.delete_backup(&id).await?;
            match format {
                OutputFormat::Table => {
                    let what = match (deleted.directory, deleted.archive) {
                        (true, true) => "directory and zip",
                        (true, false) => "directory",
                        _ => "zip",
                    };
                    output::print_success(&format!("Deleted {} of backup {}", what, id));
                }
                _ => output::print_item(&deleted, format)?,
            }
        }

        BackupCommands::Restore { id, mode, no_verify } => {
            let mode = match mode {
                Some(mode) => mode.parse::<RestoreMode>()?,
                None => ctx.config.backup.restore_mode,
            };
            let engine: RestoreEngine = orch
                .restore_engine()
                .with_mode(mode)
                .verify_before_restore(!no_verify && ctx.config.backup.verify_before_restore);
            let outcome = engine.restore(&id).await?;

            match format {
                OutputFormat::Table => {
                    if outcome.is_complete() {
                        output::print_success(&outcome.summary());
                    } else {
                        output::print_warning(&outcome.summary());
                        for failure in &outcome.failures {
                            output::print_detail(
                                &format!("#{}", failure.index),
                                format!("{} ({})", failure.reason, failure.statement),
                            );
                        }
                    }
                }
                _ => output::print_item(&outcome, format)?,
            }
        }
    }

    Ok(())
}
