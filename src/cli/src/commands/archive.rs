//! Archive migration commands.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{self, OutputFormat};
use crate::Context;
use rollcall_core::archive::{cutoff_for_age, ArchiveMigrator, ArchiveReport, PruneReport};
use rollcall_core::backup::spec::today;

#[derive(Subcommand)]
pub enum ArchiveCommands {
    /// Copy attendance older than the horizon into the archive tables
    Run {
        /// Age horizon in months (defaults to the configured retention)
        #[arg(short, long)]
        months: Option<u32>,
    },

    /// Delete live attendance rows that are already archived
    Prune {
        /// Age horizon in months (defaults to the configured retention)
        #[arg(short, long)]
        months: Option<u32>,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled, Serialize)]
struct TableCountRow {
    #[tabled(rename = "Table")]
    table: String,
    #[tabled(rename = "Rows")]
    rows: u64,
}

fn count_rows<'a>(counts: impl IntoIterator<Item = (&'a String, &'a u64)>) -> Vec<TableCountRow> {
    counts
        .into_iter()
        .map(|(table, rows)| TableCountRow {
            table: table.clone(),
            rows: *rows,
        })
        .collect()
}

fn print_archived(report: &ArchiveReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            output::print_success(&format!(
                "Archived {} rows dated before {}",
                report.total(),
                report.cutoff
            ));
            output::print_list(&count_rows(&report.moved), format)
        }
        _ => output::print_item(report, format),
    }
}

fn print_pruned(report: &PruneReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            output::print_list(&count_rows(&report.deleted), format)?;
            match &report.failure {
                None => output::print_success(&format!(
                    "Pruned {} live rows dated before {}",
                    report.total(),
                    report.cutoff
                )),
                Some(failure) => output::print_warning(&format!(
                    "Pruning stopped at {}: {}",
                    failure.table, failure.error
                )),
            }
            Ok(())
        }
        _ => output::print_item(report, format),
    }
}

pub async fn execute(cmd: ArchiveCommands, ctx: &Context) -> Result<()> {
    let format = ctx.format;
    let retention = ctx.config.backup.retention_months;

    match cmd {
        ArchiveCommands::Run { months } => {
            let cutoff = cutoff_for_age(today(), months.unwrap_or(retention));
            let migrator = ArchiveMigrator::new(ctx.database().await?)
                .delete_live_rows(ctx.config.backup.delete_live_rows_after_archive);
            let (archived, pruned) = migrator.archive_and_prune(cutoff).await?;
            print_archived(&archived, format)?;
            if let Some(pruned) = pruned {
                print_pruned(&pruned, format)?;
            }
        }

        ArchiveCommands::Prune { months, force } => {
            let cutoff = cutoff_for_age(today(), months.unwrap_or(retention));
            if !force {
                output::print_info(&format!(
                    "This will delete archived live rows dated before {}. Use --force to confirm.",
                    cutoff
                ));
                return Ok(());
            }
            let report = ArchiveMigrator::new(ctx.database().await?).prune_live(cutoff).await;
            print_pruned(&report, format)?;
            if !report.is_complete() {
                anyhow::bail!("Pruning did not complete");
            }
        }
    }

    Ok(())
}
