//! Backup orchestration.
//!
//! A backup lives in `{backup_root}/{id}/` and holds `{id}.sql`, `{id}.xlsx`
//! and `manifest.json`. The manifest is written last, so a directory with a
//! manifest is always complete. An optional `{backup_root}/{id}.zip` sibling
//! carries the same three files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info_span, Instrument};

use super::compress;
use super::dump::{DumpSummary, SqlDumpWriter};
use super::manifest::{ArchiveStep, BackupStatistics, Manifest, ManifestBuilder, VerificationReport, MANIFEST_FILE};
use super::spec::{backup_id, validate_backup_id, BackupSpec};
use crate::archive::{cutoff_for_age, ArchiveMigrator, ArchiveReport, PruneReport};
use crate::calendar::DateRange;
use crate::config::{BackupConfig, StorageConfig};
use crate::db::Database;
use crate::error::{ErrorCode, Result, RollcallError};
use crate::report::{ReportFilter, ReportKind, ReportRenderer, Workbook};
use crate::restore::{RestoreEngine, RestoreOutcome};
use crate::telemetry::{BackupMetrics, StepTimer};

/// Sheets of the backup workbook, in order.
pub const BACKUP_SHEETS: [ReportKind; 5] = [
    ReportKind::StudentAttendance,
    ReportKind::TeacherAttendance,
    ReportKind::PermissionRequests,
    ReportKind::AnalyticsSummary,
    ReportKind::SystemConfiguration,
];

/// Result of [`BackupOrchestrator::create_backup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedBackup {
    pub manifest: Manifest,
    pub directory: PathBuf,
    /// Set when compression was enabled and succeeded
    pub archive: Option<PathBuf>,
    pub duration_ms: u64,
}

/// A backup found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub manifest: Manifest,
    pub directory: Option<PathBuf>,
    pub archive: Option<PathBuf>,
}

impl BackupEntry {
    pub fn backup_id(&self) -> &str {
        &self.manifest.backup_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.manifest.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedBackup {
    pub directory: bool,
    pub archive: bool,
}

/// Creates, lists, verifies, deletes and restores backups.
#[derive(Clone)]
pub struct BackupOrchestrator {
    db: Arc<dyn Database>,
    renderer: ReportRenderer,
    backup_root: PathBuf,
    temp_dir: Option<PathBuf>,
    config: BackupConfig,
}

impl BackupOrchestrator {
    pub fn new(db: Arc<dyn Database>, storage: &StorageConfig, config: BackupConfig) -> Self {
        Self {
            renderer: ReportRenderer::new(db.clone(), storage.download_dir.clone()),
            db,
            backup_root: storage.backup_dir.clone(),
            temp_dir: storage.temp_dir.clone(),
            config,
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Create a backup for `spec` as of now.
    pub async fn create_backup(&self, spec: &BackupSpec) -> Result<CreatedBackup> {
        self.create_backup_at(spec, Utc::now()).await
    }

    /// Create a backup as if it were `now`. Scheduled ranges and the archive
    /// cutoff are computed from this instant.
    pub async fn create_backup_at(&self, spec: &BackupSpec, now: DateTime<Utc>) -> Result<CreatedBackup> {
        let started = Instant::now();
        let span = info_span!("backup", kind = spec.tag(), backup_id = tracing::field::Empty);
        let result = self.run_backup(spec, now, started).instrument(span).await;

        match &result {
            Ok(created) => {
                let size = created
                    .manifest
                    .statistics
                    .database_size_bytes;
                BackupMetrics::backup_finished(true, started.elapsed(), size);
                tracing::info!(
                    backup_id = %created.manifest.backup_id,
                    files = created.manifest.files.len(),
                    rows = created.manifest.statistics.total_rows_dumped(),
                    duration_ms = created.duration_ms,
                    "Backup created"
                );
            }
            Err(e) => {
                BackupMetrics::backup_finished(false, started.elapsed(), 0);
                e.log();
            }
        }
        result
    }

    async fn run_backup(&self, spec: &BackupSpec, now: DateTime<Utc>, started: Instant) -> Result<CreatedBackup> {
        let today = now.date_naive();
        let scope = run_step("resolve", async { spec.scope(today) }).await?;
        let range = scope.range()?;

        let (id, dir) = self.reserve_directory(&backup_id(spec, now)).await?;
        tracing::Span::current().record("backup_id", id.as_str());
        tracing::info!(range = %range, directory = %dir.display(), "Backup started");

        let mut builder = ManifestBuilder::new(&id, spec.backup_type(), scope);
        let files = match self.write_files(&id, &dir, range, &mut builder).await {
            Ok(files) => files,
            Err(e) => {
                self.discard(&dir).await;
                return Err(e.with_context("backup_id", &id));
            }
        };

        let archive = if spec.archives_old_data() {
            self.archive_step(today).await
        } else {
            ArchiveStep::Skipped
        };

        let manifest = match self.finish_manifest(&dir, files, archive, &mut builder).await {
            Ok(manifest) => manifest,
            Err(e) => {
                self.discard(&dir).await;
                return Err(e.with_context("backup_id", &id));
            }
        };

        let archive_path = if self.config.compress {
            self.compress_step(&id, &dir).await
        } else {
            None
        };

        Ok(CreatedBackup {
            manifest,
            directory: dir,
            archive: archive_path,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Create a fresh directory for `base`, suffixing `-1`, `-2`, ... when an
    /// earlier backup already took the id.
    async fn reserve_directory(&self, base: &str) -> Result<(String, PathBuf)> {
        tokio::fs::create_dir_all(&self.backup_root).await?;
        let mut attempt = 0u32;
        loop {
            let id = match attempt {
                0 => base.to_string(),
                n => format!("{}-{}", base, n),
            };
            attempt += 1;
            let dir = self.backup_root.join(&id);
            if tokio::fs::try_exists(self.archive_path(&id)).await? {
                continue;
            }
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Steps 2 and 3: the dump and the workbook.
    async fn write_files(
        &self,
        id: &str,
        dir: &Path,
        range: DateRange,
        builder: &mut ManifestBuilder,
    ) -> Result<WrittenFiles> {
        let sql_name = format!("{}.sql", id);
        let dump = run_step("dump", async {
            SqlDumpWriter::new(self.db.as_ref(), self.config.dump_batch_size)
                .write(&dir.join(&sql_name), id, range)
                .await
        })
        .await?;
        builder.add_file(dir, &sql_name).await?;

        let xlsx_name = format!("{}.xlsx", id);
        let report_rows = run_step("workbook", async {
            let filter = ReportFilter::new(range);
            let mut workbook = Workbook::new();
            for kind in BACKUP_SHEETS {
                workbook = workbook.with_sheet(self.renderer.build_sheet(kind, &filter).await?);
            }
            let rows = workbook.row_count() as u64;
            self.renderer.render_workbook(workbook, &dir.join(&xlsx_name)).await?;
            Ok(rows)
        })
        .await?;
        builder.add_file(dir, &xlsx_name).await?;

        Ok(WrittenFiles { dump, report_rows })
    }

    /// Step 4. Never fatal.
    async fn archive_step(&self, today: chrono::NaiveDate) -> ArchiveStep {
        let cutoff = cutoff_for_age(today, self.config.retention_months);
        let migrator = ArchiveMigrator::new(self.db.clone())
            .delete_live_rows(self.config.delete_live_rows_after_archive);
        let result = run_step("archive", async { migrator.archive_and_prune(cutoff).await }).await;
        match result {
            Ok((report, pruned)) => {
                if let Some(pruned) = pruned.filter(|p| !p.is_complete()) {
                    tracing::warn!(cutoff = %cutoff, failure = ?pruned.failure, "Live rows only partly pruned");
                }
                ArchiveStep::Completed(report)
            }
            Err(e) => {
                tracing::warn!(cutoff = %cutoff, error = %e, "Archive step failed, backup continues");
                ArchiveStep::Failed {
                    cutoff,
                    error: e.reason(),
                }
            }
        }
    }

    /// Step 5: statistics, then the manifest.
    async fn finish_manifest(
        &self,
        dir: &Path,
        files: WrittenFiles,
        archive: ArchiveStep,
        builder: &mut ManifestBuilder,
    ) -> Result<Manifest> {
        let statistics = run_step("statistics", async {
            let mut table_rows = BTreeMap::new();
            for table in self.db.list_tables().await? {
                let rows = self.db.count_rows(&table, None).await?;
                table_rows.insert(table, rows);
            }
            Ok(BackupStatistics {
                rows_dumped: files
                    .dump
                    .tables
                    .iter()
                    .map(|(table, dumped)| (table.clone(), dumped.rows))
                    .collect(),
                table_rows,
                database_size_bytes: self.db.database_size_bytes().await?,
                report_rows: files.report_rows,
                archive,
            })
        })
        .await?;
        builder.statistics(statistics);
        run_step("manifest", builder.write(dir)).await
    }

    /// Step 6. Never fatal.
    async fn compress_step(&self, id: &str, dir: &Path) -> Option<PathBuf> {
        let archive = self.archive_path(id);
        let source = dir.to_path_buf();
        let target = archive.clone();
        let result = run_step("compress", async move {
            tokio::task::spawn_blocking(move || compress::zip_dir(&source, &target)).await?
        })
        .await;
        match result {
            Ok(size) => {
                tracing::info!(archive = %archive.display(), size_bytes = size, "Backup compressed");
                Some(archive)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Compression failed, directory kept");
                None
            }
        }
    }

    async fn discard(&self, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            tracing::warn!(directory = %dir.display(), error = %e, "Could not remove partial backup");
        }
    }

    fn archive_path(&self, id: &str) -> PathBuf {
        self.backup_root.join(format!("{}.zip", id))
    }

    /// Every backup with a readable manifest, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        let mut found: BTreeMap<String, BackupEntry> = BTreeMap::new();
        if !tokio::fs::try_exists(&self.backup_root).await? {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&self.backup_root).await?;
        let mut zips = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                let manifest_path = path.join(MANIFEST_FILE);
                if !tokio::fs::try_exists(&manifest_path).await? {
                    continue;
                }
                match Manifest::load(&manifest_path).await {
                    Ok(manifest) => {
                        found.insert(
                            manifest.backup_id.clone(),
                            BackupEntry {
                                manifest,
                                directory: Some(path),
                                archive: None,
                            },
                        );
                    }
                    Err(e) => tracing::warn!(path = %manifest_path.display(), error = %e, "Skipping unreadable manifest"),
                }
            } else if path.extension().map_or(false, |ext| ext == "zip") {
                zips.push(path);
            }
        }

        for zip in zips {
            let Some(id) = zip.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if let Some(entry) = found.get_mut(&id) {
                entry.archive = Some(zip);
                continue;
            }
            match read_zipped_manifest(zip.clone()).await {
                Ok(Some(manifest)) => {
                    found.insert(
                        id,
                        BackupEntry {
                            manifest,
                            directory: None,
                            archive: Some(zip),
                        },
                    );
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(archive = %zip.display(), error = %e, "Skipping unreadable archive"),
            }
        }

        let mut backups: Vec<BackupEntry> = found.into_values().collect();
        backups.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()).then_with(|| b.backup_id().cmp(a.backup_id())));
        Ok(backups)
    }

    pub async fn get_backup(&self, id: &str) -> Result<BackupEntry> {
        validate_backup_id(id)?;
        let dir = self.backup_root.join(id);
        let archive = self.archive_path(id);
        let archive = tokio::fs::try_exists(&archive).await?.then_some(archive);

        let manifest_path = dir.join(MANIFEST_FILE);
        if tokio::fs::try_exists(&manifest_path).await? {
            return Ok(BackupEntry {
                manifest: Manifest::load(&manifest_path).await?,
                directory: Some(dir),
                archive,
            });
        }
        if let Some(zip) = archive {
            if let Some(manifest) = read_zipped_manifest(zip.clone()).await? {
                return Ok(BackupEntry {
                    manifest,
                    directory: None,
                    archive: Some(zip),
                });
            }
        }
        Err(RollcallError::backup_not_found(id))
    }

    /// Remove the directory and the zip of a backup.
    pub async fn delete_backup(&self, id: &str) -> Result<DeletedBackup> {
        validate_backup_id(id)?;
        let dir = self.backup_root.join(id);
        let archive = self.archive_path(id);
        let has_dir = tokio::fs::try_exists(&dir).await?;
        let has_archive = tokio::fs::try_exists(&archive).await?;
        if !has_dir && !has_archive {
            return Err(RollcallError::backup_not_found(id));
        }
        if has_dir {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        if has_archive {
            tokio::fs::remove_file(&archive).await?;
        }
        tracing::info!(backup_id = %id, directory = has_dir, archive = has_archive, "Backup deleted");
        Ok(DeletedBackup {
            directory: has_dir,
            archive: has_archive,
        })
    }

    /// Recompute every checksum listed in the manifest. Zip-only backups are
    /// extracted to a scratch directory first.
    pub async fn verify_backup(&self, id: &str) -> Result<VerificationReport> {
        validate_backup_id(id)?;
        let dir = self.backup_root.join(id);
        let manifest_path = dir.join(MANIFEST_FILE);
        if tokio::fs::try_exists(&manifest_path).await? {
            let manifest = Manifest::load(&manifest_path).await?;
            return manifest.verify(&dir).await;
        }

        let archive = self.archive_path(id);
        if !tokio::fs::try_exists(&archive).await? {
            return Err(RollcallError::backup_not_found(id));
        }
        let scratch = self.scratch_dir().await?;
        let dest = scratch.path().to_path_buf();
        tokio::task::spawn_blocking(move || compress::extract(&archive, &dest)).await??;
        let manifest_path = scratch.path().join(MANIFEST_FILE);
        if !tokio::fs::try_exists(&manifest_path).await? {
            return Err(RollcallError::new(
                ErrorCode::BackupFileMissing,
                format!("Archive of {} has no manifest", id),
            ));
        }
        let manifest = Manifest::load(&manifest_path).await?;
        manifest.verify(scratch.path()).await
    }

    pub fn restore_engine(&self) -> RestoreEngine {
        RestoreEngine::new(self.db.clone(), self.backup_root.clone())
            .with_mode(self.config.restore_mode)
            .verify_before_restore(self.config.verify_before_restore)
            .temp_dir(self.temp_dir.clone())
    }

    pub async fn restore_backup(&self, id: &str) -> Result<RestoreOutcome> {
        self.restore_engine().restore(id).await
    }

    /// Archive attendance older than `months`, pruning live rows when
    /// configured to.
    pub async fn archive_old_data(&self, months: u32) -> Result<(ArchiveReport, Option<PruneReport>)> {
        let cutoff = cutoff_for_age(super::spec::today(), months);
        ArchiveMigrator::new(self.db.clone())
            .delete_live_rows(self.config.delete_live_rows_after_archive)
            .archive_and_prune(cutoff)
            .await
    }

    async fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("rollcall-verify-");
            b
        };
        let dir = match &self.temp_dir {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

struct WrittenFiles {
    dump: DumpSummary,
    report_rows: u64,
}

/// Time a step, run it in its own span and tag failures with the step name.
async fn run_step<T, F>(step: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let timer = StepTimer::start(step);
    let result = fut.instrument(info_span!("backup_step", step)).await;
    let elapsed = timer.finish();
    match result {
        Ok(value) => {
            tracing::debug!(step, elapsed_ms = elapsed.as_millis() as u64, "Step finished");
            Ok(value)
        }
        Err(e) if e.code() == ErrorCode::BackupStepFailed => Err(e),
        Err(e) => Err(RollcallError::backup_step(step, e.reason()).with_source(e)),
    }
}

async fn read_zipped_manifest(archive: PathBuf) -> Result<Option<Manifest>> {
    let bytes = tokio::task::spawn_blocking(move || compress::read_entry(&archive, MANIFEST_FILE)).await??;
    bytes.map(|b| Manifest::from_slice(&b)).transpose()
}
