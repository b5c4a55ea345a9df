//! Restore engine: locate a backup's dump and replay it.
//!
//! Two replay modes:
//!
//! - [`RestoreMode::Partial`]: every statement runs on its own; failures are
//!   collected and replay continues
//! - [`RestoreMode::Atomic`]: all statements in one transaction; any failure
//!   rolls everything back and fails the restore

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{info_span, Instrument};

use crate::backup::compress;
use crate::backup::manifest::{Manifest, MANIFEST_FILE};
use crate::backup::spec::validate_backup_id;
use crate::db::Database;
use crate::error::{ErrorCode, Result, RollcallError};
use crate::telemetry::BackupMetrics;

/// Characters of a failed statement kept in the outcome.
const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Best effort, statement by statement
    #[default]
    Partial,
    /// All or nothing
    Atomic,
}

impl fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Partial => f.write_str("partial"),
            Self::Atomic => f.write_str("atomic"),
        }
    }
}

impl std::str::FromStr for RestoreMode {
    type Err = RollcallError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "partial" => Ok(Self::Partial),
            "atomic" => Ok(Self::Atomic),
            other => Err(RollcallError::validation(format!("unknown restore mode '{}'", other))),
        }
    }
}

/// Where the dump was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    Directory,
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementFailure {
    /// 1-based position in the dump
    pub index: usize,
    pub statement: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub backup_id: String,
    pub source: RestoreSource,
    pub mode: RestoreMode,
    /// Whether checksums were verified before replay
    pub verified: bool,
    pub statements_total: usize,
    pub statements_executed: usize,
    pub failures: Vec<StatementFailure>,
    pub duration_ms: u64,
}

impl RestoreOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.statements_executed == self.statements_total
    }

    pub fn summary(&self) -> String {
        let source = match self.source {
            RestoreSource::Directory => "directory",
            RestoreSource::Archive => "zip archive",
        };
        if self.is_complete() {
            format!(
                "Restored {} from {}: {} statements executed in {} ms",
                self.backup_id, source, self.statements_executed, self.duration_ms
            )
        } else {
            format!(
                "Restored {} from {} with errors: {} of {} statements executed, {} failed (first: statement {}: {})",
                self.backup_id,
                source,
                self.statements_executed,
                self.statements_total,
                self.failures.len(),
                self.failures[0].index,
                self.failures[0].reason
            )
        }
    }
}

/// A dump ready for replay. Holds the extraction directory, if any, so it is
/// removed when this value is dropped.
#[derive(Debug)]
pub struct LocatedDump {
    pub source: RestoreSource,
    pub dump_path: PathBuf,
    pub dir: PathBuf,
    _extracted: Option<TempDir>,
}

/// Replays backups against the database.
#[derive(Clone)]
pub struct RestoreEngine {
    db: Arc<dyn Database>,
    backup_root: PathBuf,
    temp_root: Option<PathBuf>,
    mode: RestoreMode,
    verify: bool,
}

impl RestoreEngine {
    pub fn new(db: Arc<dyn Database>, backup_root: impl Into<PathBuf>) -> Self {
        Self {
            db,
            backup_root: backup_root.into(),
            temp_root: None,
            mode: RestoreMode::default(),
            verify: true,
        }
    }

    pub fn with_mode(mut self, mode: RestoreMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn verify_before_restore(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Parent directory for extracted archives; the system temp dir if unset.
    pub fn temp_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.temp_root = dir;
        self
    }

    pub fn mode(&self) -> RestoreMode {
        self.mode
    }

    pub async fn restore(&self, backup_id: &str) -> Result<RestoreOutcome> {
        let span = info_span!("restore", backup_id = %backup_id, mode = %self.mode);
        async {
            let started = Instant::now();
            let result = self.restore_inner(backup_id, started).await;
            match &result {
                Ok(outcome) => {
                    BackupMetrics::restore_finished(
                        outcome.is_complete(),
                        outcome.statements_executed as u64,
                        outcome.failures.len() as u64,
                    );
                    if outcome.is_complete() {
                        tracing::info!(summary = %outcome.summary(), "Restore finished");
                    } else {
                        tracing::warn!(summary = %outcome.summary(), "Restore finished with failures");
                    }
                }
                Err(e) => {
                    BackupMetrics::restore_finished(false, 0, 0);
                    e.log();
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn restore_inner(&self, backup_id: &str, started: Instant) -> Result<RestoreOutcome> {
        let located = self.locate(backup_id).await?;
        tracing::info!(source = ?located.source, dump = %located.dump_path.display(), "Backup located");

        let verified = self.check_integrity(backup_id, &located.dir).await?;
        let sql = tokio::fs::read_to_string(&located.dump_path).await?;
        let statements = split_statements(&sql);

        let (executed, failures) = match self.mode {
            RestoreMode::Partial => self.replay_partial(&statements).await,
            RestoreMode::Atomic => {
                self.db.execute_atomic(&statements).await.map_err(|e| {
                    RollcallError::with_internal(
                        ErrorCode::RestoreFailed,
                        format!("Restore of {} was rolled back", backup_id),
                        e.reason(),
                    )
                    .with_source(e)
                })?;
                (statements.len(), Vec::new())
            }
        };

        Ok(RestoreOutcome {
            backup_id: backup_id.to_string(),
            source: located.source,
            mode: self.mode,
            verified,
            statements_total: statements.len(),
            statements_executed: executed,
            failures,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Find the dump: the backup directory first, then `{id}.zip`.
    pub async fn locate(&self, backup_id: &str) -> Result<LocatedDump> {
        validate_backup_id(backup_id)?;
        let dump_name = format!("{}.sql", backup_id);

        let dir = self.backup_root.join(backup_id);
        let dump_path = dir.join(&dump_name);
        if tokio::fs::try_exists(&dump_path).await? {
            return Ok(LocatedDump {
                source: RestoreSource::Directory,
                dump_path,
                dir,
                _extracted: None,
            });
        }

        let archive = self.backup_root.join(format!("{}.zip", backup_id));
        if !tokio::fs::try_exists(&archive).await? {
            return Err(RollcallError::backup_not_found(backup_id));
        }

        let temp = match &self.temp_root {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                tempfile::Builder::new().prefix("rollcall-restore-").tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("rollcall-restore-").tempdir()?,
        };
        let dest = temp.path().to_path_buf();
        let source = archive.clone();
        tokio::task::spawn_blocking(move || compress::extract(&source, &dest)).await??;

        let dump_path = temp.path().join(&dump_name);
        if !tokio::fs::try_exists(&dump_path).await? {
            return Err(RollcallError::new(
                ErrorCode::BackupFileMissing,
                format!("Archive {} does not contain {}", archive.display(), dump_name),
            ));
        }
        Ok(LocatedDump {
            source: RestoreSource::Archive,
            dump_path,
            dir: temp.path().to_path_buf(),
            _extracted: Some(temp),
        })
    }

    async fn check_integrity(&self, backup_id: &str, dir: &Path) -> Result<bool> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !self.verify || !tokio::fs::try_exists(&manifest_path).await? {
            return Ok(false);
        }
        let manifest = Manifest::load(&manifest_path).await?;
        if manifest.backup_id != backup_id {
            return Err(RollcallError::new(
                ErrorCode::BackupIntegrityFailed,
                format!("Manifest belongs to {}, not {}", manifest.backup_id, backup_id),
            ));
        }
        manifest.verify(dir).await?.into_result()?;
        Ok(true)
    }

    async fn replay_partial(&self, statements: &[String]) -> (usize, Vec<StatementFailure>) {
        let mut executed = 0;
        let mut failures = Vec::new();
        for (i, statement) in statements.iter().enumerate() {
            match self.db.execute(statement).await {
                Ok(_) => executed += 1,
                Err(e) => {
                    let failure = StatementFailure {
                        index: i + 1,
                        statement: preview(statement),
                        reason: e.reason(),
                    };
                    let err = RollcallError::restore_statement(failure.index, failure.reason.clone());
                    tracing::warn!(
                        index = failure.index,
                        statement = %failure.statement,
                        error = %err,
                        "Statement failed, continuing"
                    );
                    failures.push(failure);
                }
            }
        }
        (executed, failures)
    }
}

/// Split a dump into statements.
///
/// A statement ends at a line whose trimmed text ends with `;`. Blank lines
/// and `--` comment lines are skipped. A trailing statement without `;` is
/// kept.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
        if trimmed.ends_with(';') {
            statements.push(std::mem::take(&mut current).trim().to_string());
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        statements.push(rest.to_string());
    }
    statements
}

fn preview(statement: &str) -> String {
    let flat = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > PREVIEW_CHARS {
        let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", cut)
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::SqlDumpWriter;
    use crate::calendar::DateRange;
    use crate::db::{SqlValue, SqliteDatabase};
    use chrono::NaiveDate;

    const DUMP: &str = "-- header\n\nDROP TABLE IF EXISTS \"t\";\nCREATE TABLE \"t\" (\n  \"id\" BIGINT NOT NULL,\n  PRIMARY KEY (\"id\")\n);\nINSERT INTO \"t\" (\"id\") VALUES\n(1),\n(2);\n";

    #[test]
    fn test_split_statements() {
        let statements = split_statements(DUMP);
        assert_eq!(statements.len(), 3);
        assert!(statements[1].starts_with("CREATE TABLE"));
        assert!(statements[1].ends_with(");"));
        assert_eq!(statements[2], "INSERT INTO \"t\" (\"id\") VALUES\n(1),\n(2);");

        assert_eq!(split_statements("SELECT 1"), vec!["SELECT 1"]);
        assert!(split_statements("-- only\n\n").is_empty());
    }

    #[test]
    fn test_preview_truncates() {
        let long = format!("INSERT INTO t VALUES ({})", "1, ".repeat(100));
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
    }

    fn write_backup(root: &Path, id: &str, sql: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}.sql", id)), sql).unwrap();
    }

    #[tokio::test]
    async fn test_partial_restore_continues_after_failure() {
        let root = tempfile::tempdir().unwrap();
        let sql = format!("{}SELECT broken;\nINSERT INTO \"t\" (\"id\") VALUES\n(3);\n", DUMP);
        write_backup(root.path(), "range-1", &sql);

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let outcome = RestoreEngine::new(db.clone(), root.path()).restore("range-1").await.unwrap();

        assert_eq!(outcome.source, RestoreSource::Directory);
        assert_eq!(outcome.statements_total, 5);
        assert_eq!(outcome.statements_executed, 4);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 4);
        assert!(!outcome.is_complete());
        assert!(outcome.summary().contains("1 failed"));
        assert_eq!(db.rows("t").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_atomic_restore_rolls_back() {
        let root = tempfile::tempdir().unwrap();
        let sql = format!("{}INSERT INTO \"t\" (\"id\") VALUES\n(1);\n", DUMP);
        write_backup(root.path(), "range-2", &sql);

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let err = RestoreEngine::new(db.clone(), root.path())
            .with_mode(RestoreMode::Atomic)
            .restore("range-2")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RestoreFailed);
        assert!(!db.has_table("t").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_backup() {
        let root = tempfile::tempdir().unwrap();
        let engine = RestoreEngine::new(Arc::new(SqliteDatabase::in_memory().await.unwrap()), root.path());
        assert_eq!(engine.restore("nope").await.unwrap_err().code(), ErrorCode::BackupNotFound);
        assert_eq!(engine.restore("../x").await.unwrap_err().code(), ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_restore_from_zip_removes_extraction() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let temp_root = root.path().join("tmp");
        write_backup(staging.path(), "range-3", DUMP);
        compress::zip_dir(&staging.path().join("range-3"), &root.path().join("range-3.zip")).unwrap();
        // directory present but without its dump
        std::fs::create_dir(root.path().join("range-3")).unwrap();

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let outcome = RestoreEngine::new(db.clone(), root.path())
            .temp_dir(Some(temp_root.clone()))
            .restore("range-3")
            .await
            .unwrap();

        assert_eq!(outcome.source, RestoreSource::Archive);
        assert!(outcome.is_complete());
        assert_eq!(db.rows("t").await.unwrap().len(), 2);
        assert_eq!(std::fs::read_dir(&temp_root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_defaults_and_indexes_survive_round_trip() {
        let source = SqliteDatabase::in_memory().await.unwrap();
        source
            .execute(r#"CREATE TABLE "notices" ("id" INTEGER PRIMARY KEY, "slug" TEXT NOT NULL UNIQUE, "status" TEXT NOT NULL DEFAULT 'draft');"#)
            .await
            .unwrap();
        source
            .execute(r#"CREATE INDEX "notices_status_idx" ON "notices" ("status");"#)
            .await
            .unwrap();
        source
            .execute(r#"INSERT INTO "notices" ("slug") VALUES ('libur'), ('ujian');"#)
            .await
            .unwrap();

        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("full-1");
        std::fs::create_dir_all(&dir).unwrap();
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        )
        .unwrap();
        SqlDumpWriter::new(&source, 100)
            .write(&dir.join("full-1.sql"), "full-1", range)
            .await
            .unwrap();

        let target = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let outcome = RestoreEngine::new(target.clone(), root.path()).restore("full-1").await.unwrap();
        assert!(outcome.is_complete(), "{}", outcome.summary());
        assert_eq!(
            target.table_ddl("notices").await.unwrap(),
            source.table_ddl("notices").await.unwrap()
        );

        // the default, the id sequence and the unique constraint still apply
        target
            .execute(r#"INSERT INTO "notices" ("slug") VALUES ('rapat');"#)
            .await
            .unwrap();
        let rows = target.rows("notices").await.unwrap();
        assert_eq!(rows[2].value("id"), SqlValue::Int(3));
        assert_eq!(rows[2].value("status"), SqlValue::text("draft"));
        assert!(target
            .execute(r#"INSERT INTO "notices" ("slug") VALUES ('libur');"#)
            .await
            .is_err());
    }
}
