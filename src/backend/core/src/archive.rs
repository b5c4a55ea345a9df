//! Archive migration: copy aged attendance rows into archive tables.
//!
//! Copying is idempotent (insert-ignore on the source id). Deleting the
//! migrated rows from the live tables is a separate, explicit step that runs
//! table by table; a failure part-way leaves earlier tables pruned and later
//! ones untouched, and the [`PruneReport`] says which.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use crate::calendar;
use crate::db::schema::{ArchivePair, ARCHIVE_PAIRS};
use crate::db::Database;
use crate::error::{ErrorCode, Result, RollcallError};
use crate::telemetry::BackupMetrics;

/// Rows copied per live table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReport {
    pub cutoff: NaiveDate,
    pub archived_at: DateTime<Utc>,
    pub moved: BTreeMap<String, u64>,
}

impl ArchiveReport {
    pub fn total(&self) -> u64 {
        self.moved.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneFailure {
    pub table: String,
    pub error: String,
}

/// Rows deleted per live table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub cutoff: NaiveDate,
    pub deleted: BTreeMap<String, u64>,
    /// Set when pruning stopped early
    pub failure: Option<PruneFailure>,
}

impl PruneReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }

    pub fn total(&self) -> u64 {
        self.deleted.values().sum()
    }
}

/// Moves attendance rows older than a cutoff into archive tables.
#[derive(Clone)]
pub struct ArchiveMigrator {
    db: Arc<dyn Database>,
    pairs: &'static [ArchivePair],
    delete_live_rows: bool,
}

impl ArchiveMigrator {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            pairs: ARCHIVE_PAIRS,
            delete_live_rows: false,
        }
    }

    /// Also prune live rows in [`ArchiveMigrator::archive_and_prune`].
    pub fn delete_live_rows(mut self, enabled: bool) -> Self {
        self.delete_live_rows = enabled;
        self
    }

    /// Copy rows with `date < cutoff` into the archive tables.
    #[instrument(skip(self))]
    pub async fn archive(&self, cutoff: NaiveDate) -> Result<ArchiveReport> {
        let archived_at = Utc::now();
        let mut moved = BTreeMap::new();

        for pair in self.pairs {
            let copied = self.archive_pair(pair, cutoff, archived_at).await.map_err(|e| {
                RollcallError::with_internal(
                    ErrorCode::ArchiveFailed,
                    format!("Archiving {} failed", pair.source),
                    e.reason(),
                )
                .with_context("table", pair.source)
                .with_context("cutoff", cutoff)
                .with_source(e)
            })?;
            BackupMetrics::archived(pair.source, copied);
            tracing::info!(table = pair.source, archive = pair.archive, rows = copied, "Rows archived");
            moved.insert(pair.source.to_string(), copied);
        }

        Ok(ArchiveReport {
            cutoff,
            archived_at,
            moved,
        })
    }

    async fn archive_pair(&self, pair: &ArchivePair, cutoff: NaiveDate, archived_at: DateTime<Utc>) -> Result<u64> {
        self.db.ensure_archive_table(pair.source, pair.archive).await?;
        self.db
            .copy_to_archive(pair.source, pair.archive, pair.date_column, cutoff, archived_at)
            .await
    }

    /// Delete live rows with `date < cutoff` that are present in the archive.
    ///
    /// Runs table by table and stops at the first failure.
    #[instrument(skip(self))]
    pub async fn prune_live(&self, cutoff: NaiveDate) -> PruneReport {
        let mut report = PruneReport {
            cutoff,
            deleted: BTreeMap::new(),
            failure: None,
        };
        for pair in self.pairs {
            match self
                .db
                .delete_archived(pair.source, pair.archive, pair.date_column, cutoff)
                .await
            {
                Ok(deleted) => {
                    BackupMetrics::pruned(pair.source, deleted);
                    tracing::info!(table = pair.source, rows = deleted, "Live rows pruned");
                    report.deleted.insert(pair.source.to_string(), deleted);
                }
                Err(e) => {
                    tracing::error!(
                        table = pair.source,
                        error = %e,
                        pruned_tables = ?report.deleted.keys().collect::<Vec<_>>(),
                        "Pruning stopped part-way"
                    );
                    report.failure = Some(PruneFailure {
                        table: pair.source.to_string(),
                        error: e.reason(),
                    });
                    break;
                }
            }
        }
        report
    }

    /// Archive, then prune when configured to.
    pub async fn archive_and_prune(&self, cutoff: NaiveDate) -> Result<(ArchiveReport, Option<PruneReport>)> {
        let archived = self.archive(cutoff).await?;
        let pruned = if self.delete_live_rows {
            Some(self.prune_live(cutoff).await)
        } else {
            None
        };
        Ok((archived, pruned))
    }
}

/// First date kept live when data older than `months` is archived.
pub fn cutoff_for_age(today: NaiveDate, months: u32) -> NaiveDate {
    calendar::cutoff_for_age(today, months)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Row, SqlValue, SqliteDatabase};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    async fn seeded() -> Arc<SqliteDatabase> {
        let db = SqliteDatabase::with_school_schema().await.unwrap();
        for (id, date) in [(1, "2023-05-01"), (2, "2023-12-31"), (3, "2024-01-01"), (4, "2024-06-01")] {
            db.insert_row(
                "student_attendance",
                Row::new()
                    .with("id", id)
                    .with("student_id", 10)
                    .with("class_id", 1)
                    .with("date", SqlValue::Date(date.into()))
                    .with("status", "present"),
            )
            .await
            .unwrap();
        }
        db.insert_row(
            "teacher_attendance",
            Row::new()
                .with("id", 1)
                .with("teacher_id", 20)
                .with("date", SqlValue::Date("2023-03-03".into()))
                .with("status", "late"),
        )
        .await
        .unwrap();
        Arc::new(db)
    }

    #[tokio::test]
    async fn test_archive_is_idempotent() {
        let db = seeded().await;
        let migrator = ArchiveMigrator::new(db.clone());

        let first = migrator.archive(d(2024, 1, 1)).await.unwrap();
        assert_eq!(first.moved["student_attendance"], 2);
        assert_eq!(first.moved["teacher_attendance"], 1);

        let second = migrator.archive(d(2024, 1, 1)).await.unwrap();
        assert_eq!(second.total(), 0);
        let earlier = migrator.archive(d(2023, 6, 1)).await.unwrap();
        assert_eq!(earlier.total(), 0);

        assert_eq!(db.rows("student_attendance_archive").await.unwrap().len(), 2);
        assert_eq!(db.rows("student_attendance").await.unwrap().len(), 4);
        assert!(db.rows("student_attendance_archive").await.unwrap()[0].get("archived_at").is_some());
    }

    #[tokio::test]
    async fn test_prune_only_deletes_archived_rows() {
        let db = seeded().await;
        let migrator = ArchiveMigrator::new(db.clone());
        migrator.archive(d(2023, 6, 1)).await.unwrap();

        // Cutoff later than the archive's covers rows that were never copied.
        let report = migrator.prune_live(d(2024, 1, 1)).await;
        assert!(report.is_complete());
        assert_eq!(report.deleted["student_attendance"], 1);
        assert_eq!(db.rows("student_attendance").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_prune_stops_at_first_failure() {
        let db = seeded().await;
        let migrator = ArchiveMigrator::new(db.clone());
        migrator.archive(d(2024, 1, 1)).await.unwrap();
        db.make_unavailable("teacher_attendance");

        let report = migrator.prune_live(d(2024, 1, 1)).await;
        assert_eq!(report.deleted["student_attendance"], 2);
        let failure = report.failure.unwrap();
        assert_eq!(failure.table, "teacher_attendance");
        db.restore_table("teacher_attendance");
        assert_eq!(db.rows("teacher_attendance").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_archive_and_prune_respects_flag() {
        let db = seeded().await;
        let (_, pruned) = ArchiveMigrator::new(db.clone())
            .archive_and_prune(d(2024, 1, 1))
            .await
            .unwrap();
        assert!(pruned.is_none());
        assert_eq!(db.rows("student_attendance").await.unwrap().len(), 4);

        let (_, pruned) = ArchiveMigrator::new(db.clone())
            .delete_live_rows(true)
            .archive_and_prune(d(2024, 1, 1))
            .await
            .unwrap();
        assert_eq!(pruned.unwrap().total(), 3);
        assert_eq!(db.rows("student_attendance").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_archive_failure_names_table() {
        let db = seeded().await;
        db.make_unavailable("student_attendance");
        let err = ArchiveMigrator::new(db).archive(d(2024, 1, 1)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ArchiveFailed);
    }

    #[test]
    fn test_cutoff_for_age() {
        assert_eq!(cutoff_for_age(d(2025, 3, 31), 1), d(2025, 2, 28));
        assert_eq!(cutoff_for_age(d(2025, 3, 15), 12), d(2024, 3, 15));
    }
}
