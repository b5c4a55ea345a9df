//! Integration tests for restoring backups.
//!
//! Tests cover:
//! - Round trip of a full backup into an empty database
//! - Fallback to the zip when the directory copy is gone
//! - Partial versus atomic replay
//! - Integrity checks before replay

mod common;

use chrono::{DateTime, TimeZone, Utc};
use rollcall_core::backup::{BackupOrchestrator, BackupSpec, CreatedBackup};
use rollcall_core::db::{schema, Row, SqliteDatabase};
use rollcall_core::error::ErrorCode;
use rollcall_core::restore::{RestoreEngine, RestoreMode, RestoreSource};
use std::path::Path;
use std::sync::Arc;

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 18, 0, 0).unwrap()
}

async fn full_backup(root: &Path, compress: bool) -> (Arc<SqliteDatabase>, BackupOrchestrator, CreatedBackup) {
    let db = common::school().await;
    let orch = BackupOrchestrator::new(db.clone(), &common::storage(root), common::backup_config(compress));
    let created = orch
        .create_backup_at(&BackupSpec::scheduled("full"), at(2025, 1, 15))
        .await
        .unwrap();
    (db, orch, created)
}

fn engine(target: Arc<SqliteDatabase>, orch: &BackupOrchestrator) -> RestoreEngine {
    RestoreEngine::new(target, orch.backup_root()).temp_dir(Some(orch.backup_root().join("..").join("tmp")))
}

fn append_to_dump(created: &CreatedBackup, extra: &str) {
    let path = created.directory.join(format!("{}.sql", created.manifest.backup_id));
    let mut sql = std::fs::read_to_string(&path).unwrap();
    sql.push_str(extra);
    std::fs::write(&path, sql).unwrap();
}

// ============================================================================
// Round Trip
// ============================================================================

#[tokio::test]
async fn test_full_backup_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let (source, orch, created) = full_backup(root.path(), false).await;

    let target = Arc::new(SqliteDatabase::in_memory().await.unwrap());
    let outcome = engine(target.clone(), &orch)
        .restore(&created.manifest.backup_id)
        .await
        .unwrap();

    assert!(outcome.is_complete(), "{}", outcome.summary());
    assert!(outcome.verified);
    assert_eq!(outcome.source, RestoreSource::Directory);
    assert_eq!(outcome.mode, RestoreMode::Partial);
    assert!(outcome.statements_total > 0);

    for table in [
        schema::USERS,
        schema::CLASSES,
        schema::SUBJECTS,
        schema::STUDENT_ATTENDANCE,
        schema::TEACHER_ATTENDANCE,
        schema::PERMISSION_REQUESTS,
    ] {
        assert_eq!(
            target.rows(table).await.unwrap(),
            source.rows(table).await.unwrap(),
            "table {}",
            table
        );
    }
}

#[tokio::test]
async fn test_restore_replaces_existing_rows() {
    let root = tempfile::tempdir().unwrap();
    let (source, orch, created) = full_backup(root.path(), false).await;

    // Drift after the backup: an extra class and an extra attendance row.
    let target = common::school().await;
    target
        .insert_row(schema::CLASSES, Row::new().with("id", 2).with("name", "8B"))
        .await
        .unwrap();
    target
        .insert_row(
            schema::STUDENT_ATTENDANCE,
            Row::new()
                .with("id", 99)
                .with("student_id", 1)
                .with("class_id", 2)
                .with("date", common::date("2025-01-20"))
                .with("status", "present"),
        )
        .await
        .unwrap();

    let outcome = engine(target.clone(), &orch)
        .restore(&created.manifest.backup_id)
        .await
        .unwrap();
    assert!(outcome.is_complete());
    assert_eq!(
        target.rows(schema::CLASSES).await.unwrap(),
        source.rows(schema::CLASSES).await.unwrap()
    );
    assert_eq!(
        target.rows(schema::STUDENT_ATTENDANCE).await.unwrap(),
        source.rows(schema::STUDENT_ATTENDANCE).await.unwrap()
    );
}

// ============================================================================
// Zip Fallback
// ============================================================================

#[tokio::test]
async fn test_restore_falls_back_to_zip() {
    let root = tempfile::tempdir().unwrap();
    let (source, orch, created) = full_backup(root.path(), true).await;
    assert!(created.archive.is_some());
    std::fs::remove_dir_all(&created.directory).unwrap();

    let target = Arc::new(SqliteDatabase::in_memory().await.unwrap());
    let outcome = engine(target.clone(), &orch)
        .restore(&created.manifest.backup_id)
        .await
        .unwrap();

    assert_eq!(outcome.source, RestoreSource::Archive);
    assert!(outcome.verified);
    assert!(outcome.is_complete());
    assert_eq!(
        target.rows(schema::STUDENT_ATTENDANCE).await.unwrap(),
        source.rows(schema::STUDENT_ATTENDANCE).await.unwrap()
    );

    let scratch = root.path().join("tmp");
    assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
}

#[tokio::test]
async fn test_missing_backup() {
    let root = tempfile::tempdir().unwrap();
    let (_, orch, _) = full_backup(root.path(), false).await;
    let err = orch.restore_backup("scheduled-20000101-000000000").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::BackupNotFound);
}

// ============================================================================
// Replay Modes
// ============================================================================

const BROKEN_TAIL: &str = "INSERT INTO \"no_such_table\" (\"id\") VALUES\n(1);\n";

#[tokio::test]
async fn test_partial_restore_reports_failures_and_continues() {
    let root = tempfile::tempdir().unwrap();
    let (source, orch, created) = full_backup(root.path(), false).await;
    append_to_dump(&created, BROKEN_TAIL);

    let target = Arc::new(SqliteDatabase::in_memory().await.unwrap());
    let outcome = engine(target.clone(), &orch)
        .verify_before_restore(false)
        .restore(&created.manifest.backup_id)
        .await
        .unwrap();

    assert!(!outcome.verified);
    assert!(!outcome.is_complete());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].index, outcome.statements_total);
    assert!(outcome.failures[0].statement.contains("no_such_table"));
    assert_eq!(outcome.statements_executed, outcome.statements_total - 1);
    assert_eq!(
        target.rows(schema::USERS).await.unwrap(),
        source.rows(schema::USERS).await.unwrap()
    );
}

#[tokio::test]
async fn test_atomic_restore_is_all_or_nothing() {
    let root = tempfile::tempdir().unwrap();
    let (_, orch, created) = full_backup(root.path(), false).await;
    append_to_dump(&created, BROKEN_TAIL);

    let target = Arc::new(SqliteDatabase::in_memory().await.unwrap());
    let err = engine(target.clone(), &orch)
        .verify_before_restore(false)
        .with_mode(RestoreMode::Atomic)
        .restore(&created.manifest.backup_id)
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::RestoreFailed);
    assert!(!target.has_table(schema::USERS).await.unwrap());
}

// ============================================================================
// Integrity
// ============================================================================

#[tokio::test]
async fn test_tampered_dump_is_not_replayed() {
    let root = tempfile::tempdir().unwrap();
    let (_, orch, created) = full_backup(root.path(), false).await;
    append_to_dump(&created, BROKEN_TAIL);

    let target = Arc::new(SqliteDatabase::in_memory().await.unwrap());
    let err = engine(target.clone(), &orch)
        .restore(&created.manifest.backup_id)
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::BackupIntegrityFailed);
    assert!(!target.has_table(schema::USERS).await.unwrap());
}
