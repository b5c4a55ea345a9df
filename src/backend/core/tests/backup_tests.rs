//! Integration tests for backup creation and management.
//!
//! Tests cover:
//! - Semester, date-range and scheduled backups
//! - Manifest contents and checksum verification
//! - Non-fatal archive step
//! - Cleanup after a failed step
//! - Compressed backups, listing and deletion

mod common;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rollcall_core::backup::{
    compress, ArchiveStep, BackupOrchestrator, BackupSpec, BackupType, FileStatus, Manifest, MANIFEST_FILE,
};
use rollcall_core::calendar::Semester;
use rollcall_core::error::ErrorCode;
use std::sync::Arc;

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).unwrap()
}

fn orchestrator(db: Arc<rollcall_core::db::SqliteDatabase>, root: &std::path::Path, compress: bool) -> BackupOrchestrator {
    BackupOrchestrator::new(db, &common::storage(root), common::backup_config(compress))
}

// ============================================================================
// Creation
// ============================================================================

#[tokio::test]
async fn test_semester_backup_contents() {
    let root = tempfile::tempdir().unwrap();
    let db = common::school().await;
    let orch = orchestrator(db.clone(), root.path(), false);

    let created = orch
        .create_backup_at(&BackupSpec::semester(Semester::Ganjil, 2024), at(2025, 1, 15))
        .await
        .unwrap();
    let manifest = &created.manifest;
    let id = manifest.backup_id.clone();

    assert_eq!(manifest.backup_type, BackupType::Semester);
    assert_eq!(manifest.scope.start_date, NaiveDate::from_ymd_opt(2024, 7, 1).unwrap());
    assert_eq!(manifest.scope.end_date, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
    assert_eq!(manifest.scope.semester, Some(Semester::Ganjil));

    let stats = &manifest.statistics;
    assert_eq!(stats.rows_dumped["student_attendance"], 3);
    assert_eq!(stats.rows_dumped["teacher_attendance"], 1);
    assert_eq!(stats.rows_dumped["permission_requests"], 1);
    assert_eq!(stats.rows_dumped["users"], 3);
    assert_eq!(stats.table_rows["student_attendance"], 5);
    assert!(stats.report_rows > 0);

    match &stats.archive {
        ArchiveStep::Completed(report) => {
            assert_eq!(report.cutoff, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
            assert_eq!(report.moved["student_attendance"], 2);
            assert_eq!(report.moved["teacher_attendance"], 1);
        }
        other => panic!("archive step should have completed, got {:?}", other),
    }
    // live rows stay unless pruning is enabled
    assert_eq!(db.rows("student_attendance").await.unwrap().len(), 5);

    let dir = root.path().join("backups").join(&id);
    for name in [format!("{}.sql", id), format!("{}.xlsx", id), MANIFEST_FILE.to_string()] {
        assert!(dir.join(&name).is_file(), "{} missing", name);
    }
    let on_disk = Manifest::load(&dir.join(MANIFEST_FILE)).await.unwrap();
    assert_eq!(&on_disk, manifest);
    assert_eq!(on_disk.checksums.len(), 2);

    let sql = std::fs::read_to_string(dir.join(format!("{}.sql", id))).unwrap();
    assert!(sql.contains("-- Table: users"));
    assert!(sql.contains("'Ani O''Hara'"));
    assert!(!sql.contains("2023-02-14"));
}

#[tokio::test]
async fn test_date_range_backup_never_archives() {
    let root = tempfile::tempdir().unwrap();
    let db = common::school().await;
    let orch = orchestrator(db.clone(), root.path(), false);
    let spec = BackupSpec::date_range(
        NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 8, 31).unwrap(),
    );

    let created = orch.create_backup_at(&spec, at(2025, 1, 15)).await.unwrap();
    assert!(created.manifest.backup_id.starts_with("range-"));
    assert_eq!(created.manifest.statistics.archive, ArchiveStep::Skipped);
    assert_eq!(created.manifest.statistics.rows_dumped["student_attendance"], 2);
    assert!(!db.has_table("student_attendance_archive").await.unwrap());
}

#[tokio::test]
async fn test_invalid_range_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let orch = orchestrator(common::school().await, root.path(), false);
    let spec = BackupSpec::date_range(
        NaiveDate::from_ymd_opt(2024, 9, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(),
    );
    assert!(orch.create_backup_at(&spec, at(2025, 1, 15)).await.is_err());
    assert!(orch.list_backups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_archive_failure_does_not_fail_backup() {
    let root = tempfile::tempdir().unwrap();
    let db = common::school().await;
    db.make_unavailable("student_attendance_archive");
    let orch = orchestrator(db, root.path(), false);

    let created = orch
        .create_backup_at(&BackupSpec::scheduled("weekly"), at(2025, 1, 15))
        .await
        .unwrap();
    match &created.manifest.statistics.archive {
        ArchiveStep::Failed { cutoff, error } => {
            assert_eq!(*cutoff, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
            assert!(error.contains("student_attendance"));
        }
        other => panic!("archive step should have failed, got {:?}", other),
    }
    assert!(orch.verify_backup(&created.manifest.backup_id).await.unwrap().is_ok());
}

#[tokio::test]
async fn test_failed_dump_leaves_no_manifest() {
    let root = tempfile::tempdir().unwrap();
    let db = common::school().await;
    db.make_unavailable("permission_requests");
    let orch = orchestrator(db, root.path(), true);

    let err = orch
        .create_backup_at(&BackupSpec::scheduled("full"), at(2025, 1, 15))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BackupStepFailed);

    let leftovers: Vec<_> = std::fs::read_dir(orch.backup_root()).unwrap().collect();
    assert!(leftovers.is_empty());
    assert!(orch.list_backups().await.unwrap().is_empty());
}

// ============================================================================
// Verification
// ============================================================================

#[tokio::test]
async fn test_verify_detects_tampering() {
    let root = tempfile::tempdir().unwrap();
    let orch = orchestrator(common::school().await, root.path(), false);
    let created = orch
        .create_backup_at(&BackupSpec::scheduled("monthly"), at(2025, 1, 15))
        .await
        .unwrap();
    let id = created.manifest.backup_id;
    let sql_path = created.directory.join(format!("{}.sql", id));

    let mut sql = std::fs::read_to_string(&sql_path).unwrap();
    sql.push_str("-- edited by hand\n");
    std::fs::write(&sql_path, sql).unwrap();
    std::fs::remove_file(created.directory.join(format!("{}.xlsx", id))).unwrap();

    let report = orch.verify_backup(&id).await.unwrap();
    assert!(!report.is_ok());
    let statuses: Vec<_> = report.files.iter().map(|f| f.status.clone()).collect();
    assert!(matches!(statuses[0], FileStatus::Mismatch { .. }));
    assert_eq!(statuses[1], FileStatus::Missing);
    assert_eq!(report.failures().count(), 2);
}

// ============================================================================
// Compression, Listing and Deletion
// ============================================================================

#[tokio::test]
async fn test_compressed_backup_lifecycle() {
    let root = tempfile::tempdir().unwrap();
    let orch = orchestrator(common::school().await, root.path(), true);

    let older = orch
        .create_backup_at(&BackupSpec::semester(Semester::Genap, 2024), at(2025, 1, 15))
        .await
        .unwrap();
    let newer = orch
        .create_backup_at(&BackupSpec::semester(Semester::Ganjil, 2024), at(2025, 1, 16))
        .await
        .unwrap();

    let zip = newer.archive.clone().unwrap();
    assert_eq!(zip, orch.backup_root().join(format!("{}.zip", newer.manifest.backup_id)));
    for name in &newer.manifest.files {
        assert!(compress::contains_entry(&zip, name).unwrap());
    }
    assert!(compress::contains_entry(&zip, MANIFEST_FILE).unwrap());

    let listed = orch.list_backups().await.unwrap();
    let ids: Vec<_> = listed.iter().map(|b| b.backup_id().to_string()).collect();
    assert_eq!(ids, vec![newer.manifest.backup_id.clone(), older.manifest.backup_id.clone()]);
    assert!(listed.iter().all(|b| b.directory.is_some() && b.archive.is_some()));

    // Only the zip remains for the older backup.
    std::fs::remove_dir_all(&older.directory).unwrap();
    let entry = orch.get_backup(&older.manifest.backup_id).await.unwrap();
    assert!(entry.directory.is_none());
    assert_eq!(entry.manifest.backup_id, older.manifest.backup_id);
    assert!(orch.verify_backup(&older.manifest.backup_id).await.unwrap().is_ok());

    let deleted = orch.delete_backup(&older.manifest.backup_id).await.unwrap();
    assert!(!deleted.directory && deleted.archive);
    assert_eq!(orch.list_backups().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_listing_skips_incomplete_directories() {
    let root = tempfile::tempdir().unwrap();
    let orch = orchestrator(common::school().await, root.path(), false);
    orch.create_backup_at(&BackupSpec::scheduled("daily"), at(2025, 1, 15))
        .await
        .unwrap();

    std::fs::create_dir_all(orch.backup_root().join("scheduled-19990101-000000000")).unwrap();
    std::fs::write(orch.backup_root().join("notes.txt"), "not a backup").unwrap();

    assert_eq!(orch.list_backups().await.unwrap().len(), 1);
    assert_eq!(
        orch.get_backup("scheduled-19990101-000000000").await.unwrap_err().code(),
        ErrorCode::BackupNotFound
    );
}

// ============================================================================
// Archiving
// ============================================================================

#[tokio::test]
async fn test_archive_old_data_with_pruning() {
    let root = tempfile::tempdir().unwrap();
    let db = common::school().await;
    let mut config = common::backup_config(false);
    config.delete_live_rows_after_archive = true;
    let orch = BackupOrchestrator::new(db.clone(), &common::storage(root.path()), config);

    // A zero-month horizon archives everything dated before today.
    let (archived, pruned) = orch.archive_old_data(0).await.unwrap();
    assert_eq!(archived.moved["student_attendance"], 5);
    assert_eq!(archived.moved["teacher_attendance"], 2);

    let pruned = pruned.unwrap();
    assert!(pruned.is_complete());
    assert_eq!(pruned.total(), 7);
    assert!(db.rows("student_attendance").await.unwrap().is_empty());
    assert_eq!(db.rows("student_attendance_archive").await.unwrap().len(), 5);
}
