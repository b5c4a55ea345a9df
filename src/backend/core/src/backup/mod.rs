//! Backups of the attendance database.
//!
//! - [`spec`]: what a backup covers and how its id is formed
//! - [`dump`]: the streaming SQL dump
//! - [`manifest`]: checksums, statistics and verification
//! - [`compress`]: zip packing and extraction
//! - [`orchestrator`]: the end-to-end create / list / verify / delete flow

pub mod compress;
pub mod dump;
pub mod manifest;
pub mod orchestrator;
pub mod spec;

pub use dump::{DumpSummary, DumpedTable, SqlDumpWriter};
pub use manifest::{
    sha256_file, ArchiveStep, BackupStatistics, FileCheck, FileStatus, Manifest, ManifestBuilder,
    VerificationReport, MANIFEST_FILE,
};
pub use orchestrator::{BackupEntry, BackupOrchestrator, CreatedBackup, DeletedBackup, BACKUP_SHEETS};
pub use spec::{backup_id, validate_backup_id, BackupScope, BackupSpec, BackupType, Schedule};
