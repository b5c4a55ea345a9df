//! Backup manifest: file list, SHA-256 checksums and a statistics snapshot.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use super::spec::{BackupScope, BackupType};
use crate::archive::ArchiveReport;
use crate::error::{ErrorCode, ErrorContext, Result, RollcallError};

pub const MANIFEST_FILE: &str = "manifest.json";

const HASH_CHUNK: usize = 64 * 1024;

/// Stream a file through SHA-256 and return the lowercase hex digest.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Outcome of the archive step, as recorded in the statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArchiveStep {
    /// Date-range backups never archive
    Skipped,
    Completed(ArchiveReport),
    Failed { cutoff: NaiveDate, error: String },
}

impl Default for ArchiveStep {
    fn default() -> Self {
        Self::Skipped
    }
}

/// Statistics snapshot taken while the backup was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupStatistics {
    /// Rows written to the dump, per table
    pub rows_dumped: BTreeMap<String, u64>,
    /// Live row counts per table
    pub table_rows: BTreeMap<String, u64>,
    pub database_size_bytes: u64,
    /// Data rows across the workbook's sheets
    pub report_rows: u64,
    #[serde(default)]
    pub archive: ArchiveStep,
}

impl BackupStatistics {
    pub fn total_rows_dumped(&self) -> u64 {
        self.rows_dumped.values().sum()
    }
}

/// The persisted manifest of one backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub scope: BackupScope,
    pub timestamp: DateTime<Utc>,
    pub files: Vec<String>,
    pub statistics: BackupStatistics,
    pub checksums: BTreeMap<String, String>,
}

impl Manifest {
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).with_error_code(ErrorCode::BackupIntegrityFailed)
    }

    /// Recompute every listed file's checksum against `dir`.
    pub async fn verify(&self, dir: &Path) -> Result<VerificationReport> {
        let mut files = Vec::with_capacity(self.files.len());
        for name in &self.files {
            let expected = self.checksums.get(name).cloned().unwrap_or_default();
            let path = dir.join(name);
            let status = if !tokio::fs::try_exists(&path).await? {
                FileStatus::Missing
            } else {
                let actual = sha256_file(&path).await?;
                if actual == expected {
                    FileStatus::Ok
                } else {
                    FileStatus::Mismatch { expected, actual }
                }
            };
            files.push(FileCheck {
                name: name.clone(),
                status,
            });
        }
        Ok(VerificationReport {
            backup_id: self.backup_id.clone(),
            files,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Ok,
    Mismatch { expected: String, actual: String },
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheck {
    pub name: String,
    #[serde(flatten)]
    pub status: FileStatus,
}

/// Per-file result of [`Manifest::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub backup_id: String,
    pub files: Vec<FileCheck>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.files.iter().all(|f| f.status == FileStatus::Ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileCheck> {
        self.files.iter().filter(|f| f.status != FileStatus::Ok)
    }

    /// Error describing the failed files, if any.
    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            return Ok(self);
        }
        let failed: Vec<String> = self.failures().map(|f| f.name.clone()).collect();
        Err(RollcallError::new(
            ErrorCode::BackupIntegrityFailed,
            format!("Backup {} failed verification", self.backup_id),
        )
        .with_context("files", failed))
    }
}

/// Collects files and statistics, then writes `manifest.json` last.
pub struct ManifestBuilder {
    backup_id: String,
    backup_type: BackupType,
    scope: BackupScope,
    files: Vec<String>,
    checksums: BTreeMap<String, String>,
    statistics: BackupStatistics,
}

impl ManifestBuilder {
    pub fn new(backup_id: impl Into<String>, backup_type: BackupType, scope: BackupScope) -> Self {
        Self {
            backup_id: backup_id.into(),
            backup_type,
            scope,
            files: Vec::new(),
            checksums: BTreeMap::new(),
            statistics: BackupStatistics::default(),
        }
    }

    /// Checksum `dir/name` and list it. The file must be closed already.
    pub async fn add_file(&mut self, dir: &Path, name: &str) -> Result<&mut Self> {
        let digest = sha256_file(&dir.join(name)).await?;
        if !self.checksums.contains_key(name) {
            self.files.push(name.to_string());
        }
        self.checksums.insert(name.to_string(), digest);
        Ok(self)
    }

    pub fn statistics(&mut self, statistics: BackupStatistics) -> &mut Self {
        self.statistics = statistics;
        self
    }

    pub fn build(&self) -> Manifest {
        Manifest {
            backup_id: self.backup_id.clone(),
            backup_type: self.backup_type,
            scope: self.scope.clone(),
            timestamp: Utc::now(),
            files: self.files.clone(),
            statistics: self.statistics.clone(),
            checksums: self.checksums.clone(),
        }
    }

    /// Persist `manifest.json` in `dir`. An existing manifest is never
    /// overwritten.
    pub async fn write(&self, dir: &Path) -> Result<Manifest> {
        let manifest = self.build();
        let json = serde_json::to_vec_pretty(&manifest)?;
        let dir = dir.to_path_buf();
        let target = dir.join(MANIFEST_FILE);

        tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            use std::io::Write;
            let mut temp = tempfile::Builder::new().prefix(".manifest-").tempfile_in(&dir)?;
            temp.write_all(&json)?;
            temp.as_file().sync_all()?;
            temp.persist_noclobber(&target).map_err(|e| {
                if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                    RollcallError::new(ErrorCode::ManifestAlreadyExists, "Manifest already exists")
                        .with_context("path", target.display().to_string())
                } else {
                    RollcallError::from(e.error)
                }
            })?;
            Ok(target)
        })
        .await??;

        Ok(manifest)
    }
}
