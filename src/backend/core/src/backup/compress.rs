//! Zip packing and extraction of backup directories. Blocking; callers run
//! these on the blocking pool.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{ErrorCode, Result, RollcallError};

/// Pack the regular files of `source_dir` (flat, by file name) into
/// `archive_path`. The archive appears only once complete.
pub fn zip_dir(source_dir: &Path, archive_path: &Path) -> Result<u64> {
    let parent = archive_path
        .parent()
        .ok_or_else(|| RollcallError::internal("archive path has no parent directory"))?;
    let temp = tempfile::Builder::new()
        .prefix(".backup-")
        .suffix(".zip")
        .tempfile_in(parent)?;

    let mut names: Vec<(String, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(source_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    names.sort();

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(BufWriter::new(temp.reopen()?));
    for (name, path) in &names {
        zip.start_file(name.as_str(), options)?;
        let mut reader = BufReader::new(File::open(path)?);
        std::io::copy(&mut reader, &mut zip)?;
    }
    let mut writer = zip.finish()?;
    std::io::Write::flush(&mut writer)?;
    drop(writer);
    temp.as_file().sync_all()?;

    let file = temp.persist_noclobber(archive_path).map_err(|e| RollcallError::from(e.error))?;
    Ok(file.metadata()?.len())
}

/// Extract every file of `archive_path` into `dest`. Entries whose names
/// would escape `dest` are rejected.
pub fn extract(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(archive_path)?))?;
    std::fs::create_dir_all(dest)?;

    let mut written = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            RollcallError::new(
                ErrorCode::BackupIntegrityFailed,
                format!("Archive entry '{}' has an unsafe path", entry.name()),
            )
        })?;
        let target = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&target)?);
        std::io::copy(&mut entry, &mut out)?;
        written.push(target);
    }
    Ok(written)
}

/// Read one entry into memory, `None` if the archive has no such entry.
pub fn read_entry(archive_path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(archive_path)?))?;
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(Some(bytes))
}

/// Whether `archive_path` contains an entry called `name`.
pub fn contains_entry(archive_path: &Path, name: &str) -> Result<bool> {
    let archive = ZipArchive::new(BufReader::new(File::open(archive_path)?))?;
    let found = archive.file_names().any(|n| n == name);
    Ok(found)
}
