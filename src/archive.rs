//! Extraction of uploaded zip archives into scoped scratch directories.

use std::{
    fs::{self, File},
    io::{self, BufReader},
    path::Path,
};
use tempfile::TempDir;
use thiserror::Error;
use zip::{ZipArchive, result::ZipError};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive not found: {0}")]
    NotFound(String),

    #[error("malformed zip archive: {0}")]
    Malformed(#[from] ZipError),

    #[error("I/O error while extracting archive: {0}")]
    Io(#[from] io::Error),
}

/// Extract every entry of `zip_path` into a fresh temporary directory.
///
/// Entries whose names would escape the directory (absolute paths, `..`)
/// are skipped. The directory and its contents are deleted when the
/// returned [`TempDir`] is dropped.
pub fn extract_zip(zip_path: &Path) -> Result<TempDir, ArchiveError> {
    let file = File::open(zip_path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => ArchiveError::NotFound(zip_path.display().to_string()),
        _ => ArchiveError::Io(err),
    })?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let dir = tempfile::Builder::new().prefix("dicom-upload-").tempdir()?;

    let mut extracted = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            log::warn!("skipping archive entry with unsafe path: {}", entry.name());
            continue;
        };
        let out_path = dir.path().join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&out_path)?;
        io::copy(&mut entry, &mut output)?;
        extracted += 1;
    }

    log::info!(
        "extracted {extracted} files from {} into {}",
        zip_path.display(),
        dir.path().display()
    );
    Ok(dir)
}
