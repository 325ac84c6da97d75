use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::Path,
};
use tempfile::NamedTempFile;

/// Write `path` through a temporary sibling that is renamed into place once
/// `write` succeeds. Readers observe either the old file or the complete new
/// one; concurrent writers of the same path resolve to the last rename.
pub(crate) fn write_atomically<E, F>(path: &Path, write: F) -> Result<(), E>
where
    E: From<io::Error>,
    F: FnOnce(&mut BufWriter<&File>) -> Result<(), E>,
{
    let file = staging_file(path)?;
    {
        let mut writer = BufWriter::new(file.as_file());
        write(&mut writer)?;
        writer.flush()?;
    }
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Like [`write_atomically`] for writers that need a path of their own,
/// such as libraries that open the file themselves.
#[cfg(feature = "hdf5")]
pub(crate) fn write_atomically_at<E, F>(path: &Path, write: F) -> Result<(), E>
where
    E: From<io::Error>,
    F: FnOnce(&Path) -> Result<(), E>,
{
    let file = staging_file(path)?;
    write(file.path())?;
    File::open(file.path())?.sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn staging_file(path: &Path) -> io::Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    NamedTempFile::new_in(dir)
}

/// File stem for artifacts derived from a series identifier.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`, and a leading dot is
/// prefixed so the stem can never name a hidden file or a parent directory.
pub fn artifact_stem(series_uid: &str) -> String {
    let stem: String = series_uid
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match stem.chars().next() {
        None => "unknown".to_string(),
        Some('.') => format!("series{stem}"),
        Some(_) => stem,
    }
}
