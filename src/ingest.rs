use dicom::object::{OpenFileOptions, file::ReadPreamble};
use dicom_dictionary_std::tags;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use thiserror::Error;
use walkdir::WalkDir;

pub const DICOM_EXTENSION: &str = ".dcm";
/// Prefix of AppleDouble resource-fork siblings.
pub const RESOURCE_FORK_PREFIX: &str = "._";
/// Directory macOS archivers add next to the real content.
pub const ARCHIVE_METADATA_DIR: &str = "__MACOSX";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("No DICOM files found.")]
    NoDicomFiles,

    #[error("No DICOM series found.")]
    NoSeries,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Candidate files grouped by SeriesInstanceUID, ordered by identifier.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeriesGroups {
    groups: BTreeMap<String, Vec<PathBuf>>,
}

/// The series chosen as canonical for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesSelection {
    pub series_uid: String,
    pub files: Vec<PathBuf>,
    /// Number of distinct series seen while grouping.
    pub series_count: usize,
}

impl SeriesGroups {
    pub fn insert(&mut self, series_uid: impl Into<String>, path: PathBuf) {
        self.groups.entry(series_uid.into()).or_default().push(path);
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Pick the series with the most files.
    ///
    /// Equal counts go to the lexicographically smallest identifier, which
    /// makes the choice reproducible but does not make it meaningful when an
    /// archive holds several series of the same size.
    pub fn select(self) -> Option<SeriesSelection> {
        let series_count = self.groups.len();
        let mut best: Option<(String, Vec<PathBuf>)> = None;
        for (uid, files) in self.groups {
            if best
                .as_ref()
                .is_none_or(|(_, best_files)| files.len() > best_files.len())
            {
                best = Some((uid, files));
            }
        }
        best.map(|(series_uid, files)| SeriesSelection {
            series_uid,
            files,
            series_count,
        })
    }
}

pub struct DicomIngestor;

impl DicomIngestor {
    /// Find every candidate slice under `root`, group the candidates by
    /// series and select the largest series.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::NoDicomFiles`] when nothing under `root` looks
    /// like a slice file and [`IngestError::NoSeries`] when none of the
    /// candidates carries a readable series identifier.
    pub fn ingest_directory(root: impl AsRef<Path>) -> Result<SeriesSelection, IngestError> {
        let candidates = Self::collect_candidates(root.as_ref())?;
        if candidates.is_empty() {
            return Err(IngestError::NoDicomFiles);
        }
        log::debug!("found {} candidate DICOM files", candidates.len());

        let groups = Self::group_by_series(&candidates);
        let selection = groups.select().ok_or(IngestError::NoSeries)?;
        log::info!(
            "selected series {} with {} files out of {} series",
            selection.series_uid,
            selection.files.len(),
            selection.series_count
        );
        Ok(selection)
    }

    /// A slice file is a regular `.dcm` file that is neither a resource fork
    /// nor stored below an archive-metadata directory.
    pub fn is_valid_candidate(path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        path.is_file()
            && name.to_ascii_lowercase().ends_with(DICOM_EXTENSION)
            && !name.starts_with(RESOURCE_FORK_PREFIX)
            && !path
                .components()
                .any(|c| c.as_os_str() == ARCHIVE_METADATA_DIR)
    }

    /// Walk `root` recursively and return the valid candidates in sorted
    /// path order.
    pub fn collect_candidates(root: &Path) -> Result<Vec<PathBuf>, IngestError> {
        let mut candidates = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => return Err(std::io::Error::from(err).into()),
                Err(err) => {
                    log::warn!("skipping unreadable entry: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_dir() && Self::is_valid_candidate(entry.path()) {
                candidates.push(entry.into_path());
            }
        }
        Ok(candidates)
    }

    /// Read SeriesInstanceUID without decoding pixel data.
    ///
    /// Files that cannot be parsed, or that carry no identifier, yield `None`.
    pub fn read_series_uid(path: &Path) -> Option<String> {
        let object = OpenFileOptions::new()
            .read_preamble(ReadPreamble::Auto)
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
            .inspect_err(|err| log::debug!("skipping {}: {err}", path.display()))
            .ok()?;
        let uid = object
            .element(tags::SERIES_INSTANCE_UID)
            .ok()?
            .to_str()
            .ok()?
            .trim_end_matches(['\0', ' '])
            .trim()
            .to_string();
        (!uid.is_empty()).then_some(uid)
    }

    /// Header-only pass over `candidates`. Unreadable files are skipped.
    pub fn group_by_series(candidates: &[PathBuf]) -> SeriesGroups {
        let mut groups = SeriesGroups::default();
        for path in candidates {
            match Self::read_series_uid(path) {
                Some(uid) => groups.insert(uid, path.clone()),
                None => log::debug!("no series identifier in {}", path.display()),
            }
        }
        groups
    }
}
