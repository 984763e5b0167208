//! Safe extraction of untrusted ZIP uploads.
//!
//! Every entry name is validated before anything is written to disk, so a
//! rejected archive never leaves files outside (or inside) the extraction
//! directory. Sizes are checked twice: against the declared header values up
//! front, and against the bytes actually inflated while copying.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use clearance_core::ArchiveLimitsConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::content::{check_preamble, Preamble};

const MIB: u64 = 1024 * 1024;

/// Extensions treated as nested containers inside an archive.
const NESTED_ARCHIVE_EXTENSIONS: &[&str] = &[
    "zip", "jar", "7z", "rar", "tar", "gz", "tgz", "bz2", "xz",
];

/// Extensions of uploads that go through the archive validator.
const CONTAINER_EXTENSIONS: &[&str] = &["zip"];

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Unreadable archive: {0}")]
    Unreadable(String),

    #[error("Archive entry '{0}' escapes the extraction directory")]
    PathTraversal(String),

    #[error("Archive contains hidden or system entry '{0}'")]
    HiddenEntry(String),

    #[error("Archive contains nested archive '{0}'")]
    NestedArchive(String),

    #[error("Archive entry name '{0}' is not usable")]
    InvalidEntryName(String),

    #[error("Archive contains duplicate entry '{0}'")]
    DuplicateEntry(String),

    #[error("Archive entry '{0}' is both a file and a directory")]
    PathConflict(String),

    #[error("Archive has more than {max} entries")]
    TooManyEntries { max: usize },

    #[error("Archive entry '{name}' exceeds {max} bytes")]
    EntryTooLarge { name: String, max: u64 },

    #[error("Archive expands to more than {max} bytes")]
    TotalSizeExceeded { max: u64 },

    #[error("File '{path}' is too short for a DICOM preamble ({len} bytes)")]
    TooShort { path: String, len: u64 },

    #[error("Extraction cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    /// Local I/O trouble or cancellation, as opposed to a property of the archive itself.
    pub fn is_io(&self) -> bool {
        matches!(self, ArchiveError::Io(_) | ArchiveError::Cancelled)
    }
}

impl From<ZipError> for ArchiveError {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(e) => ArchiveError::Io(e),
            other => ArchiveError::Unreadable(other.to_string()),
        }
    }
}

/// Zip-bomb limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    pub max_entries: usize,
    pub max_entry_size: u64,
    pub max_total_size: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_entry_size: 512 * MIB,
            max_total_size: 2048 * MIB,
        }
    }
}

impl From<&ArchiveLimitsConfig> for ArchiveLimits {
    fn from(config: &ArchiveLimitsConfig) -> Self {
        Self {
            max_entries: config.max_entries,
            max_entry_size: config.max_entry_mb.saturating_mul(MIB),
            max_total_size: config.max_total_mb.saturating_mul(MIB),
        }
    }
}

/// Whether an upload with this original file name is a container to unpack.
pub fn is_container(file_name: &str) -> bool {
    has_extension(file_name, CONTAINER_EXTENSIONS)
}

fn has_extension(name: &str, extensions: &[&str]) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// Turn an entry name into a relative path that stays under the extraction dir.
///
/// Backslashes count as separators; empty and `.` segments are dropped.
pub fn sanitize_entry_path(name: &str) -> Result<PathBuf, ArchiveError> {
    let normalized = name.replace('\\', "/");

    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(ArchiveError::PathTraversal(name.to_string()));
    }

    let mut path = PathBuf::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(ArchiveError::PathTraversal(name.to_string())),
            s if s.starts_with('.') => return Err(ArchiveError::HiddenEntry(name.to_string())),
            s if s.chars().any(char::is_control) => {
                return Err(ArchiveError::InvalidEntryName(name.to_string()))
            }
            s => {
                if path.as_os_str().is_empty() && s.eq_ignore_ascii_case("__MACOSX") {
                    return Err(ArchiveError::HiddenEntry(name.to_string()));
                }
                path.push(s);
            }
        }
    }

    // Only plain components may survive.
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(ArchiveError::PathTraversal(name.to_string()));
    }

    Ok(path)
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Reader that fails as soon as `cancel` fires, so a large entry stops mid-copy.
struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("extraction cancelled"));
        }
        self.inner.read(buf)
    }
}

struct PlannedEntry {
    index: usize,
    name: String,
    relative: PathBuf,
}

/// Validates and extracts ZIP archives under fixed limits.
#[derive(Debug, Clone, Default)]
pub struct ArchiveValidator {
    limits: ArchiveLimits,
}

impl ArchiveValidator {
    pub fn new(limits: ArchiveLimits) -> Self {
        Self { limits }
    }

    /// Extract `archive_path` into a fresh `extract_dir` and return the member paths.
    ///
    /// Directory entries are skipped. Extracted members must pass the content
    /// preamble check. On error `extract_dir` is removed.
    pub fn extract(
        &self,
        archive_path: &Path,
        extract_dir: &Path,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        self.extract_cancellable(archive_path, extract_dir, &CancellationToken::new())
    }

    /// [`ArchiveValidator::extract`], stopping with [`ArchiveError::Cancelled`]
    /// once `cancel` fires.
    ///
    /// Nothing is left under `extract_dir` after a cancelled run, even when the
    /// directory was removed by someone else while an entry was being written.
    #[tracing::instrument(skip(self, cancel), fields(archive = %archive_path.display()))]
    pub fn extract_cancellable(
        &self,
        archive_path: &Path,
        extract_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        let result = self
            .extract_into(archive_path, extract_dir, cancel)
            .and_then(|files| {
                if cancel.is_cancelled() {
                    Err(ArchiveError::Cancelled)
                } else {
                    Ok(files)
                }
            });

        if let Err(e) = &result {
            if let Err(remove) = fs::remove_dir_all(extract_dir) {
                if remove.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(error = %remove, "Failed to remove extraction directory");
                }
            }
            if matches!(e, ArchiveError::Cancelled) {
                tracing::info!("Archive extraction cancelled");
            }
        }
        result
    }

    fn extract_into(
        &self,
        archive_path: &Path,
        extract_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        let file = File::open(archive_path)?;
        let mut archive = ZipArchive::new(file)?;

        if archive.len() > self.limits.max_entries {
            return Err(ArchiveError::TooManyEntries {
                max: self.limits.max_entries,
            });
        }

        let plan = self.plan(&mut archive)?;

        if extract_dir.exists() {
            fs::remove_dir_all(extract_dir)?;
        }
        fs::create_dir_all(extract_dir)?;

        let mut extracted = Vec::with_capacity(plan.len());
        let mut total_written: u64 = 0;

        for entry in &plan {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let mut zip_entry = archive.by_index(entry.index)?;
            let destination = extract_dir.join(&entry.relative);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }

            let remaining_total = self.limits.max_total_size.saturating_sub(total_written);
            let budget = self.limits.max_entry_size.min(remaining_total);

            let mut out = File::create(&destination)?;
            let mut limited = CancellableReader {
                inner: &mut zip_entry,
                cancel,
            }
            .take(budget.saturating_add(1));
            // A corrupt stream (bad CRC, broken deflate) surfaces as InvalidData.
            let written = io::copy(&mut limited, &mut out).map_err(|e| {
                if cancel.is_cancelled() {
                    ArchiveError::Cancelled
                } else if e.kind() == io::ErrorKind::InvalidData {
                    ArchiveError::Unreadable(e.to_string())
                } else {
                    ArchiveError::Io(e)
                }
            })?;

            if written > self.limits.max_entry_size {
                return Err(ArchiveError::EntryTooLarge {
                    name: entry.name.clone(),
                    max: self.limits.max_entry_size,
                });
            }
            total_written += written;
            if total_written > self.limits.max_total_size {
                return Err(ArchiveError::TotalSizeExceeded {
                    max: self.limits.max_total_size,
                });
            }

            tracing::debug!(entry = %entry.name, bytes = written, "Extracted archive entry");
            extracted.push(destination);
        }

        for path in &extracted {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            if check_preamble(path)? == Preamble::Unrecognized {
                tracing::warn!(
                    file = %path.display(),
                    "Extracted file has no DICM magic, accepting"
                );
            }
        }

        tracing::info!(
            count = extracted.len(),
            bytes = total_written,
            "Archive extracted and validated"
        );

        Ok(extracted)
    }

    /// Validate every entry without writing anything.
    fn plan<R: Read + io::Seek>(
        &self,
        archive: &mut ZipArchive<R>,
    ) -> Result<Vec<PlannedEntry>, ArchiveError> {
        let mut plan = Vec::new();
        let mut files = HashSet::new();
        let mut dirs = HashSet::new();
        let mut declared_total: u64 = 0;

        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            let name = entry.name().to_string();
            let relative = sanitize_entry_path(&name)?;

            if entry.is_dir() || name.ends_with('\\') {
                tracing::debug!(entry = %name, "Skipping directory entry");
                continue;
            }

            if relative.as_os_str().is_empty() {
                return Err(ArchiveError::InvalidEntryName(name));
            }

            if has_extension(&name.replace('\\', "/"), NESTED_ARCHIVE_EXTENSIONS) {
                return Err(ArchiveError::NestedArchive(name));
            }

            if entry.size() > self.limits.max_entry_size {
                return Err(ArchiveError::EntryTooLarge {
                    name,
                    max: self.limits.max_entry_size,
                });
            }
            declared_total = declared_total.saturating_add(entry.size());
            if declared_total > self.limits.max_total_size {
                return Err(ArchiveError::TotalSizeExceeded {
                    max: self.limits.max_total_size,
                });
            }

            if !files.insert(relative.clone()) {
                return Err(ArchiveError::DuplicateEntry(name));
            }
            // `a` and `a/b.dcm` cannot both be extracted, in either order.
            if dirs.contains(&relative) {
                return Err(ArchiveError::PathConflict(name));
            }
            for parent in relative.ancestors().skip(1) {
                if parent.as_os_str().is_empty() {
                    break;
                }
                if files.contains(parent) {
                    return Err(ArchiveError::PathConflict(name));
                }
                dirs.insert(parent.to_path_buf());
            }

            plan.push(PlannedEntry {
                index,
                name,
                relative,
            });
        }

        Ok(plan)
    }
}
