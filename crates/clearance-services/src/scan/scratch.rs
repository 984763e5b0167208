use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

/// Local scratch files for one upload, named by `file_id`.
///
/// Call [`ScratchSpace::cleanup`] on every exit path; `Drop` is a synchronous
/// fallback for early returns, panics and dropped futures. Either way the
/// extraction token is cancelled first so a blocking extraction still running
/// stops writing and removes its own output.
#[derive(Debug)]
pub struct ScratchSpace {
    file: PathBuf,
    extract_dir: PathBuf,
    extraction: CancellationToken,
    cleaned: bool,
}

impl ScratchSpace {
    pub fn new(scan_dir: &Path, file_id: &str) -> Self {
        Self {
            file: scan_dir.join(file_id),
            extract_dir: scan_dir.join(format!("{}_extract", file_id)),
            extraction: CancellationToken::new(),
            cleaned: false,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn extract_dir(&self) -> &Path {
        &self.extract_dir
    }

    /// Token an extraction into [`ScratchSpace::extract_dir`] must observe.
    pub fn cancellation(&self) -> CancellationToken {
        self.extraction.clone()
    }

    pub async fn cleanup(mut self) {
        self.extraction.cancel();
        if let Err(e) = tokio::fs::remove_file(&self.file).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(error = %e, path = %self.file.display(), "Failed to delete scratch file");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.extract_dir).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(error = %e, path = %self.extract_dir.display(), "Failed to delete extraction directory");
            }
        }
        self.cleaned = true;
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        if !self.cleaned {
            self.extraction.cancel();
            let _ = std::fs::remove_file(&self.file);
            let _ = std::fs::remove_dir_all(&self.extract_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_removes_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::new(dir.path(), "f1");
        std::fs::write(scratch.file(), b"data").unwrap();
        std::fs::create_dir_all(scratch.extract_dir().join("nested")).unwrap();

        scratch.cleanup().await;

        assert!(!dir.path().join("f1").exists());
        assert!(!dir.path().join("f1_extract").exists());
    }

    #[tokio::test]
    async fn cleanup_tolerates_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        ScratchSpace::new(dir.path(), "never-downloaded").cleanup().await;
    }

    #[test]
    fn drop_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let scratch = ScratchSpace::new(dir.path(), "f2");
            std::fs::write(scratch.file(), b"data").unwrap();
        }
        assert!(!dir.path().join("f2").exists());
    }

    #[test]
    fn drop_cancels_pending_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::new(dir.path(), "f3");
        let token = scratch.cancellation();
        assert!(!token.is_cancelled());

        drop(scratch);

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cleanup_cancels_pending_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::new(dir.path(), "f4");
        let token = scratch.cancellation();

        scratch.cleanup().await;

        assert!(token.is_cancelled());
    }
}
