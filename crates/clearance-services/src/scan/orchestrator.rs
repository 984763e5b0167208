//! Scan orchestration: download → (validate archive) → scan → record → relocate → complete.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clearance_core::models::{is_valid_file_id, Job, RelocationStage, Upload, VirusScanPayload};
use clearance_core::{JobError, JobResultExt};
use clearance_processing::{is_container, ArchiveError, ArchiveLimits, ArchiveValidator};
use clearance_storage::{KeyLayout, Storage, StorageError};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use super::scratch::ScratchSpace;
use super::store::ScanRecordStore;
use crate::scanner::{ScanEngine, ScanOutcome};

/// Stages of one scan job, used as a structured log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStage {
    Downloading,
    Validating,
    Scanning,
    Recording,
    Relocating,
    Done,
}

impl Display for ScanStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            ScanStage::Downloading => "downloading",
            ScanStage::Validating => "validating",
            ScanStage::Scanning => "scanning",
            ScanStage::Recording => "recording",
            ScanStage::Relocating => "relocating",
            ScanStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct ScanOrchestratorConfig {
    /// Local directory holding downloaded files and extraction trees.
    pub scan_dir: PathBuf,
    pub keys: KeyLayout,
    pub archive_limits: ArchiveLimits,
}

/// What a finished scan job did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub upload_id: i64,
    pub infected: bool,
    pub object_key: String,
    /// The verdict was already recorded by an earlier attempt.
    pub resumed: bool,
}

pub struct ScanOrchestrator {
    store: Arc<dyn ScanRecordStore>,
    storage: Arc<dyn Storage>,
    engine: Arc<dyn ScanEngine>,
    archive: ArchiveValidator,
    keys: KeyLayout,
    scan_dir: PathBuf,
}

impl ScanOrchestrator {
    pub fn new(
        store: Arc<dyn ScanRecordStore>,
        storage: Arc<dyn Storage>,
        engine: Arc<dyn ScanEngine>,
        config: ScanOrchestratorConfig,
    ) -> Self {
        Self {
            store,
            storage,
            engine,
            archive: ArchiveValidator::new(config.archive_limits),
            keys: config.keys,
            scan_dir: config.scan_dir,
        }
    }

    /// Run a virus-scan job to completion.
    ///
    /// On success the upload points at its scanned key and the job is completed in
    /// the same transaction. A re-delivered job resumes from the recorded progress
    /// instead of scanning again.
    #[tracing::instrument(skip(self, job), fields(job.id = job.id, upload.id, file_id))]
    pub async fn process(&self, job: &Job, worker_id: &str) -> Result<ScanSummary, JobError> {
        let start = Instant::now();
        let payload: VirusScanPayload = job
            .try_payload_as()
            .map_err(|e| JobError::DataIntegrity(format!("Invalid virus-scan payload: {}", e)))?;

        let upload = self
            .store
            .load_upload(payload.upload_id)
            .await
            .transient("Failed to load upload")?
            .ok_or_else(|| {
                JobError::DataIntegrity(format!("Upload {} not found", payload.upload_id))
            })?;

        let span = tracing::Span::current();
        span.record("upload.id", upload.upload_id);
        span.record("file_id", upload.file_id.as_str());

        if !is_valid_file_id(&upload.file_id) {
            return Err(JobError::DataIntegrity(format!(
                "Upload {} has an unusable file id",
                upload.upload_id
            )));
        }
        let scanned_key = self
            .keys
            .scanned_key(&upload.owner_user_id, &upload.file_id)
            .map_err(|e| JobError::DataIntegrity(e.to_string()))?;

        let resumed = upload.is_scanned();
        let infected = if resumed {
            tracing::info!(
                stage = %upload.relocation_stage,
                "Scan verdict already recorded, resuming relocation"
            );
            upload.is_infected()
        } else {
            let outcome = self.scan_upload(&upload).await?;

            tracing::debug!(stage = %ScanStage::Recording, "Persisting scan verdict");
            self.store
                .record_scan_result(upload.upload_id, outcome.is_infected(), &outcome.raw_report)
                .await
                .transient("Failed to record scan result")?;

            if outcome.is_infected() {
                tracing::warn!(
                    report = %outcome.raw_report,
                    "Virus detected in upload, relocating anyway"
                );
            }
            outcome.is_infected()
        };

        if upload.relocation_stage != RelocationStage::Completed {
            self.relocate(&upload, &scanned_key).await?;
        }

        self.store
            .finalize(upload.upload_id, &scanned_key, job.id, worker_id)
            .await
            .map_err(finalize_error)?;

        tracing::info!(
            stage = %ScanStage::Done,
            infected,
            resumed,
            object_key = %scanned_key,
            duration_ms = start.elapsed().as_millis(),
            "Upload scanned and relocated"
        );

        Ok(ScanSummary {
            upload_id: upload.upload_id,
            infected,
            object_key: scanned_key,
            resumed,
        })
    }

    /// Download, validate and scan, then remove every local trace.
    async fn scan_upload(&self, upload: &Upload) -> Result<ScanOutcome, JobError> {
        let scratch = ScratchSpace::new(&self.scan_dir, &upload.file_id);
        let result = self.scan_in(&scratch, upload).await;
        scratch.cleanup().await;
        result
    }

    async fn scan_in(
        &self,
        scratch: &ScratchSpace,
        upload: &Upload,
    ) -> Result<ScanOutcome, JobError> {
        tokio::fs::create_dir_all(&self.scan_dir)
            .await
            .transient("Failed to create scan directory")?;

        tracing::debug!(stage = %ScanStage::Downloading, key = %upload.object_key, "Downloading object");
        let bytes = self.download_to(&upload.object_key, scratch.file()).await?;
        tracing::debug!(bytes, "Object downloaded");

        if is_container(&upload.original_file_name) {
            tracing::debug!(stage = %ScanStage::Validating, "Extracting archive");
            let validator = self.archive.clone();
            let file = scratch.file().to_path_buf();
            let extract_dir = scratch.extract_dir().to_path_buf();
            let cancel = scratch.cancellation();
            let members = tokio::task::spawn_blocking(move || {
                validator.extract_cancellable(&file, &extract_dir, &cancel)
            })
            .await
            .transient("Archive extraction task failed")?
            .map_err(archive_error)?;
            tracing::info!(members = members.len(), "Archive validated");
        }

        tracing::debug!(stage = %ScanStage::Scanning, "Scanning file");
        self.engine
            .scan(scratch.file())
            .await
            .transient("Scan engine failed")
    }

    /// Stream an object to `path`, returning the byte count.
    async fn download_to(&self, key: &str, path: &Path) -> Result<u64, JobError> {
        let mut stream = self
            .storage
            .download_stream(key)
            .await
            .map_err(|e| download_error(key, e))?;

        let mut file = tokio::fs::File::create(path)
            .await
            .transient("Failed to create scratch file")?;
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_error(key, e))?;
            file.write_all(&chunk)
                .await
                .transient("Failed to write scratch file")?;
            written += chunk.len() as u64;
        }
        file.flush().await.transient("Failed to flush scratch file")?;
        Ok(written)
    }

    /// Copy-then-delete from the temporary key to `scanned_key`, safe to repeat.
    async fn relocate(&self, upload: &Upload, scanned_key: &str) -> Result<(), JobError> {
        let source = upload.object_key.as_str();
        if source == scanned_key {
            return Ok(());
        }
        tracing::debug!(stage = %ScanStage::Relocating, from = %source, to = %scanned_key, "Relocating object");

        let already_copied = self
            .storage
            .exists(scanned_key)
            .await
            .relocation("Failed to check scanned object")?;
        if already_copied {
            tracing::debug!("Scanned object already present, skipping copy");
        } else {
            self.storage
                .copy(source, scanned_key)
                .await
                .map_err(|e| match e {
                    StorageError::NotFound(_) => JobError::Relocation(anyhow::anyhow!(
                        "Object {} is missing and was never copied to {}",
                        source,
                        scanned_key
                    )),
                    other => JobError::Relocation(
                        anyhow::Error::new(other).context("Failed to copy object to scanned key"),
                    ),
                })?;
        }

        if upload.relocation_stage == RelocationStage::Pending {
            self.store
                .mark_relocation_copied(upload.upload_id)
                .await
                .relocation("Failed to record relocation progress")?;
        }

        let present = self
            .storage
            .exists(scanned_key)
            .await
            .relocation("Failed to verify scanned object")?;
        if !present {
            return Err(JobError::Relocation(anyhow::anyhow!(
                "Scanned object {} missing after copy",
                scanned_key
            )));
        }

        self.storage
            .delete(source)
            .await
            .relocation("Failed to delete temporary object")?;
        Ok(())
    }
}

fn download_error(key: &str, err: StorageError) -> JobError {
    if err.is_not_found() {
        JobError::DataIntegrity(format!("Object {} not found in storage", key))
    } else {
        JobError::Transient(anyhow::Error::new(err).context("Failed to download object"))
    }
}

fn archive_error(err: ArchiveError) -> JobError {
    if err.is_io() {
        JobError::Transient(anyhow::Error::new(err).context("Archive extraction I/O failed"))
    } else {
        JobError::Validation(err.to_string())
    }
}

fn finalize_error(err: anyhow::Error) -> JobError {
    match err.downcast::<JobError>() {
        Ok(job_err) => job_err,
        Err(err) => JobError::Relocation(err.context("Failed to finalize relocation")),
    }
}
