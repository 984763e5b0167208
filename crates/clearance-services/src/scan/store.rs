use anyhow::Result;
use async_trait::async_trait;
use clearance_core::models::Upload;
use clearance_db::UploadRepository;

/// Persistence the orchestrator needs for one upload.
#[async_trait]
pub trait ScanRecordStore: Send + Sync {
    async fn load_upload(&self, upload_id: i64) -> Result<Option<Upload>>;

    async fn record_scan_result(&self, upload_id: i64, infected: bool, report: &str)
        -> Result<()>;

    async fn mark_relocation_copied(&self, upload_id: i64) -> Result<()>;

    /// Point the upload at `scanned_key` and complete the job in one transaction.
    ///
    /// A lost lease surfaces as a `JobError::LeaseLost` inside the `anyhow::Error`.
    async fn finalize(
        &self,
        upload_id: i64,
        scanned_key: &str,
        job_id: i64,
        worker_id: &str,
    ) -> Result<()>;
}

#[async_trait]
impl ScanRecordStore for UploadRepository {
    async fn load_upload(&self, upload_id: i64) -> Result<Option<Upload>> {
        self.get(upload_id).await
    }

    async fn record_scan_result(
        &self,
        upload_id: i64,
        infected: bool,
        report: &str,
    ) -> Result<()> {
        UploadRepository::record_scan_result(self, upload_id, infected, report).await
    }

    async fn mark_relocation_copied(&self, upload_id: i64) -> Result<()> {
        UploadRepository::mark_relocation_copied(self, upload_id).await
    }

    async fn finalize(
        &self,
        upload_id: i64,
        scanned_key: &str,
        job_id: i64,
        worker_id: &str,
    ) -> Result<()> {
        self.finalize_relocation(upload_id, scanned_key, job_id, worker_id)
            .await
    }
}
