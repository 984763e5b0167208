use anyhow::{Context, Result};
use clearance_core::constants::{sanitize_db_text, MAX_SCAN_REPORT_LEN};
use clearance_core::models::{Job, JobPayload, NewUpload, Upload, VirusScanPayload};
use sqlx::{PgPool, Postgres};

use super::job::JobRepository;

#[derive(Clone)]
pub struct UploadRepository {
    pool: PgPool,
    jobs: JobRepository,
}

impl UploadRepository {
    pub fn new(pool: PgPool) -> Self {
        let jobs = JobRepository::new(pool.clone());
        Self { pool, jobs }
    }

    /// Record a fully assembled upload and enqueue its virus scan in one transaction.
    ///
    /// Either both rows exist afterwards or neither does.
    #[tracing::instrument(skip(self, upload), fields(file_id = %upload.file_id))]
    pub async fn register_completed_upload(
        &self,
        upload: &NewUpload,
        max_attempts: i32,
    ) -> Result<(Upload, Job)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for upload registration")?;

        let created: Upload = sqlx::query_as::<Postgres, Upload>(
            r#"
            INSERT INTO uploads (file_id, owner_user_id, original_file_name, object_key)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&upload.file_id)
        .bind(&upload.owner_user_id)
        .bind(&upload.original_file_name)
        .bind(&upload.object_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            let duplicate =
                matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
            if duplicate {
                anyhow::anyhow!(
                    "Upload with file_id {} is already registered",
                    upload.file_id
                )
            } else {
                anyhow::Error::new(e).context("Failed to insert upload")
            }
        })?;

        let payload = serde_json::to_value(VirusScanPayload {
            upload_id: created.upload_id,
        })
        .context("Failed to encode job payload")?;

        let job = self
            .jobs
            .enqueue_in_tx(&mut tx, VirusScanPayload::job_type(), payload, max_attempts)
            .await?;

        tx.commit()
            .await
            .context("Failed to commit upload registration")?;

        tracing::info!(
            upload_id = created.upload_id,
            job_id = job.id,
            object_key = %created.object_key,
            "Upload registered and scan enqueued"
        );

        Ok((created, job))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, upload_id: i64) -> Result<Option<Upload>> {
        sqlx::query_as::<Postgres, Upload>("SELECT * FROM uploads WHERE upload_id = $1")
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch upload")
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_by_file_id(&self, file_id: &str) -> Result<Option<Upload>> {
        sqlx::query_as::<Postgres, Upload>("SELECT * FROM uploads WHERE file_id = $1")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch upload by file_id")
    }

    /// Persist the scan verdict. `virus_detected_at` is set iff `infected`.
    ///
    /// NUL bytes are stripped from the report (Postgres text cannot hold them) and
    /// it is truncated to the column bound.
    #[tracing::instrument(skip(self, report))]
    pub async fn record_scan_result(
        &self,
        upload_id: i64,
        infected: bool,
        report: &str,
    ) -> Result<()> {
        let report = sanitize_db_text(report, MAX_SCAN_REPORT_LEN);
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET virus_detected_at = CASE WHEN $2 THEN NOW() ELSE NULL END,
                scan_report_raw = $3,
                scanned_at = NOW()
            WHERE upload_id = $1
            "#,
        )
        .bind(upload_id)
        .bind(infected)
        .bind(report)
        .execute(&self.pool)
        .await
        .context("Failed to record scan result")?;

        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("Upload {} not found", upload_id));
        }
        Ok(())
    }

    /// Note that the object now exists under its scanned key.
    #[tracing::instrument(skip(self))]
    pub async fn mark_relocation_copied(&self, upload_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE uploads
            SET relocation_stage = 'copied'
            WHERE upload_id = $1 AND relocation_stage = 'pending'
            "#,
        )
        .bind(upload_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark relocation as copied")?;
        Ok(())
    }

    /// Point the upload at its scanned key and complete the job, atomically.
    ///
    /// If the job's lease was lost the whole transaction is rolled back and the
    /// upload keeps its previous relocation stage.
    #[tracing::instrument(skip(self))]
    pub async fn finalize_relocation(
        &self,
        upload_id: i64,
        scanned_key: &str,
        job_id: i64,
        worker_id: &str,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for relocation")?;

        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET object_key = $2,
                relocation_stage = 'completed'
            WHERE upload_id = $1
            "#,
        )
        .bind(upload_id)
        .bind(scanned_key)
        .execute(&mut *tx)
        .await
        .context("Failed to update upload object key")?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(anyhow::anyhow!("Upload {} not found", upload_id));
        }

        if let Err(e) = self.jobs.complete_in_tx(&mut tx, job_id, worker_id).await {
            tx.rollback().await.ok();
            return Err(e);
        }

        tx.commit()
            .await
            .context("Failed to commit relocation")?;

        Ok(())
    }
}
