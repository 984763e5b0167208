use anyhow::{Context, Result};
use clearance_core::constants::{sanitize_db_text, JOB_NOTIFY_CHANNEL, MAX_LAST_ERROR_LEN};
use clearance_core::models::{Job, JobStats, JobStatus, JobType};
use clearance_core::JobError;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

/// Durable job queue backed by the `jobs` table.
///
/// Mutual exclusion between workers comes solely from row locks taken with
/// `FOR UPDATE SKIP LOCKED`; nothing is cached between calls.
#[derive(Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a job inside the caller's transaction, so the job becomes visible
    /// together with the entity it describes.
    ///
    /// A `pg_notify` is sent in the same transaction; Postgres delivers it on commit.
    #[tracing::instrument(skip(self, tx, payload))]
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_type: JobType,
        payload: serde_json::Value,
        max_attempts: i32,
    ) -> Result<Job> {
        let job: Job = sqlx::query_as::<Postgres, Job>(
            r#"
            INSERT INTO jobs (job_type, payload, status, max_attempts)
            VALUES ($1, $2, 'pending', $3)
            RETURNING *
            "#,
        )
        .bind(job_type.as_str())
        .bind(payload)
        .bind(max_attempts)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to insert job")?;

        // Non-fatal: workers discover the job by polling if the notification is lost.
        if let Err(e) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(JOB_NOTIFY_CHANNEL)
            .bind(job_type.as_str())
            .execute(&mut **tx)
            .await
        {
            tracing::warn!(
                error = %e,
                job_id = job.id,
                "Failed to send pg_notify for new job, workers will discover job via polling"
            );
        }

        tracing::debug!(job_id = job.id, job_type = %job_type, "Job enqueued");

        Ok(job)
    }

    /// Enqueue a job in its own transaction.
    #[tracing::instrument(skip(self, payload))]
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        max_attempts: i32,
    ) -> Result<Job> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for job creation")?;
        let job = self
            .enqueue_in_tx(&mut tx, job_type, payload, max_attempts)
            .await?;
        tx.commit().await.context("Failed to commit job creation")?;
        Ok(job)
    }

    /// Atomically claim the oldest eligible job of `job_type` for `worker_id`.
    ///
    /// Eligible means pending and available, or processing with an expired lease
    /// (its worker is presumed dead), and in both cases with attempts left. The
    /// claim stamps a fresh lease and increments `attempts`. Returns `None` when
    /// nothing is eligible; nothing is modified in that case.
    #[tracing::instrument(skip(self))]
    pub async fn try_dequeue(
        &self,
        job_type: JobType,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let candidate: Option<(i64, JobStatus)> = sqlx::query_as(
            r#"
            SELECT id, status
            FROM jobs
            WHERE job_type = $1
                AND attempts < max_attempts
                AND (
                    (status = 'pending' AND available_at <= NOW())
                    OR (status = 'processing' AND lease_expires_at < NOW())
                )
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(job_type.as_str())
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to fetch next job")?;

        let Some((job_id, previous_status)) = candidate else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let job: Job = sqlx::query_as::<Postgres, Job>(
            r#"
            UPDATE jobs
            SET status = 'processing',
                locked_at = NOW(),
                locked_by = $2,
                lease_expires_at = NOW() + make_interval(secs => $3),
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_one(&mut *tx)
        .await
        .context("Failed to lease job")?;

        tx.commit().await.context("Failed to commit transaction")?;

        if previous_status == JobStatus::Processing {
            tracing::warn!(
                job_id = job.id,
                worker_id = %worker_id,
                attempts = job.attempts,
                "Reclaimed job with expired lease"
            );
        } else {
            tracing::debug!(
                job_id = job.id,
                worker_id = %worker_id,
                attempts = job.attempts,
                "Job leased"
            );
        }

        Ok(Some(job))
    }

    /// Mark a job completed inside the caller's transaction.
    ///
    /// Fails with [`JobError::LeaseLost`] if `worker_id` no longer holds the job;
    /// the caller must then roll back whatever else the transaction changed.
    #[tracing::instrument(skip(self, tx))]
    pub async fn complete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: i64,
        worker_id: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                lease_expires_at = NULL,
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&mut **tx)
        .await
        .context("Failed to mark job as completed")?;

        if result.rows_affected() == 0 {
            return Err(lease_lost(job_id, worker_id));
        }

        tracing::debug!(job_id, "Job marked completed");
        Ok(())
    }

    /// Mark a job failed. Terminal; failed jobs are never dequeued again.
    #[tracing::instrument(skip(self, reason))]
    pub async fn fail(&self, job_id: i64, worker_id: &str, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                lease_expires_at = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(sanitize_db_text(reason, MAX_LAST_ERROR_LEN))
        .execute(&self.pool)
        .await
        .context("Failed to mark job as failed")?;

        if result.rows_affected() == 0 {
            return Err(lease_lost(job_id, worker_id));
        }

        tracing::debug!(job_id, "Job marked failed");
        Ok(())
    }

    /// Return a job to the queue, eligible again after `backoff`.
    ///
    /// Only valid while the job still has attempts left.
    #[tracing::instrument(skip(self, reason))]
    pub async fn requeue(
        &self,
        job_id: i64,
        worker_id: &str,
        reason: &str,
        backoff: Duration,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                locked_at = NULL,
                locked_by = NULL,
                lease_expires_at = NULL,
                available_at = NOW() + make_interval(secs => $4),
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1
                AND status = 'processing'
                AND locked_by = $2
                AND attempts < max_attempts
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(sanitize_db_text(reason, MAX_LAST_ERROR_LEN))
        .bind(backoff.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("Failed to requeue job")?;

        if result.rows_affected() == 0 {
            return Err(lease_lost(job_id, worker_id));
        }

        tracing::debug!(job_id, backoff_secs = backoff.as_secs(), "Job requeued");
        Ok(())
    }

    /// Fail every job whose lease expired with no attempts left.
    ///
    /// Such jobs can never be dequeued again and would otherwise stay
    /// `processing` forever. Returns the number of jobs failed.
    #[tracing::instrument(skip(self))]
    pub async fn reap_exhausted_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                lease_expires_at = NULL,
                last_error = 'lease expired after max attempts',
                updated_at = NOW()
            WHERE id IN (
                SELECT id
                FROM jobs
                WHERE status = 'processing'
                    AND lease_expires_at < NOW()
                    AND attempts >= max_attempts
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to reap expired job leases")?;

        let reaped = result.rows_affected();
        if reaped > 0 {
            tracing::warn!(count = reaped, "Failed jobs whose lease expired after max attempts");
        }
        Ok(reaped)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, job_id: i64) -> Result<Option<Job>> {
        sqlx::query_as::<Postgres, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch job")
    }

    /// Job counts per status for one job type.
    #[tracing::instrument(skip(self))]
    pub async fn stats(&self, job_type: JobType) -> Result<JobStats> {
        use sqlx::Row;
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM jobs
            WHERE job_type = $1
            "#,
        )
        .bind(job_type.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch job stats")?;

        Ok(JobStats {
            pending: row.get::<Option<i64>, _>("pending").unwrap_or(0),
            processing: row.get::<Option<i64>, _>("processing").unwrap_or(0),
            completed: row.get::<Option<i64>, _>("completed").unwrap_or(0),
            failed: row.get::<Option<i64>, _>("failed").unwrap_or(0),
        })
    }
}

fn lease_lost(job_id: i64, worker_id: &str) -> anyhow::Error {
    JobError::LeaseLost {
        job_id,
        worker_id: worker_id.to_string(),
    }
    .into()
}
