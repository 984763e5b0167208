//! Worker pool: competing dequeue loops, LISTEN/NOTIFY wake-ups, lease reaping,
//! and failure recording.
//!
//! Shutdown: [`WorkerPool::shutdown`] stops every loop from leasing new jobs and
//! waits for in-flight jobs to finish. Jobs are never cancelled mid-flight; a job
//! stuck past `job_timeout` is abandoned and counted as a transient failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use clearance_core::constants::JOB_NOTIFY_CHANNEL;
use clearance_core::models::{Job, JobType};
use clearance_core::{JobError, WorkerConfig};
use clearance_db::JobRepository;

use crate::context::JobHandler;

/// Maximum delay in seconds before a requeued job becomes eligible again. Caps
/// exponential backoff so that high attempt counts do not produce excessively long
/// delays.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Computes backoff in seconds for a given attempt count (exponential with cap).
#[inline]
pub fn compute_retry_backoff_seconds(attempts: i32) -> u64 {
    2_u64
        .saturating_pow(attempts.max(0) as u32)
        .min(MAX_RETRY_BACKOFF_SECS)
}

#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Number of independent dequeue loops.
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Lease stamped on each dequeued job; must outlive `job_timeout`.
    pub lease: Duration,
    pub job_timeout: Duration,
    pub retry_transient_errors: bool,
    /// Interval between runs of the exhausted-lease reaper; `None` disables it.
    pub reap_interval: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(5),
            lease: Duration::from_secs(1920),
            job_timeout: Duration::from_secs(1800),
            retry_transient_errors: false,
            reap_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            lease: Duration::from_secs(config.lease_secs),
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            retry_transient_errors: config.retry_transient_errors,
            reap_interval: (config.stale_lease_reap_interval_secs > 0)
                .then(|| Duration::from_secs(config.stale_lease_reap_interval_secs)),
        }
    }
}

/// What to do with a job whose handler returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    /// Another worker owns the job now.
    Abandon,
    Requeue(Duration),
    Fail,
}

fn failure_action(err: &JobError, job: &Job, retry_transient_errors: bool) -> FailureAction {
    if matches!(err, JobError::LeaseLost { .. }) {
        return FailureAction::Abandon;
    }
    if retry_transient_errors && err.is_retryable() && job.can_retry() {
        let backoff = compute_retry_backoff_seconds(job.attempts);
        return FailureAction::Requeue(Duration::from_secs(backoff));
    }
    FailureAction::Fail
}

fn is_lease_lost(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<JobError>(),
        Some(JobError::LeaseLost { .. })
    )
}

/// `<hostname>-<8 hex chars>`, unique per process.
fn instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &nonce[..8])
}

pub struct WorkerPool {
    cancel: CancellationToken,
    worker_ids: Vec<String>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.concurrency` worker loops for `handler`'s job type.
    ///
    /// If `listen_pool` is `Some`, idle workers also wake on `NOTIFY` instead of
    /// waiting out the poll interval. If it is `None`, only polling is used.
    pub fn start(
        repository: JobRepository,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
        listen_pool: Option<PgPool>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let instance = instance_id();
        let job_type = handler.job_type();

        tracing::info!(
            instance = %instance,
            job_type = %job_type,
            concurrency = config.concurrency,
            poll_interval_ms = config.poll_interval.as_millis(),
            lease_secs = config.lease.as_secs(),
            retry_transient_errors = config.retry_transient_errors,
            listen_notify = listen_pool.is_some(),
            "Worker pool started"
        );

        let mut handles = Vec::new();

        if let Some(pool) = listen_pool {
            handles.push(tokio::spawn(listen_for_jobs(
                pool,
                job_type,
                wake.clone(),
                cancel.clone(),
            )));
        }

        if let Some(interval) = config.reap_interval {
            handles.push(tokio::spawn(reap_exhausted_leases(
                repository.clone(),
                interval,
                cancel.clone(),
            )));
        }

        let mut worker_ids = Vec::new();
        for n in 0..config.concurrency.max(1) {
            let worker = Worker {
                id: format!("{}-{}", instance, n),
                repository: repository.clone(),
                handler: handler.clone(),
                config: config.clone(),
                wake: wake.clone(),
                cancel: cancel.clone(),
            };
            worker_ids.push(worker.id.clone());
            handles.push(tokio::spawn(worker.run()));
        }

        Self {
            cancel,
            worker_ids,
            handles,
        }
    }

    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    /// Stop leasing new jobs and wait for every loop to exit.
    pub async fn shutdown(self) {
        tracing::info!("Initiating worker pool shutdown");
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker pool task ended abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

struct Worker {
    id: String,
    repository: JobRepository,
    handler: Arc<dyn JobHandler>,
    config: WorkerPoolConfig,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        tracing::info!(worker_id = %self.id, "Worker started");
        let job_type = self.handler.job_type();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self
                .repository
                .try_dequeue(job_type, &self.id, self.config.lease)
                .await
            {
                Ok(Some(job)) => {
                    self.execute(job).await;
                    continue;
                }
                Ok(None) => tracing::trace!(worker_id = %self.id, "No jobs available"),
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Failed to dequeue job")
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!(worker_id = %self.id, "Worker stopped");
    }

    /// Run one leased job in its own task so a panic cannot take the loop down.
    #[tracing::instrument(skip(self, job), fields(job.id = job.id, job_type = %job.job_type, attempts = job.attempts, worker_id = %self.id))]
    async fn execute(&self, job: Job) {
        let start = Instant::now();
        let handler = self.handler.clone();
        let worker_id = self.id.clone();
        let timeout = self.config.job_timeout;
        let leased = job.clone();

        let joined = tokio::spawn(async move {
            tokio::time::timeout(timeout, handler.handle(&leased, &worker_id)).await
        })
        .await;

        let err = match joined {
            Ok(Ok(Ok(()))) => {
                tracing::info!(
                    duration_ms = start.elapsed().as_millis(),
                    "Job completed"
                );
                return;
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(_)) => JobError::Transient(anyhow::anyhow!(
                "Job timed out after {} seconds",
                timeout.as_secs()
            )),
            Err(e) => {
                tracing::error!(error = %e, "Job handler panicked");
                self.fail(&job, &format!("handler panicked: {}", e)).await;
                return;
            }
        };

        match failure_action(&err, &job, self.config.retry_transient_errors) {
            FailureAction::Abandon => {
                tracing::warn!(error = %err, "Lease lost before the job finished, leaving it to its new owner");
            }
            FailureAction::Requeue(backoff) => {
                tracing::warn!(
                    error = %err,
                    kind = err.kind(),
                    backoff_secs = backoff.as_secs(),
                    max_attempts = job.max_attempts,
                    "Job failed, scheduling retry"
                );
                if let Err(e) = self
                    .repository
                    .requeue(job.id, &self.id, &err.to_string(), backoff)
                    .await
                {
                    log_outcome_error(&e, "requeue");
                }
            }
            FailureAction::Fail => {
                tracing::error!(
                    error = %err,
                    kind = err.kind(),
                    duration_ms = start.elapsed().as_millis(),
                    "Job failed"
                );
                self.fail(&job, &err.to_string()).await;
            }
        }
    }

    async fn fail(&self, job: &Job, reason: &str) {
        if let Err(e) = self.repository.fail(job.id, &self.id, reason).await {
            log_outcome_error(&e, "fail");
        }
    }
}

fn log_outcome_error(err: &anyhow::Error, action: &'static str) {
    if is_lease_lost(err) {
        tracing::warn!(action, "Lease lost before the outcome could be recorded");
    } else {
        tracing::error!(action, error = %err, "Failed to record job outcome");
    }
}

async fn reap_exhausted_leases(
    repository: JobRepository,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = repository.reap_exhausted_leases().await {
                    tracing::error!(error = %e, "Exhausted lease reaper failed");
                }
            }
        }
    }
}

/// Forward `NOTIFY`s for `job_type` to one idle worker, reconnecting on failure.
async fn listen_for_jobs(
    pool: PgPool,
    job_type: JobType,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = PgListener::connect_with(&pool) => result,
        };

        match connected {
            Ok(mut listener) => {
                if let Err(e) = listener.listen(JOB_NOTIFY_CHANNEL).await {
                    tracing::warn!(error = %e, "LISTEN failed, will retry");
                } else {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            received = listener.recv() => match received {
                                Ok(notification) => {
                                    if notification.payload() == job_type.as_str() {
                                        wake.notify_one();
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "LISTEN connection lost, reconnecting");
                                    break;
                                }
                            },
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "PgListener connect failed, will retry");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(LISTEN_RETRY_DELAY) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clearance_core::models::JobStatus;

    fn job(attempts: i32, max_attempts: i32) -> Job {
        let now = Utc::now();
        Job {
            id: 1,
            job_type: JobType::VirusScan,
            payload: serde_json::json!({ "uploadId": 1 }),
            status: JobStatus::Processing,
            attempts,
            max_attempts,
            locked_at: Some(now),
            locked_by: Some("w".to_string()),
            lease_expires_at: Some(now),
            available_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transient() -> JobError {
        JobError::Transient(anyhow::anyhow!("connection reset"))
    }

    #[test]
    fn retry_backoff_exponential_then_capped() {
        assert_eq!(compute_retry_backoff_seconds(0), 1);
        assert_eq!(compute_retry_backoff_seconds(1), 2);
        assert_eq!(compute_retry_backoff_seconds(2), 4);
        assert_eq!(compute_retry_backoff_seconds(8), 256);
        assert_eq!(compute_retry_backoff_seconds(9), MAX_RETRY_BACKOFF_SECS);
        assert_eq!(compute_retry_backoff_seconds(100), MAX_RETRY_BACKOFF_SECS);
        assert_eq!(compute_retry_backoff_seconds(-1), 1);
    }

    #[test]
    fn failures_are_terminal_by_default() {
        assert_eq!(
            failure_action(&transient(), &job(1, 5), false),
            FailureAction::Fail
        );
    }

    #[test]
    fn transient_failure_requeued_when_enabled() {
        assert_eq!(
            failure_action(&transient(), &job(2, 5), true),
            FailureAction::Requeue(Duration::from_secs(4))
        );
        let relocation = JobError::Relocation(anyhow::anyhow!("delete failed"));
        assert!(matches!(
            failure_action(&relocation, &job(1, 5), true),
            FailureAction::Requeue(_)
        ));
    }

    #[test]
    fn exhausted_attempts_fail_even_when_retry_enabled() {
        assert_eq!(
            failure_action(&transient(), &job(5, 5), true),
            FailureAction::Fail
        );
    }

    #[test]
    fn validation_errors_never_requeued() {
        let err = JobError::Validation("nested archive".to_string());
        assert_eq!(failure_action(&err, &job(1, 5), true), FailureAction::Fail);
        let err = JobError::DataIntegrity("upload 9 not found".to_string());
        assert_eq!(failure_action(&err, &job(1, 5), true), FailureAction::Fail);
    }

    #[test]
    fn lost_lease_is_abandoned() {
        let err = JobError::LeaseLost {
            job_id: 1,
            worker_id: "w".to_string(),
        };
        assert_eq!(failure_action(&err, &job(1, 5), true), FailureAction::Abandon);
        assert!(is_lease_lost(&err.into()));
        assert!(!is_lease_lost(&anyhow::anyhow!("generic error")));
    }

    #[test]
    fn pool_config_from_worker_config() {
        let worker = WorkerConfig {
            scan_directory: "/tmp/scan".to_string(),
            concurrency: 3,
            poll_interval_ms: 250,
            lease_secs: 120,
            job_timeout_secs: 60,
            max_attempts: 5,
            retry_transient_errors: true,
            stale_lease_reap_interval_secs: 0,
        };
        let config = WorkerPoolConfig::from(&worker);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.lease, Duration::from_secs(120));
        assert!(config.retry_transient_errors);
        assert!(config.reap_interval.is_none());
    }

    #[test]
    fn instance_id_has_random_suffix() {
        let a = instance_id();
        let b = instance_id();
        assert_ne!(a, b);
        assert_eq!(a.rsplit('-').next().map(str::len), Some(8));
    }
}
