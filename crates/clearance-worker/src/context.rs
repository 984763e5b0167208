//! Job handler seam
//!
//! The worker pool knows nothing about what a job does. It leases jobs of the
//! handler's type and hands each one to [`JobHandler::handle`].

use async_trait::async_trait;

use clearance_core::models::{Job, JobType};
use clearance_core::JobError;

/// Processes leased jobs of one [`JobType`].
///
/// On `Ok` the handler must already have marked the job completed, in the same
/// transaction as its own final write. On `Err` the pool records the failure or
/// requeues the job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn handle(&self, job: &Job, worker_id: &str) -> Result<(), JobError>;
}
