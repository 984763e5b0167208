use async_trait::async_trait;
use std::sync::Arc;

use clearance_core::models::{Job, JobType};
use clearance_core::JobError;
use clearance_services::ScanOrchestrator;

use crate::context::JobHandler;

pub struct VirusScanHandler {
    orchestrator: Arc<ScanOrchestrator>,
}

impl VirusScanHandler {
    pub fn new(orchestrator: Arc<ScanOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for VirusScanHandler {
    fn job_type(&self) -> JobType {
        JobType::VirusScan
    }

    async fn handle(&self, job: &Job, worker_id: &str) -> Result<(), JobError> {
        let summary = self.orchestrator.process(job, worker_id).await?;
        tracing::debug!(
            upload_id = summary.upload_id,
            infected = summary.infected,
            resumed = summary.resumed,
            "Virus scan handled"
        );
        Ok(())
    }
}
