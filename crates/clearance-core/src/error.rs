//! Job execution error taxonomy
//!
//! Every failure a job handler can produce falls into one of these classes. The
//! worker uses the class to decide between failing the job outright and, when the
//! retry policy is enabled, putting it back on the queue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// The job references state that does not exist or cannot be decoded.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// The uploaded content is unsafe or does not meet the content precondition.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Storage, database or scan engine I/O failed or timed out.
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),

    /// The object was only partially relocated. Recorded progress lets a
    /// re-delivered job resume where this one stopped.
    #[error("relocation failed: {0:#}")]
    Relocation(anyhow::Error),

    /// The job's lease was reclaimed by another worker before it could be finished.
    #[error("lease on job {job_id} is no longer held by {worker_id}")]
    LeaseLost { job_id: i64, worker_id: String },
}

impl JobError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transient(_) | JobError::Relocation(_))
    }

    /// Short machine-friendly class name, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::DataIntegrity(_) => "data_integrity",
            JobError::Validation(_) => "validation",
            JobError::Transient(_) => "transient",
            JobError::Relocation(_) => "relocation",
            JobError::LeaseLost { .. } => "lease_lost",
        }
    }
}

/// Extension trait for tagging fallible results with a [`JobError`] class.
pub trait JobResultExt<T> {
    /// Classify the error as a transient I/O failure.
    fn transient(self, context: &'static str) -> Result<T, JobError>;

    /// Classify the error as a partial relocation failure.
    fn relocation(self, context: &'static str) -> Result<T, JobError>;
}

impl<T, E: Into<anyhow::Error>> JobResultExt<T> for Result<T, E> {
    fn transient(self, context: &'static str) -> Result<T, JobError> {
        self.map_err(|e| JobError::Transient(e.into().context(context)))
    }

    fn relocation(self, context: &'static str) -> Result<T, JobError> {
        self.map_err(|e| JobError::Relocation(e.into().context(context)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(JobError::Transient(anyhow::anyhow!("timeout")).is_retryable());
        assert!(JobError::Relocation(anyhow::anyhow!("delete failed")).is_retryable());
        assert!(!JobError::Validation("nested archive".into()).is_retryable());
        assert!(!JobError::DataIntegrity("upload 7 not found".into()).is_retryable());
        assert!(!JobError::LeaseLost {
            job_id: 1,
            worker_id: "w".into()
        }
        .is_retryable());
    }

    #[test]
    fn result_ext_keeps_context_in_message() {
        let res: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        let err = res.transient("Failed to download object").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Failed to download object"));
        assert!(msg.contains("reset by peer"));
        assert_eq!(err.kind(), "transient");
    }

    #[test]
    fn downcasts_through_anyhow() {
        let err: anyhow::Error = JobError::Validation("hidden entry".into()).into();
        let kind = err.downcast_ref::<JobError>().map(JobError::kind);
        assert_eq!(kind, Some("validation"));
    }
}
