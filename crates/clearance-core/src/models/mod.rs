pub mod job;
pub mod upload;

pub use job::{Job, JobPayload, JobStats, JobStatus, JobType, VirusScanPayload};
pub use upload::{is_valid_file_id, NewUpload, RelocationStage, Upload};
