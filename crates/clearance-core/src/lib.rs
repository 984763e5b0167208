//! Clearance Core Library
//!
//! Domain models, error types and configuration shared by every component of the
//! post-upload scan pipeline: the job queue, the scan orchestrator and the workers.

pub mod config;
pub mod constants;
pub mod error;
pub mod models;
pub mod storage_types;

// Re-export commonly used types
pub use config::{
    ArchiveLimitsConfig, ClamAvConfig, Config, DatabaseConfig, LogFormat, StorageConfig,
    WorkerConfig,
};
pub use error::{JobError, JobResultExt};
pub use storage_types::StorageBackend;
