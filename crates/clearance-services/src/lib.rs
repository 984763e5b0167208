//! Clearance Services Layer
//!
//! Hosts the scan orchestration that turns a leased virus-scan job into a recorded
//! verdict and a relocated object, plus the antivirus engine it drives. Queue
//! mechanics stay in clearance-db and clearance-worker.

pub mod scan;
pub mod scanner;

pub use clearance_processing::{ArchiveLimits, ArchiveValidator};
pub use clearance_storage::{create_storage, KeyLayout, Storage, StorageError, StorageResult};
pub use scan::{
    ScanOrchestrator, ScanOrchestratorConfig, ScanRecordStore, ScanStage, ScanSummary,
    ScratchSpace,
};
#[cfg(feature = "clamav")]
pub use scanner::ClamAvScanner;
pub use scanner::{ScanEngine, ScanError, ScanOutcome, ScanVerdict};
