//! Per-job scan pipeline: download, validate, scan, record, relocate.

pub mod orchestrator;
pub mod scratch;
pub mod store;

pub use orchestrator::{ScanOrchestrator, ScanOrchestratorConfig, ScanStage, ScanSummary};
pub use scratch::ScratchSpace;
pub use store::ScanRecordStore;
