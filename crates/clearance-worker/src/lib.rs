//! Clearance Worker
//!
//! Runs competing workers over the Postgres job queue: each worker leases one job
//! at a time, hands it to a [`JobHandler`], and records the outcome. Idle workers
//! wake on `LISTEN/NOTIFY` or after the poll interval.

pub mod context;
pub mod handlers;
pub mod queue;

pub use context::JobHandler;
pub use handlers::VirusScanHandler;
pub use queue::{compute_retry_backoff_seconds, WorkerPool, WorkerPoolConfig, MAX_RETRY_BACKOFF_SECS};
