//! Antivirus engine seam.

#[cfg(feature = "clamav")]
pub mod clamav;

use async_trait::async_trait;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::Path;
use thiserror::Error;

#[cfg(feature = "clamav")]
pub use clamav::ClamAvScanner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected,
}

impl Display for ScanVerdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ScanVerdict::Clean => write!(f, "clean"),
            ScanVerdict::Infected => write!(f, "infected"),
        }
    }
}

/// Verdict plus the engine's raw response, NUL bytes already removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub verdict: ScanVerdict,
    pub raw_report: String,
}

impl ScanOutcome {
    pub fn is_infected(&self) -> bool {
        self.verdict == ScanVerdict::Infected
    }
}

/// Anything that keeps the engine from producing a verdict.
///
/// None of these are ever interpreted as clean.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Scan engine unreachable: {0}")]
    Connection(String),

    #[error("Scan engine reported an error: {0}")]
    Engine(String),

    #[error("Scan timed out after {0} seconds")]
    Timeout(u64),

    #[error("Scan task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait ScanEngine: Send + Sync {
    /// Scan a file on the local filesystem.
    async fn scan(&self, path: &Path) -> Result<ScanOutcome, ScanError>;
}
