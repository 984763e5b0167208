use async_trait::async_trait;
use clamav_client::{clean, Tcp};
use clearance_core::ClamAvConfig;
use std::path::Path;
use std::time::{Duration, Instant};

use super::{ScanEngine, ScanError, ScanOutcome, ScanVerdict};

/// clamd client streaming files over INSTREAM.
///
/// The file is read on this host and streamed to the daemon, so clamd does not
/// need access to the scan directory. Always fail-closed.
#[derive(Clone, Debug)]
pub struct ClamAvScanner {
    host: String,
    port: u16,
    /// Timeout in seconds for each scan operation (default: 300)
    timeout_secs: u64,
}

impl ClamAvScanner {
    pub fn new(host: String, port: u16) -> Self {
        Self::with_timeout(host, port, 300)
    }

    /// Create with a custom scan timeout (for large files or slow ClamAV instances).
    pub fn with_timeout(host: String, port: u16, timeout_secs: u64) -> Self {
        Self {
            host,
            port,
            timeout_secs,
        }
    }

    pub fn from_config(config: &ClamAvConfig) -> Self {
        Self::with_timeout(config.host.clone(), config.port, config.timeout_secs)
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check that the daemon answers `PING`.
    pub async fn ping(&self) -> Result<(), ScanError> {
        let address = self.address();
        let response = tokio::time::timeout(
            Duration::from_secs(10),
            tokio::task::spawn_blocking(move || {
                let connection = Tcp {
                    host_address: address.as_str(),
                };
                clamav_client::ping(connection)
            }),
        )
        .await
        .map_err(|_| ScanError::Timeout(10))?
        .map_err(|e| ScanError::Task(e.to_string()))?
        .map_err(|e| ScanError::Connection(e.to_string()))?;

        if response.starts_with(b"PONG") {
            Ok(())
        } else {
            Err(ScanError::Engine(report_text(&response)))
        }
    }
}

#[async_trait]
impl ScanEngine for ClamAvScanner {
    async fn scan(&self, path: &Path) -> Result<ScanOutcome, ScanError> {
        let start = Instant::now();
        tracing::debug!(host = %self.host, port = %self.port, path = %path.display(), "Starting ClamAV scan");
        let address = self.address();
        let path = path.to_path_buf();
        let timeout_secs = self.timeout_secs;

        // Sync client inside spawn_blocking; its tokio API is not Send across awaits.
        let result = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            tokio::task::spawn_blocking(move || {
                let connection = Tcp {
                    host_address: address.as_str(),
                };
                clamav_client::scan_file(&path, connection, None)
            }),
        )
        .await;

        let response = match result {
            Ok(Ok(Ok(bytes))) => bytes,
            Ok(Ok(Err(e))) => {
                tracing::error!(error = %e, "ClamAV scan failed");
                return Err(ScanError::Connection(e.to_string()));
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "ClamAV scan task panicked");
                return Err(ScanError::Task(e.to_string()));
            }
            Err(_) => {
                tracing::error!(timeout_secs, "ClamAV scan timeout");
                return Err(ScanError::Timeout(timeout_secs));
            }
        };

        let outcome = interpret_response(&response)?;
        tracing::info!(
            duration_ms = start.elapsed().as_millis(),
            infected = outcome.verdict == ScanVerdict::Infected,
            "File scan completed"
        );
        Ok(outcome)
    }
}

fn report_text(response: &[u8]) -> String {
    String::from_utf8_lossy(response)
        .replace('\0', "")
        .trim()
        .to_string()
}

/// Map a raw clamd reply to a verdict.
///
/// Only `... FOUND` counts as infected; any reply that is neither clean nor a
/// detection (size limit exceeded, daemon error) is an error, never a verdict.
pub(crate) fn interpret_response(response: &[u8]) -> Result<ScanOutcome, ScanError> {
    let raw_report = report_text(response);
    match clean(response) {
        Ok(true) => Ok(ScanOutcome {
            verdict: ScanVerdict::Clean,
            raw_report,
        }),
        Ok(false) if raw_report.ends_with("FOUND") => Ok(ScanOutcome {
            verdict: ScanVerdict::Infected,
            raw_report,
        }),
        Ok(false) => Err(ScanError::Engine(raw_report)),
        Err(e) => Err(ScanError::Engine(format!(
            "unparseable ClamAV response: {}",
            e
        ))),
    }
}
