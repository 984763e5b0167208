use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clearance_cli::{init_telemetry, shutdown_signal};
use clearance_core::Config;
use clearance_db::{setup_database, JobRepository, UploadRepository};
use clearance_services::{
    create_storage, ArchiveLimits, ClamAvScanner, KeyLayout, ScanOrchestrator, Storage,
    ScanOrchestratorConfig,
};
use clearance_worker::{VirusScanHandler, WorkerPool, WorkerPoolConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_telemetry(config.log_format)?;
    config.validate()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        storage_backend = %config.storage.backend,
        concurrency = config.worker.concurrency,
        "Starting clearance worker"
    );

    let pool = setup_database(&config.database).await?;

    let storage = create_storage(&config.storage)
        .await
        .context("Failed to initialize storage")?;
    tracing::info!(backend = %storage.backend_type(), "Storage initialized");

    let scan_dir = PathBuf::from(&config.worker.scan_directory);
    tokio::fs::create_dir_all(&scan_dir)
        .await
        .with_context(|| format!("Failed to create scan directory {}", scan_dir.display()))?;

    let scanner = ClamAvScanner::from_config(&config.clamav);
    match scanner.ping().await {
        Ok(()) => tracing::info!(
            host = %config.clamav.host,
            port = config.clamav.port,
            "ClamAV reachable"
        ),
        // Scans fail closed until the daemon comes up; the worker keeps running.
        Err(e) => tracing::warn!(
            error = %e,
            host = %config.clamav.host,
            port = config.clamav.port,
            "ClamAV not reachable at startup"
        ),
    }

    let orchestrator = Arc::new(ScanOrchestrator::new(
        Arc::new(UploadRepository::new(pool.clone())),
        storage,
        Arc::new(scanner),
        ScanOrchestratorConfig {
            scan_dir,
            keys: KeyLayout::new(
                &config.storage.temp_key_prefix,
                &config.storage.scanned_key_prefix,
            ),
            archive_limits: ArchiveLimits::from(&config.archive),
        },
    ));

    let workers = WorkerPool::start(
        JobRepository::new(pool.clone()),
        Arc::new(VirusScanHandler::new(orchestrator)),
        WorkerPoolConfig::from(&config.worker),
        Some(pool.clone()),
    );
    tracing::info!(workers = ?workers.worker_ids(), "Worker pool running");

    shutdown_signal().await;

    workers.shutdown().await;
    pool.close().await;
    tracing::info!("Clearance worker stopped");

    Ok(())
}
