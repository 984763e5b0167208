#[cfg(feature = "storage-local")]
use crate::LocalStorage;
#[cfg(feature = "storage-s3")]
use crate::S3Storage;
use crate::{Storage, StorageBackend, StorageError, StorageResult};
use clearance_core::StorageConfig;
use std::sync::Arc;

/// Build the backend selected by `STORAGE_BACKEND`.
pub async fn create_storage(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    match config.backend {
        #[cfg(feature = "storage-s3")]
        StorageBackend::S3 => {
            let storage = S3Storage::from_config(config)?;
            tracing::info!(bucket = %storage.bucket(), "Using S3 storage backend");
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-s3"))]
        StorageBackend::S3 => Err(StorageError::ConfigError(
            "S3 storage backend not available (storage-s3 feature not enabled)".to_string(),
        )),

        #[cfg(feature = "storage-local")]
        StorageBackend::Local => {
            let base_path = config.local_storage_path.clone().ok_or_else(|| {
                StorageError::ConfigError("LOCAL_STORAGE_PATH not configured".to_string())
            })?;

            let storage = LocalStorage::new(base_path).await?;
            tracing::info!(root = %storage.root().display(), "Using local storage backend");
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-local"))]
        StorageBackend::Local => Err(StorageError::ConfigError(
            "Local storage backend not available (storage-local feature not enabled)".to_string(),
        )),
    }
}

#[cfg(all(test, feature = "storage-local"))]
mod tests {
    use super::*;
    use clearance_core::constants::{DEFAULT_SCANNED_KEY_PREFIX, DEFAULT_TEMP_KEY_PREFIX};

    fn storage_config(backend: StorageBackend, path: Option<String>) -> StorageConfig {
        StorageConfig {
            backend,
            s3_bucket: "bucket".to_string(),
            s3_region: None,
            s3_endpoint: None,
            local_storage_path: path,
            temp_key_prefix: DEFAULT_TEMP_KEY_PREFIX.to_string(),
            scanned_key_prefix: DEFAULT_SCANNED_KEY_PREFIX.to_string(),
        }
    }

    #[tokio::test]
    async fn creates_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = storage_config(
            StorageBackend::Local,
            Some(dir.path().display().to_string()),
        );
        let storage = create_storage(&config).await.unwrap();
        assert_eq!(storage.backend_type(), StorageBackend::Local);
    }

    #[tokio::test]
    async fn local_backend_without_path_is_a_config_error() {
        let config = storage_config(StorageBackend::Local, None);
        let result = create_storage(&config).await;
        assert!(matches!(result, Err(StorageError::ConfigError(_))));
    }
}
