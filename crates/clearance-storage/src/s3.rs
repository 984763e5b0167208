use crate::keys::validate_key;
use crate::traits::{ByteStream, Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use clearance_core::StorageConfig;
use futures::StreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{ObjectStoreExt, PutPayload};
use std::time::Instant;

/// S3 (or S3-compatible) object store.
///
/// Credentials come from the standard AWS environment variables. Copies are
/// server-side and atomic per key; there is no atomicity across keys.
#[derive(Clone, Debug)]
pub struct S3Storage {
    store: AmazonS3,
    bucket: String,
}

impl S3Storage {
    /// `endpoint_url` selects an S3-compatible service such as MinIO
    /// (e.g. `http://localhost:9000`); path-style addressing is used then.
    pub fn new(bucket: String, region: String, endpoint_url: Option<String>) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region)
            .with_bucket_name(bucket.clone());

        if let Some(endpoint) = endpoint_url {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(allow_http)
                .with_virtual_hosted_style_request(false);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;

        Ok(S3Storage { store, bucket })
    }

    pub fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        let region = config.s3_region.clone().ok_or_else(|| {
            StorageError::ConfigError("S3_REGION or AWS_REGION not configured".to_string())
        })?;
        Self::new(config.s3_bucket.clone(), region, config.s3_endpoint.clone())
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn location(key: &str) -> StorageResult<Path> {
        validate_key(key)?;
        Ok(Path::from(key))
    }

    /// Log a failed call and turn it into a [`StorageError`], keeping `NotFound` distinct.
    fn failure(
        &self,
        op: &'static str,
        key: &str,
        start: Instant,
        err: ObjectStoreError,
        wrap: fn(String) -> StorageError,
    ) -> StorageError {
        if let ObjectStoreError::NotFound { .. } = err {
            return StorageError::NotFound(key.to_string());
        }
        tracing::error!(
            op,
            bucket = %self.bucket,
            key = %key,
            error = %err,
            duration_ms = start.elapsed().as_millis(),
            "S3 request failed"
        );
        wrap(format!("{}: {}", key, err))
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn upload_with_key(&self, storage_key: &str, data: Vec<u8>) -> StorageResult<()> {
        let location = Self::location(storage_key)?;
        let size = data.len();
        let start = Instant::now();

        self.store
            .put(&location, PutPayload::from(Bytes::from(data)))
            .await
            .map_err(|e| self.failure("put", storage_key, start, e, StorageError::UploadFailed))?;

        tracing::debug!(
            bucket = %self.bucket,
            key = %storage_key,
            size_bytes = size,
            duration_ms = start.elapsed().as_millis(),
            "S3 object written"
        );
        Ok(())
    }

    async fn download_stream(&self, storage_key: &str) -> StorageResult<ByteStream> {
        let location = Self::location(storage_key)?;
        let start = Instant::now();

        let object = self
            .store
            .get(&location)
            .await
            .map_err(|e| self.failure("get", storage_key, start, e, StorageError::DownloadFailed))?;

        let key = storage_key.to_string();
        let chunks = object.into_stream().map(move |chunk| {
            chunk.map_err(|e| {
                tracing::error!(key = %key, error = %e, "S3 object read failed mid-stream");
                StorageError::DownloadFailed(format!("{}: {}", key, e))
            })
        });
        Ok(Box::pin(chunks))
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let location = Self::location(storage_key)?;
        let start = Instant::now();

        match self.store.delete(&location).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {
                tracing::debug!(bucket = %self.bucket, key = %storage_key, "S3 object deleted");
                Ok(())
            }
            Err(e) => Err(self.failure("delete", storage_key, start, e, StorageError::DeleteFailed)),
        }
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let location = Self::location(storage_key)?;
        let start = Instant::now();

        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(self.failure("head", storage_key, start, e, StorageError::BackendError)),
        }
    }

    async fn copy(&self, from_key: &str, to_key: &str) -> StorageResult<()> {
        let from = Self::location(from_key)?;
        let to = Self::location(to_key)?;
        let start = Instant::now();

        self.store
            .copy(&from, &to)
            .await
            .map_err(|e| self.failure("copy", from_key, start, e, StorageError::CopyFailed))?;

        tracing::debug!(
            bucket = %self.bucket,
            from_key = %from_key,
            to_key = %to_key,
            duration_ms = start.elapsed().as_millis(),
            "S3 object copied"
        );
        Ok(())
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }
}
