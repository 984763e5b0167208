//! Object store seam used by the scan pipeline.

use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

/// Failures of a single object operation.
///
/// `NotFound` is kept apart from the rest: callers treat a missing object as a
/// data problem, everything else as an I/O problem.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object write failed: {0}")]
    UploadFailed(String),

    #[error("Object read failed: {0}")]
    DownloadFailed(String),

    #[error("Object delete failed: {0}")]
    DeleteFailed(String),

    #[error("Object copy failed: {0}")]
    CopyFailed(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Object store error: {0}")]
    BackendError(String),

    #[error("Local storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage misconfigured: {0}")]
    ConfigError(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Stream of object chunks returned by [`Storage::download_stream`].
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Key-addressed object store.
///
/// The object store is reliable per key but offers no atomicity across keys:
/// a copy followed by a delete can stop half way, and callers must cope with that.
///
/// **Key format:** see [`crate::keys::KeyLayout`].
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write `data` under `storage_key`, replacing any existing object.
    async fn upload_with_key(&self, storage_key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Read an object as a stream of chunks. Missing keys yield `NotFound`.
    async fn download_stream(&self, storage_key: &str) -> StorageResult<ByteStream>;

    /// Remove an object. Deleting a missing key succeeds.
    async fn delete(&self, storage_key: &str) -> StorageResult<()>;

    async fn exists(&self, storage_key: &str) -> StorageResult<bool>;

    /// Copy an object, overwriting `to_key`. A missing source yields `NotFound`.
    async fn copy(&self, from_key: &str, to_key: &str) -> StorageResult<()>;

    fn backend_type(&self) -> StorageBackend;
}
