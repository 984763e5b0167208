use crate::keys::validate_key;
use crate::traits::{ByteStream, Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Filesystem-backed object store for development and tests.
///
/// Keys map to paths under `root`. Writes land in a sibling staging file and are
/// renamed into place, so a key either holds a complete object or does not exist.
/// Relocation relies on that when it skips a copy whose destination is present.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Open (and create if missing) a store rooted at `root`.
    pub async fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Cannot create local storage root {}: {}",
                root.display(),
                e
            ))
        })?;
        let root = fs::canonicalize(&root).await?;
        Ok(LocalStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to its path, refusing anything that escapes the root.
    async fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        let path = self.root.join(key);

        // A symlinked directory inside the root could still point elsewhere.
        if let Ok(real) = fs::canonicalize(&path).await {
            if !real.starts_with(&self.root) {
                return Err(StorageError::InvalidKey(format!(
                    "{} resolves outside the storage root",
                    key
                )));
            }
        }
        Ok(path)
    }

    /// Move a fully written staging file onto `dest`.
    async fn publish(&self, staging: &Path, dest: &Path) -> StorageResult<()> {
        if let Err(e) = fs::rename(staging, dest).await {
            let _ = fs::remove_file(staging).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Hidden sibling of `dest` used while an object is being written.
fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.partial", name, Uuid::new_v4().simple()))
}

async fn create_parent(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload_with_key(&self, storage_key: &str, data: Vec<u8>) -> StorageResult<()> {
        let dest = self.resolve(storage_key).await?;
        create_parent(&dest).await?;
        let start = Instant::now();

        let staging = staging_path(&dest);
        let written = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&staging).await;
            return Err(StorageError::UploadFailed(format!("{}: {}", storage_key, e)));
        }
        self.publish(&staging, &dest).await?;

        tracing::debug!(
            key = %storage_key,
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_millis(),
            "Local object written"
        );
        Ok(())
    }

    async fn download_stream(&self, storage_key: &str) -> StorageResult<ByteStream> {
        let path = self.resolve(storage_key).await?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(storage_key.to_string()))
            }
            Err(e) => return Err(StorageError::DownloadFailed(format!("{}: {}", storage_key, e))),
        };

        let key = storage_key.to_string();
        let chunks = tokio_util::io::ReaderStream::new(file).map(move |chunk| {
            chunk.map_err(|e| {
                tracing::error!(key = %key, error = %e, "Local object read failed mid-stream");
                StorageError::DownloadFailed(format!("{}: {}", key, e))
            })
        });
        Ok(Box::pin(chunks))
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let path = self.resolve(storage_key).await?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(key = %storage_key, "Local object deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::DeleteFailed(format!("{}: {}", storage_key, e))),
        }
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let path = self.resolve(storage_key).await?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn copy(&self, from_key: &str, to_key: &str) -> StorageResult<()> {
        let source = self.resolve(from_key).await?;
        let dest = self.resolve(to_key).await?;
        create_parent(&dest).await?;

        let staging = staging_path(&dest);
        match fs::copy(&source, &staging).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let _ = fs::remove_file(&staging).await;
                return Err(StorageError::NotFound(from_key.to_string()));
            }
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                return Err(StorageError::CopyFailed(format!(
                    "{} -> {}: {}",
                    from_key, to_key, e
                )));
            }
        }
        self.publish(&staging, &dest).await?;

        tracing::debug!(from_key = %from_key, to_key = %to_key, "Local object copied");
        Ok(())
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}

#[cfg(all(test, feature = "storage-local"))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn contents(storage: &LocalStorage, key: &str) -> Vec<u8> {
        let mut stream = storage.download_stream(key).await.unwrap();
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        data
    }

    async fn leftovers(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names
    }

    #[tokio::test]
    async fn written_object_streams_back() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        storage
            .upload_with_key("uploads/temp/u1/f1", b"dicom bytes".to_vec())
            .await
            .unwrap();

        assert_eq!(contents(&storage, "uploads/temp/u1/f1").await, b"dicom bytes");
        assert_eq!(
            leftovers(&storage.root().join("uploads/temp/u1")).await,
            vec!["f1".to_string()]
        );
    }

    #[tokio::test]
    async fn keys_outside_the_root_are_rejected() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        let result = storage.download_stream("../../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.delete("uploads/../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.exists("/etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_directory_cannot_escape() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        let storage = LocalStorage::new(dir.path().join("store")).await.unwrap();
        std::os::unix::fs::symlink(outside.path(), storage.root().join("link")).unwrap();

        let result = storage.exists("link/secret").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        let result = storage.download_stream("uploads/temp/u1/missing").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));

        let result = storage
            .copy("uploads/temp/u1/missing", "uploads/scanned/u1/missing")
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert!(!storage.exists("uploads/scanned/u1/missing").await.unwrap());

        assert!(storage.delete("uploads/temp/u1/missing").await.is_ok());
    }

    #[tokio::test]
    async fn copy_then_delete_relocates() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        storage
            .upload_with_key("uploads/temp/u1/f1", b"payload".to_vec())
            .await
            .unwrap();
        storage
            .copy("uploads/temp/u1/f1", "uploads/scanned/u1/f1")
            .await
            .unwrap();
        storage.delete("uploads/temp/u1/f1").await.unwrap();

        assert!(!storage.exists("uploads/temp/u1/f1").await.unwrap());
        assert_eq!(contents(&storage, "uploads/scanned/u1/f1").await, b"payload");
        assert_eq!(
            leftovers(&storage.root().join("uploads/scanned/u1")).await,
            vec!["f1".to_string()]
        );
    }

    #[tokio::test]
    async fn copy_overwrites_destination() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        storage.upload_with_key("a/src", b"new".to_vec()).await.unwrap();
        storage.upload_with_key("a/dst", b"old".to_vec()).await.unwrap();
        storage.copy("a/src", "a/dst").await.unwrap();

        assert_eq!(contents(&storage, "a/dst").await, b"new");
    }
}
