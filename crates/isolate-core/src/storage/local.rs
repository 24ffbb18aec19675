//! Local directory store: `<root>/<namespace>/<digest[..2]>/<digest>`.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::{ObjectReader, PushState, StorageBackend, UploadItem};
use crate::error::StorageError;

/// Content-addressed store in a plain directory.
pub struct LocalBackend {
    root: PathBuf,
    namespace: String,
    location: String,
}

impl LocalBackend {
    /// Store rooted at `root`; the directory is created by `connect`.
    pub fn new(root: &Path, namespace: impl Into<String>) -> Self {
        Self {
            root: root.to_path_buf(),
            namespace: namespace.into(),
            location: root.display().to_string(),
        }
    }

    /// Where the object `digest` lives, sharded by its first two hex digits.
    pub fn object_path(&self, digest: &str) -> PathBuf {
        let shard = digest.get(..2).unwrap_or(digest);
        self.root.join(&self.namespace).join(shard).join(digest)
    }

    fn io_error(path: &Path, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn location(&self) -> &str {
        &self.location
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn connect(&self) -> Result<(), StorageError> {
        let dir = self.root.join(&self.namespace);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::Unreachable {
                location: self.location.clone(),
                reason: e.to_string(),
            })
    }

    async fn contains(
        &self,
        items: &[UploadItem],
    ) -> Result<HashMap<String, PushState>, StorageError> {
        let mut missing = HashMap::new();
        for item in items {
            let path = self.object_path(&item.digest);
            let present = tokio::fs::try_exists(&path)
                .await
                .map_err(|e| Self::io_error(&path, e))?;
            if !present {
                missing.insert(item.digest.clone(), PushState::default());
            }
        }
        Ok(missing)
    }

    async fn push(&self, item: &UploadItem, _state: PushState) -> Result<(), StorageError> {
        let dest = self.object_path(&item.digest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_error(parent, e))?;
        }
        // Copy then rename so readers never see a partial object.
        let tmp = dest.with_extension("tmp");
        let mut src = item.open().await?;
        let mut out = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Self::io_error(&tmp, e))?;
        let copied = tokio::io::copy(&mut src, &mut out)
            .await
            .map_err(|e| Self::io_error(&tmp, e))?;
        out.flush().await.map_err(|e| Self::io_error(&tmp, e))?;
        drop(out);
        if copied != item.size {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::PushRejected {
                digest: item.digest.clone(),
                reason: format!("expected {} bytes, copied {}", item.size, copied),
            });
        }
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| Self::io_error(&dest, e))?;
        debug!("Stored {} ({} bytes)", item.digest, copied);
        Ok(())
    }

    async fn fetch(&self, digest: &str, offset: u64) -> Result<ObjectReader, StorageError> {
        let path = self.object_path(digest);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(digest.to_string()))
            }
            Err(e) => return Err(Self::io_error(&path, e)),
        };
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| Self::io_error(&path, e))?;
        }
        Ok(Box::new(file))
    }

    async fn fetch_url(&self, digest: &str) -> Result<String, StorageError> {
        Ok(format!("file://{}", self.object_path(digest).display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::HashAlgo;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_push_then_fetch() {
        let src = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let path = src.path().join("data.txt");
        std::fs::write(&path, "hello world").unwrap();
        let item = UploadItem {
            digest: HashAlgo::Sha1.digest_bytes(b"hello world"),
            size: 11,
            high_priority: false,
            compression_level: 6,
            path,
        };

        let store = LocalBackend::new(store_dir.path(), "default-gzip");
        store.connect().await.unwrap();
        let missing = store.contains(std::slice::from_ref(&item)).await.unwrap();
        assert!(missing.contains_key(&item.digest));

        store.push(&item, PushState::default()).await.unwrap();
        assert!(store
            .contains(std::slice::from_ref(&item))
            .await
            .unwrap()
            .is_empty());
        let object = store.object_path(&item.digest);
        assert!(object.starts_with(store_dir.path().join("default-gzip").join(&item.digest[..2])));

        let mut out = String::new();
        store
            .fetch(&item.digest, 6)
            .await
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "world");

        let url = store.fetch_url(&item.digest).await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(matches!(
            store.fetch("0000", 0).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_push_of_changed_file_is_rejected() {
        let src = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let path = src.path().join("data.txt");
        std::fs::write(&path, "grown since hashing").unwrap();
        let mut item = UploadItem {
            digest: HashAlgo::Sha1.digest_bytes(b"short"),
            size: 5,
            high_priority: false,
            compression_level: 6,
            path,
        };

        let store = LocalBackend::new(store_dir.path(), "default-gzip");
        store.connect().await.unwrap();
        assert!(matches!(
            store.push(&item, PushState::default()).await,
            Err(StorageError::PushRejected { .. })
        ));
        let object = store.object_path(&item.digest);
        assert!(!object.exists());
        assert!(!object.with_extension("tmp").exists());

        item.path = src.path().join("gone.txt");
        assert!(matches!(
            store.push(&item, PushState::default()).await,
            Err(StorageError::Io { .. })
        ));
    }
}
