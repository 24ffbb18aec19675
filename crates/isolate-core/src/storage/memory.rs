//! In-process store, for tests and dry runs.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use super::{ObjectReader, PushState, StorageBackend, UploadItem};
use crate::error::StorageError;

#[derive(Default)]
struct Inner {
    objects: HashMap<String, Vec<u8>>,
    contains_calls: Vec<Vec<String>>,
    pushed: Vec<String>,
}

/// Keeps objects in a map and records every call for inspection.
pub struct MemoryBackend {
    namespace: String,
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    /// Empty store serving `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object without recording a push.
    pub fn insert(&self, digest: &str, data: Vec<u8>) {
        self.lock().objects.insert(digest.to_string(), data);
    }

    /// Content stored under `digest`, if any.
    pub fn get(&self, digest: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(digest).cloned()
    }

    /// Digests passed to each `contains` call, in call order.
    pub fn contains_calls(&self) -> Vec<Vec<String>> {
        self.lock().contains_calls.clone()
    }

    /// Digests pushed, in push order.
    pub fn pushed(&self) -> Vec<String> {
        self.lock().pushed.clone()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn location(&self) -> &str {
        "memory:"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn connect(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn contains(
        &self,
        items: &[UploadItem],
    ) -> Result<HashMap<String, PushState>, StorageError> {
        let mut inner = self.lock();
        inner
            .contains_calls
            .push(items.iter().map(|i| i.digest.clone()).collect());
        Ok(items
            .iter()
            .filter(|i| !inner.objects.contains_key(&i.digest))
            .map(|i| (i.digest.clone(), PushState::default()))
            .collect())
    }

    async fn push(&self, item: &UploadItem, _state: PushState) -> Result<(), StorageError> {
        let mut data = Vec::with_capacity(item.size as usize);
        item.open()
            .await?
            .read_to_end(&mut data)
            .await
            .map_err(|source| StorageError::Io {
                path: item.path.clone(),
                source,
            })?;
        if data.len() as u64 != item.size {
            return Err(StorageError::PushRejected {
                digest: item.digest.clone(),
                reason: format!("expected {} bytes, read {}", item.size, data.len()),
            });
        }
        let mut inner = self.lock();
        inner.pushed.push(item.digest.clone());
        inner.objects.insert(item.digest.clone(), data);
        Ok(())
    }

    async fn fetch(&self, digest: &str, offset: u64) -> Result<ObjectReader, StorageError> {
        let data = self
            .get(digest)
            .ok_or_else(|| StorageError::NotFound(digest.to_string()))?;
        let start = (offset as usize).min(data.len());
        Ok(Box::new(Cursor::new(data[start..].to_vec())))
    }

    async fn fetch_url(&self, _digest: &str) -> Result<String, StorageError> {
        Err(StorageError::Unsupported("fetch_url"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_with_offset() {
        let store = MemoryBackend::new("ns");
        store.insert("abc", b"hello world".to_vec());
        let mut out = String::new();
        store
            .fetch("abc", 6)
            .await
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "world");
        assert!(matches!(
            store.fetch("nope", 0).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.fetch_url("abc").await,
            Err(StorageError::Unsupported(_))
        ));
    }
}
