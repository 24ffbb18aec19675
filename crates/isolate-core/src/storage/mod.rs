//! Content-addressed storage - backends and the upload stage
//!
//! Features:
//! - Object-safe `StorageBackend` trait (memory, local directory, S3/R2)
//! - Two-phase upload: `contains` on growing batches, then `push` the misses
//! - Content dedup by digest on top of the path dedup done upstream
//! - Bounded push concurrency, high-priority items first

mod local;
mod memory;
mod s3;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use s3::{get_config_path, load_config, load_config_from, CloudConfig, S3Backend, S3Config};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{IsolateError, Result, StorageError};

/// Batch sizes for successive `contains` calls; the last one repeats.
pub const CONTAINS_BATCH_SIZES: [usize; 6] = [20, 20, 50, 50, 50, 100];

/// Concurrent pushes per batch.
pub const DEFAULT_PUSH_CONCURRENCY: usize = 8;

pub fn contains_batch_size(index: usize) -> usize {
    CONTAINS_BATCH_SIZES
        .get(index)
        .copied()
        .unwrap_or(CONTAINS_BATCH_SIZES[CONTAINS_BATCH_SIZES.len() - 1])
}

/// One unique piece of content to make available in the store.
///
/// The content is only opened when a backend actually pushes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub digest: String,
    pub size: u64,
    pub high_priority: bool,
    /// Hint for backends that compress; 0 means store as is.
    pub compression_level: u32,
    pub path: PathBuf,
}

impl UploadItem {
    /// Open the content for streaming to the store.
    pub async fn open(&self) -> std::result::Result<tokio::fs::File, StorageError> {
        tokio::fs::File::open(&self.path)
            .await
            .map_err(|source| StorageError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Opaque per-item state handed from `contains` to `push`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushState {
    pub token: Option<String>,
}

pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// A content-addressable store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Human readable location, used in logs and errors.
    fn location(&self) -> &str;

    fn namespace(&self) -> &str;

    /// Verify the store is reachable. Called once before the first query.
    async fn connect(&self) -> std::result::Result<(), StorageError>;

    /// Return a push state for every item that is *missing* from the store.
    async fn contains(
        &self,
        items: &[UploadItem],
    ) -> std::result::Result<HashMap<String, PushState>, StorageError>;

    async fn push(&self, item: &UploadItem, state: PushState)
        -> std::result::Result<(), StorageError>;

    /// Stream an object starting at `offset`.
    async fn fetch(&self, digest: &str, offset: u64)
        -> std::result::Result<ObjectReader, StorageError>;

    /// A URL the object can be downloaded from, if the backend has one.
    async fn fetch_url(&self, digest: &str) -> std::result::Result<String, StorageError>;
}

/// Open a backend from an endpoint string.
///
/// - `memory:` keeps everything in process
/// - `http://` / `https://` use the S3 settings from the cloud config file
/// - `file://<dir>` or a plain path use a local directory
pub fn open_storage(endpoint: &str, namespace: &str) -> Result<Arc<dyn StorageBackend>> {
    if endpoint.is_empty() {
        return Err(StorageError::InvalidEndpoint(endpoint.to_string()).into());
    }
    if endpoint == "memory:" {
        return Ok(Arc::new(MemoryBackend::new(namespace)));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        let config = load_config()?;
        let mut s3 = config.s3.unwrap_or_default();
        s3.endpoint = endpoint.to_string();
        if s3.bucket.is_empty() {
            return Err(IsolateError::config(format!(
                "no bucket configured for {} in {}",
                endpoint,
                get_config_path().display()
            )));
        }
        return Ok(Arc::new(S3Backend::from_config(&s3, namespace)?));
    }
    let dir = endpoint.strip_prefix("file://").unwrap_or(endpoint);
    Ok(Arc::new(LocalBackend::new(Path::new(dir), namespace)))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    /// Items sent to `contains`.
    pub queried: usize,
    /// Items skipped because their digest was already queried.
    pub duplicates: usize,
    pub pushed: usize,
    pub pushed_bytes: u64,
}

/// The upload stage: consumes unique items and makes them present in the store.
pub struct Uploader {
    backend: Arc<dyn StorageBackend>,
    push_concurrency: usize,
}

impl Uploader {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            push_concurrency: DEFAULT_PUSH_CONCURRENCY,
        }
    }

    pub fn push_concurrency(mut self, n: usize) -> Self {
        self.push_concurrency = n.max(1);
        self
    }

    /// Drain `rx` until it closes. Cancellation aborts with `Interrupted`.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<UploadItem>,
        cancel: &CancellationToken,
    ) -> Result<UploadStats> {
        let mut stats = UploadStats::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending: Vec<UploadItem> = Vec::new();
        let mut batch_index = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IsolateError::Interrupted),
                item = rx.recv() => item,
            };
            match next {
                Some(item) => {
                    if !seen.insert(item.digest.clone()) {
                        stats.duplicates += 1;
                        continue;
                    }
                    pending.push(item);
                    if pending.len() >= contains_batch_size(batch_index) {
                        batch_index += 1;
                        let batch = std::mem::take(&mut pending);
                        self.flush(batch, &mut stats, cancel).await?;
                    }
                }
                None => break,
            }
        }
        if !pending.is_empty() {
            self.flush(pending, &mut stats, cancel).await?;
        }

        info!(
            "Upload to {}: {} queried, {} pushed ({} bytes), {} duplicate digests",
            self.backend.location(),
            stats.queried,
            stats.pushed,
            stats.pushed_bytes,
            stats.duplicates
        );
        Ok(stats)
    }

    async fn flush(
        &self,
        batch: Vec<UploadItem>,
        stats: &mut UploadStats,
        cancel: &CancellationToken,
    ) -> Result<()> {
        stats.queried += batch.len();
        let mut missing = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IsolateError::Interrupted),
            res = self.backend.contains(&batch) => res?,
        };
        debug!("contains: {}/{} items missing", missing.len(), batch.len());

        let mut to_push: Vec<(UploadItem, PushState)> = batch
            .into_iter()
            .filter_map(|item| missing.remove(&item.digest).map(|state| (item, state)))
            .collect();
        // Stable: keeps arrival order inside each priority class.
        to_push.sort_by_key(|(item, _)| !item.high_priority);

        let semaphore = Arc::new(Semaphore::new(self.push_concurrency));
        let mut set = JoinSet::new();
        for (item, state) in to_push {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IsolateError::Interrupted),
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|_| IsolateError::Interrupted)?,
            };
            // Reap finished pushes so failures surface early.
            while let Some(done) = set.try_join_next() {
                Self::record(done, stats)?;
            }
            let backend = Arc::clone(&self.backend);
            set.spawn(async move {
                let _permit = permit;
                backend.push(&item, state).await.map(|_| item.size)
            });
        }

        loop {
            let done = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IsolateError::Interrupted),
                done = set.join_next() => done,
            };
            match done {
                Some(done) => Self::record(done, stats)?,
                None => break,
            }
        }
        Ok(())
    }

    fn record(
        done: std::result::Result<std::result::Result<u64, StorageError>, tokio::task::JoinError>,
        stats: &mut UploadStats,
    ) -> Result<()> {
        let size = done.map_err(|e| IsolateError::Panicked(e.to_string()))??;
        stats.pushed += 1;
        stats.pushed_bytes += size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(dir: &Path, name: &str, content: &str, high_priority: bool) -> UploadItem {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        UploadItem {
            digest: crate::hasher::HashAlgo::Sha1.digest_bytes(content.as_bytes()),
            size: content.len() as u64,
            high_priority,
            compression_level: 6,
            path,
        }
    }

    #[test]
    fn test_batch_sizes() {
        let sizes: Vec<usize> = (0..9).map(contains_batch_size).collect();
        assert_eq!(sizes, [20, 20, 50, 50, 50, 100, 100, 100, 100]);
    }

    #[tokio::test]
    async fn test_open_storage() {
        let dir = TempDir::new().unwrap();
        let store = open_storage("memory:", "default-gzip").unwrap();
        assert_eq!(store.namespace(), "default-gzip");
        let url = format!("file://{}", dir.path().display());
        let store = open_storage(&url, "ns").unwrap();
        assert_eq!(store.location(), dir.path().display().to_string());
        assert!(open_storage("", "ns").is_err());
    }

    #[tokio::test]
    async fn test_only_missing_items_are_pushed() {
        let dir = TempDir::new().unwrap();
        let present = item(dir.path(), "a", "present", false);
        let missing = item(dir.path(), "b", "missing", false);
        let backend = Arc::new(MemoryBackend::new("ns"));
        backend.insert(&present.digest, b"present".to_vec());

        let (tx, rx) = mpsc::channel(8);
        tx.send(present.clone()).await.unwrap();
        tx.send(missing.clone()).await.unwrap();
        // Same content under another path: queried once.
        let mut dup = missing.clone();
        dup.path = dir.path().join("c");
        tx.send(dup).await.unwrap();
        drop(tx);

        let stats = Uploader::new(backend.clone())
            .run(rx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.queried, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.pushed, 1);
        assert_eq!(backend.pushed(), vec![missing.digest.clone()]);
        assert_eq!(backend.get(&missing.digest).unwrap(), b"missing");
    }

    #[tokio::test]
    async fn test_contains_batches_grow() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new("ns"));
        let (tx, rx) = mpsc::channel(256);
        for i in 0..95 {
            tx.send(item(dir.path(), &format!("f{}", i), &format!("content {}", i), false))
                .await
                .unwrap();
        }
        drop(tx);
        Uploader::new(backend.clone())
            .run(rx, &CancellationToken::new())
            .await
            .unwrap();
        let sizes: Vec<usize> = backend.contains_calls().iter().map(Vec::len).collect();
        assert_eq!(sizes, [20, 20, 50, 5]);
        assert_eq!(backend.pushed().len(), 95);
    }

    #[tokio::test]
    async fn test_high_priority_pushed_first() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new("ns"));
        let (tx, rx) = mpsc::channel(8);
        let low = item(dir.path(), "low", "low", false);
        let high = item(dir.path(), "high", "high", true);
        tx.send(low.clone()).await.unwrap();
        tx.send(high.clone()).await.unwrap();
        drop(tx);
        Uploader::new(backend.clone())
            .push_concurrency(1)
            .run(rx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(backend.pushed(), vec![high.digest, low.digest]);
    }

    #[tokio::test]
    async fn test_cancelled_upload_is_interrupted() {
        let backend = Arc::new(MemoryBackend::new("ns"));
        let (_tx, rx) = mpsc::channel::<UploadItem>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Uploader::new(backend).run(rx, &cancel).await.unwrap_err();
        assert!(err.is_interrupted());
    }
}
