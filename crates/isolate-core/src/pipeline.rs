//! Archive pipeline - many trees, one store
//!
//! Features:
//! - One worker per tree, bounded by a semaphore
//! - Dedup and upload stages run alongside the tree workers
//! - Fail-fast: any stage error cancels the others
//! - Deterministic error reporting once every stage has drained
//! - Saved states are only written after a fully successful run

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dedup::Deduplicator;
use crate::error::{IsolateError, Result};
use crate::hasher::Hasher;
use crate::parser::{ConfigFileParser, JsonConfigParser};
use crate::storage::{open_storage, StorageBackend, UploadStats, Uploader};
use crate::tree::{FileAsset, IsolatedTree, Tree, TreeIsolator};

/// Capacity of the inter-stage channels.
const CHANNEL_CAPACITY: usize = 1024;

/// Runs tree workers, dedup and upload against one store.
pub struct Archiver {
    backend: Arc<dyn StorageBackend>,
    isolator: Arc<TreeIsolator>,
    hasher: Arc<Hasher>,
    concurrency: usize,
    push_concurrency: usize,
}

impl Archiver {
    /// Tree concurrency defaults to the number of CPUs.
    pub fn new(backend: Arc<dyn StorageBackend>, parser: Arc<dyn ConfigFileParser>) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        let hasher = Arc::new(Hasher::default());
        Self {
            backend,
            isolator: Arc::new(TreeIsolator::new(parser, Arc::clone(&hasher))),
            hasher,
            concurrency: cpus,
            push_concurrency: crate::storage::DEFAULT_PUSH_CONCURRENCY,
        }
    }

    /// Maximum number of trees isolated at once.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Maximum number of pushes in flight.
    pub fn push_concurrency(mut self, n: usize) -> Self {
        self.push_concurrency = n.max(1);
        self
    }

    /// Archive every tree and return `target name -> isolated digest`.
    pub async fn archive(
        &self,
        trees: Vec<Tree>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>> {
        let start = Instant::now();
        let token = cancel.child_token();
        let (asset_tx, asset_rx) = mpsc::channel::<FileAsset>(CHANNEL_CAPACITY);
        let (item_tx, item_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let dedup = {
            let token = token.clone();
            tokio::spawn(async move {
                let res = Deduplicator::new().run(asset_rx, item_tx, &token).await;
                if res.is_err() {
                    token.cancel();
                }
                res
            })
        };

        let upload = {
            let token = token.clone();
            let backend = Arc::clone(&self.backend);
            let push_concurrency = self.push_concurrency;
            tokio::spawn(async move {
                let res: Result<UploadStats> = async {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(IsolateError::Interrupted),
                        res = backend.connect() => res?,
                    }
                    Uploader::new(backend)
                        .push_concurrency(push_concurrency)
                        .run(item_rx, &token)
                        .await
                }
                .await;
                if res.is_err() {
                    token.cancel();
                }
                res
            })
        };

        let tree_count = trees.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        for (index, tree) in trees.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let isolator = Arc::clone(&self.isolator);
            let sink = asset_tx.clone();
            let token = token.clone();
            workers.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => return (index, Err(IsolateError::Interrupted)),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return (index, Err(IsolateError::Interrupted)),
                    },
                };
                // Never start a tree once the run is cancelled.
                if token.is_cancelled() {
                    return (index, Err(IsolateError::Interrupted));
                }
                let res = isolator.isolate(&tree, &sink, &token).await;
                if let Err(e) = &res {
                    if !e.is_interrupted() {
                        warn!("{}: {}", tree.name(), e);
                        token.cancel();
                    }
                }
                (index, res)
            });
        }
        // Dedup sees end-of-input once every worker has dropped its sender.
        drop(asset_tx);

        let mut tree_results: Vec<Option<Result<IsolatedTree>>> =
            (0..tree_count).map(|_| None).collect();
        let mut panics = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, res)) => tree_results[index] = Some(res),
                Err(e) => {
                    token.cancel();
                    panics.push(IsolateError::Panicked(e.to_string()));
                }
            }
        }
        let dedup_result = flatten(dedup.await);
        if dedup_result.is_err() {
            token.cancel();
        }
        let upload_result = flatten(upload.await);

        let mut isolated = Vec::with_capacity(tree_count);
        let mut errors: Vec<IsolateError> = Vec::new();
        for res in tree_results.into_iter().flatten() {
            match res {
                Ok(tree) => isolated.push(tree),
                Err(e) => errors.push(e),
            }
        }
        errors.extend(panics);
        if let Err(e) = dedup_result {
            errors.push(e);
        }
        match upload_result {
            Ok(stats) => debug!("Upload stats: {:?}", stats),
            Err(e) => errors.push(e),
        }
        if let Some(err) = select_error(errors, cancel.is_cancelled()) {
            return Err(err);
        }

        let mut digests = BTreeMap::new();
        for tree in isolated {
            tree.state.save(&tree.state_path)?;
            if let Some(prev) = digests.insert(tree.name.clone(), tree.digest.clone()) {
                warn!("Target {} archived twice, {} replaced", tree.name, prev);
            }
        }

        let stats = self.hasher.stats();
        info!(
            "Archived {} targets in {:.2?} ({} files hashed, {} reused)",
            digests.len(),
            start.elapsed(),
            stats.hashed,
            stats.reused
        );
        Ok(digests)
    }
}

fn flatten<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    joined.map_err(|e| IsolateError::Panicked(e.to_string()))?
}

/// Pick the error to report from everything the stages returned.
///
/// `errors` is ordered tree errors (input order), worker panics, dedup,
/// upload. The first real error wins; interruption is only reported when
/// nothing else went wrong.
pub fn select_error(errors: Vec<IsolateError>, cancelled: bool) -> Option<IsolateError> {
    let mut interrupted = cancelled;
    for err in errors {
        if err.is_interrupted() {
            interrupted = true;
        } else {
            return Some(err);
        }
    }
    interrupted.then_some(IsolateError::Interrupted)
}

/// Archive `trees` into the store at `endpoint`.
pub async fn archive(
    trees: Vec<Tree>,
    namespace: &str,
    endpoint: &str,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, String>> {
    let backend = open_storage(endpoint, namespace)?;
    info!("Archiving {} trees to {}", trees.len(), backend.location());
    Archiver::new(backend, Arc::new(JsonConfigParser))
        .archive(trees, cancel)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configs;
    use crate::error::StorageError;
    use crate::hasher::HashAlgo;
    use crate::state::SavedState;
    use crate::storage::{MemoryBackend, ObjectReader, PushState, UploadItem};
    use crate::tree::ArchiveOptions;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Parses like [`JsonConfigParser`], but slowly.
    #[derive(Default)]
    struct SlowParser {
        calls: AtomicUsize,
    }

    impl ConfigFileParser for SlowParser {
        fn parse(&self, isolate_dir: &Path, content: &[u8], file_comment: &str) -> Result<Configs> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            JsonConfigParser.parse(isolate_dir, content, file_comment)
        }
    }

    /// A store that is either down or refuses every push.
    struct BrokenBackend {
        down: bool,
    }

    #[async_trait]
    impl StorageBackend for BrokenBackend {
        fn location(&self) -> &str {
            "broken:"
        }

        fn namespace(&self) -> &str {
            "ns"
        }

        async fn connect(&self) -> std::result::Result<(), StorageError> {
            if self.down {
                return Err(StorageError::Unreachable {
                    location: "broken:".to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(())
        }

        async fn contains(
            &self,
            items: &[UploadItem],
        ) -> std::result::Result<HashMap<String, PushState>, StorageError> {
            Ok(items
                .iter()
                .map(|i| (i.digest.clone(), PushState::default()))
                .collect())
        }

        async fn push(
            &self,
            item: &UploadItem,
            _state: PushState,
        ) -> std::result::Result<(), StorageError> {
            Err(StorageError::PushRejected {
                digest: item.digest.clone(),
                reason: "quota exceeded".to_string(),
            })
        }

        async fn fetch(
            &self,
            _digest: &str,
            _offset: u64,
        ) -> std::result::Result<ObjectReader, StorageError> {
            Err(StorageError::Unsupported("fetch"))
        }

        async fn fetch_url(&self, _digest: &str) -> std::result::Result<String, StorageError> {
            Err(StorageError::Unsupported("fetch_url"))
        }
    }

    /// `<root>/<name>.isolate` depending on `files`, output in `<root>/out`.
    fn target(root: &Path, name: &str, files: &[&str]) -> Tree {
        let list: Vec<String> = files.iter().map(|f| format!("{:?}", f)).collect();
        fs::write(
            root.join(format!("{}.isolate", name)),
            format!(r#"{{"variables": {{"command": ["./{}"], "files": [{}]}}}}"#, name, list.join(", ")),
        )
        .unwrap();
        Tree::new(
            root,
            ArchiveOptions::new(format!("{}.isolate", name), format!("out/{}.isolated", name)),
        )
    }

    fn archiver(backend: &Arc<MemoryBackend>) -> Archiver {
        Archiver::new(backend.clone(), Arc::new(JsonConfigParser)).concurrency(2)
    }

    #[tokio::test]
    async fn test_shared_file_is_uploaded_once() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("shared.txt"), "shared").unwrap();
        fs::write(root.join("a.txt"), "only a").unwrap();
        fs::write(root.join("b.txt"), "only b").unwrap();
        let trees = vec![
            target(root, "a", &["shared.txt", "a.txt"]),
            target(root, "b", &["shared.txt", "b.txt"]),
        ];

        let backend = Arc::new(MemoryBackend::new("default-gzip"));
        let digests = archiver(&backend)
            .archive(trees, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(digests.keys().collect::<Vec<_>>(), ["a", "b"]);
        let shared = HashAlgo::Sha1.digest_bytes(b"shared");
        let pushed = backend.pushed();
        assert_eq!(pushed.iter().filter(|d| **d == shared).count(), 1);
        // Three files and two manifests.
        assert_eq!(pushed.len(), 5);
        for digest in digests.values() {
            assert!(backend.get(digest).is_some());
        }

        let state = SavedState::load(&root.join("out").join("a.isolated.state"))
            .unwrap()
            .unwrap();
        assert_eq!(state.files.len(), 2);
        assert_eq!(state.command, ["./a"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_never_uploaded() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("data")).unwrap();
        fs::write(root.join("data").join("real.txt"), "real").unwrap();
        std::os::unix::fs::symlink("real.txt", root.join("data").join("alias")).unwrap();
        let trees = vec![target(root, "t", &["data/"])];

        let backend = Arc::new(MemoryBackend::new("ns"));
        let digests = archiver(&backend)
            .archive(trees, &CancellationToken::new())
            .await
            .unwrap();

        // The real file and the manifest.
        assert_eq!(backend.pushed().len(), 2);
        let manifest = backend.get(&digests["t"]).unwrap();
        let text = String::from_utf8(manifest).unwrap();
        assert!(text.contains(r#""data/alias":{"l":"real.txt"}"#), "{}", text);
    }

    #[tokio::test]
    async fn test_present_content_is_not_pushed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("x.txt"), "already there").unwrap();
        let backend = Arc::new(MemoryBackend::new("ns"));
        let present = HashAlgo::Sha1.digest_bytes(b"already there");
        backend.insert(&present, b"already there".to_vec());

        archiver(&backend)
            .archive(vec![target(root, "t", &["x.txt"])], &CancellationToken::new())
            .await
            .unwrap();
        assert!(!backend.pushed().contains(&present));
        assert!(backend.contains_calls().iter().flatten().any(|d| *d == present));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("x.txt"), "x").unwrap();
        let trees = vec![target(root, "t", &["x.txt"])];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let backend = Arc::new(MemoryBackend::new("ns"));
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            archiver(&backend).archive(trees, &cancel),
        )
        .await
        .unwrap();
        assert!(res.unwrap_err().is_interrupted());
        assert!(backend.pushed().is_empty());
        assert!(!root.join("out").join("t.isolated.state").exists());
    }

    #[tokio::test]
    async fn test_tree_error_wins_and_no_state_is_saved() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("x.txt"), "x").unwrap();
        let trees = vec![
            target(root, "good", &["x.txt"]),
            target(root, "bad", &["missing.txt"]),
        ];

        let backend = Arc::new(MemoryBackend::new("ns"));
        let err = archiver(&backend)
            .archive(trees, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IsolateError::MissingFile(_)), "{}", err);
        assert!(!root.join("out").join("good.isolated.state").exists());
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_trees() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("x.txt"), "x").unwrap();
        let trees: Vec<Tree> = (0..8)
            .map(|i| target(root, &format!("t{}", i), &["x.txt"]))
            .collect();

        let parser = Arc::new(SlowParser::default());
        let backend = Arc::new(MemoryBackend::new("ns"));
        let archiver = Archiver::new(backend.clone(), parser.clone()).concurrency(1);
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };

        let start = std::time::Instant::now();
        let err = archiver.archive(trees, &cancel).await.unwrap_err();
        let elapsed = start.elapsed();
        canceller.await.unwrap();

        assert!(err.is_interrupted(), "{}", err);
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
        assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
        assert!(backend.pushed().is_empty());
        assert!(!root.join("out").join("t0.isolated.state").exists());
    }

    async fn archive_to_broken(down: bool) -> (TempDir, IsolateError) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x.txt"), "x").unwrap();
        let trees = vec![target(dir.path(), "t", &["x.txt"])];
        let err = Archiver::new(Arc::new(BrokenBackend { down }), Arc::new(JsonConfigParser))
            .archive(trees, &CancellationToken::new())
            .await
            .unwrap_err();
        (dir, err)
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_run() {
        let (dir, err) = archive_to_broken(true).await;
        assert!(
            matches!(err, IsolateError::Storage(StorageError::Unreachable { .. })),
            "{}",
            err
        );
        assert!(!dir.path().join("out").join("t.isolated.state").exists());
    }

    #[tokio::test]
    async fn test_rejected_push_fails_run() {
        let (dir, err) = archive_to_broken(false).await;
        assert!(
            matches!(err, IsolateError::Storage(StorageError::PushRejected { .. })),
            "{}",
            err
        );
        assert!(!dir.path().join("out").join("t.isolated.state").exists());
    }

    #[test]
    fn test_select_error_stage_order() {
        let rejected = || {
            IsolateError::Storage(StorageError::PushRejected {
                digest: "ab".repeat(20),
                reason: "quota exceeded".to_string(),
            })
        };
        // Tree interrupted, dedup failed, upload failed: dedup comes first.
        let err = select_error(
            vec![
                IsolateError::Interrupted,
                IsolateError::MissingFile(PathBuf::from("gone.txt")),
                rejected(),
            ],
            false,
        )
        .unwrap();
        assert!(matches!(err, IsolateError::MissingFile(_)), "{}", err);

        let err = select_error(vec![IsolateError::Interrupted, rejected()], true).unwrap();
        assert!(matches!(err, IsolateError::Storage(_)), "{}", err);
    }

    #[test]
    fn test_select_error() {
        assert!(select_error(vec![], false).is_none());
        assert!(select_error(vec![], true).unwrap().is_interrupted());
        let err = select_error(
            vec![
                IsolateError::Interrupted,
                IsolateError::config("first"),
                IsolateError::config("second"),
            ],
            true,
        )
        .unwrap();
        assert_eq!(err.to_string(), "configuration error: first");
    }

    #[tokio::test]
    async fn test_archive_to_local_store() {
        let dir = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("x.txt"), "x").unwrap();
        let endpoint = format!("file://{}", store.path().display());
        let digests = archive(
            vec![target(root, "t", &["x.txt"])],
            "default-gzip",
            &endpoint,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let digest = &digests["t"];
        assert!(store
            .path()
            .join("default-gzip")
            .join(&digest[..2])
            .join(digest)
            .exists());
    }
}
