//! Cross-tree dedup of file assets into upload items.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{IsolateError, Result};
use crate::storage::UploadItem;
use crate::tree::FileAsset;

/// Extensions of formats that are already compressed.
pub const ALREADY_COMPRESSED: &[&str] = &[
    "7z", "avi", "cur", "gif", "h264", "jar", "jpeg", "jpg", "mp4", "pdf", "png", "wav", "zip",
];

pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

pub fn compression_level(path: &Path) -> u32 {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if ALREADY_COMPRESSED.contains(&ext.as_str()) {
        0
    } else {
        DEFAULT_COMPRESSION_LEVEL
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub forwarded: usize,
    pub skipped: usize,
    pub symlinks: usize,
}

/// Path-based dedup. Owned by a single task, so the seen-set needs no lock.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<PathBuf>,
    stats: DedupStats,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    /// `None` when the asset is a symlink or a path already seen.
    pub fn accept(&mut self, asset: FileAsset) -> Option<Result<UploadItem>> {
        if asset.metadata.is_symlink() {
            self.stats.symlinks += 1;
            return None;
        }
        if !self.seen.insert(asset.full_path.clone()) {
            self.stats.skipped += 1;
            debug!("Skipping duplicate {}", asset.full_path.display());
            return None;
        }
        Some(self.to_upload_item(asset))
    }

    fn to_upload_item(&mut self, asset: FileAsset) -> Result<UploadItem> {
        let FileAsset {
            metadata,
            full_path,
        } = asset;
        let digest = metadata.digest.clone().ok_or_else(|| {
            IsolateError::config(format!("{} has no digest", full_path.display()))
        })?;
        let size = match metadata.size {
            Some(s) => s,
            None => std::fs::metadata(&full_path)
                .map_err(|e| IsolateError::io(&full_path, e))?
                .len(),
        };
        self.stats.forwarded += 1;
        Ok(UploadItem {
            digest,
            size,
            high_priority: metadata.is_high_priority(),
            compression_level: compression_level(&full_path),
            path: full_path,
        })
    }

    /// Drain `rx` into `tx` until `rx` closes.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<FileAsset>,
        tx: mpsc::Sender<UploadItem>,
        cancel: &CancellationToken,
    ) -> Result<DedupStats> {
        loop {
            let asset = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IsolateError::Interrupted),
                asset = rx.recv() => asset,
            };
            let Some(asset) = asset else { break };
            let Some(item) = self.accept(asset) else { continue };
            let item = item?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IsolateError::Interrupted),
                res = tx.send(item) => res.map_err(|_| IsolateError::Interrupted)?,
            }
        }
        info!(
            "Dedup: {} forwarded, {} duplicates skipped, {} symlinks dropped",
            self.stats.forwarded, self.stats.skipped, self.stats.symlinks
        );
        Ok(self.stats)
    }
}
