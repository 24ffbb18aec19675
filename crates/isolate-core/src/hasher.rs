//! Content hashing and per-file metadata.
//!
//! Features:
//! - Streaming SHA-1 digests
//! - Reuse of cached digests when mtime and size are unchanged
//! - Parallel metadata batches with Rayon

use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::UNIX_EPOCH;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{IsolateError, Result};
use crate::paths;

/// Read buffer for hashing. Sizes above a few KiB make no measurable
/// difference.
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Supported hash algorithms. Only SHA-1 for now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    #[default]
    Sha1,
}

impl HashAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgo::Sha1 => "sha-1",
        }
    }

    /// Digest of an in-memory buffer, lowercase hex.
    pub fn digest_bytes(&self, data: &[u8]) -> String {
        match self {
            HashAlgo::Sha1 => hex::encode(Sha1::digest(data)),
        }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgo {
    type Err = IsolateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha-1" => Ok(HashAlgo::Sha1),
            other => Err(IsolateError::HashAlgorithm(other.to_string())),
        }
    }
}

/// Hash a file by streaming its content.
pub fn hash_file(path: &Path, algo: HashAlgo) -> Result<String> {
    let mut file = File::open(path).map_err(|e| IsolateError::io(path, e))?;
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    match algo {
        HashAlgo::Sha1 => {
            let mut hasher = Sha1::new();
            loop {
                let n = file.read(&mut buf).map_err(|e| IsolateError::io(path, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

/// Metadata of one dependency, as stored in `.isolated` and `.state` files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
}

impl FileMetadata {
    pub fn is_symlink(&self) -> bool {
        self.link.is_some()
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority == Some(0)
    }

    /// The entry as written into an `.isolated` manifest (no mtime).
    pub fn for_isolated(&self) -> FileMetadata {
        FileMetadata {
            mtime: None,
            ..self.clone()
        }
    }
}

/// Mode bits kept in the manifest: `0755`, `0644`, `0555` or `0444` style.
#[cfg(unix)]
pub fn isolated_mode(raw: u32, read_only: bool) -> u32 {
    const S_IWUSR: u32 = 0o200;
    const S_IXUSR: u32 = 0o100;
    const S_IRGRP: u32 = 0o040;
    const S_IWGRP: u32 = 0o020;
    const S_IXGRP: u32 = 0o010;
    const S_IRWXO: u32 = 0o007;

    let mut mode = raw & 0o7777;
    mode &= !(S_IWGRP | S_IRWXO);
    if read_only {
        mode &= !S_IWUSR;
    }
    if mode & (S_IXUSR | S_IRGRP) == (S_IXUSR | S_IRGRP) {
        mode |= S_IXGRP;
    } else {
        mode &= !S_IXGRP;
    }
    mode
}

#[cfg(unix)]
fn posix_mode(stat: &fs::Metadata, read_only: bool) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(isolated_mode(stat.permissions().mode(), read_only))
}

// File modes carry no useful information on Windows.
#[cfg(not(unix))]
fn posix_mode(_stat: &fs::Metadata, _read_only: bool) -> Option<u32> {
    None
}

fn mtime_secs(meta: &fs::Metadata) -> Option<i64> {
    let modified = meta.modified().ok()?;
    match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => Some(d.as_secs() as i64),
        Err(e) => Some(-(e.duration().as_secs() as i64)),
    }
}

/// Content hasher that keeps track of how much work the cache saved.
pub struct Hasher {
    algo: HashAlgo,
    hashed: AtomicUsize,
    reused: AtomicUsize,
}

impl Hasher {
    pub fn new(algo: HashAlgo) -> Self {
        Self {
            algo,
            hashed: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    /// Hash a single file.
    pub fn hash_file(&self, path: &Path) -> Result<String> {
        self.hashed.fetch_add(1, Ordering::Relaxed);
        hash_file(path, self.algo)
    }

    /// Metadata for one file, reusing `prev` when it is still fresh.
    ///
    /// Symlinks are not followed. A cached digest is trusted only when both
    /// mtime and size match; a cached link target only when mtime matches.
    pub fn file_metadata(
        &self,
        path: &Path,
        prev: Option<&FileMetadata>,
        read_only: bool,
    ) -> Result<FileMetadata> {
        let stat = fs::symlink_metadata(path).map_err(|e| IsolateError::io(path, e))?;
        let is_link = stat.file_type().is_symlink();
        let mut out = FileMetadata {
            mtime: mtime_secs(&stat),
            ..FileMetadata::default()
        };

        if !is_link {
            out.mode = posix_mode(&stat, read_only);
            out.size = Some(stat.len());
            let cached = prev.filter(|p| p.mtime == out.mtime && p.size == out.size);
            out.digest = match cached.and_then(|p| p.digest.clone()) {
                Some(digest) => {
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    Some(digest)
                }
                None => Some(self.hash_file(path)?),
            };
        } else {
            let cached = prev.filter(|p| p.mtime == out.mtime);
            out.link = match cached.and_then(|p| p.link.clone()) {
                Some(link) => Some(link),
                None => Some(read_link_relative(path)?),
            };
        }
        Ok(out)
    }

    /// Metadata for a batch of files in parallel.
    ///
    /// Each entry is `(full path, previous metadata)`; results keep the
    /// input order.
    pub fn metadata_batch(
        &self,
        files: &[(PathBuf, Option<FileMetadata>)],
        read_only: bool,
    ) -> Vec<Result<FileMetadata>> {
        files
            .par_iter()
            .map(|(path, prev)| self.file_metadata(path, prev.as_ref(), read_only))
            .collect()
    }

    pub fn stats(&self) -> HasherStats {
        HasherStats {
            hashed: self.hashed.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new(HashAlgo::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HasherStats {
    pub hashed: usize,
    pub reused: usize,
}

/// Link destination relative to the link's own directory.
fn read_link_relative(path: &Path) -> Result<String> {
    let target = fs::read_link(path).map_err(|e| IsolateError::io(path, e))?;
    let parent = paths::native_path_case(path.parent().unwrap_or_else(|| Path::new("/")));
    let resolved = paths::normalize(&parent.join(&target));
    let relative = paths::relative_to(&resolved, &parent).ok_or_else(|| {
        IsolateError::config(format!(
            "cannot express link {} relative to {}",
            target.display(),
            parent.display()
        ))
    })?;
    Ok(paths::to_posix(&relative))
}
