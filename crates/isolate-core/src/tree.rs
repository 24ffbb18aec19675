//! Tree isolation - resolve, expand and hash one archive target
//!
//! Features:
//! - Saved-state load with wholesale invalidation
//! - `<(NAME)` substitution from config, extra and path variables
//! - Directory expansion with a glob blacklist
//! - Batched hashing on the blocking pool, cancellation-aware emission
//! - Writes the `.isolated` manifest and emits it as a high-priority asset

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::PATH_VARIABLE_MARKER;
use crate::error::{IsolateError, Result};
use crate::hasher::{FileMetadata, HashAlgo, Hasher};
use crate::parser::{load_isolate_for_config, ConfigFileParser};
use crate::paths;
use crate::state::{self, SavedState};

/// Version of the `.isolated` format written.
pub const ISOLATED_FILE_VERSION: &str = "1.4";

/// Patterns skipped when expanding directories.
pub const DEFAULT_BLACKLIST: &[&str] = &[".git", ".hg", ".svn", "*.pyc", "*.swp"];

/// Files hashed per blocking task.
const HASH_BATCH_SIZE: usize = 64;

/// Everything needed to archive one target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArchiveOptions {
    /// The `.isolate` input.
    pub isolate: PathBuf,
    /// The `.isolated` output.
    pub isolated: PathBuf,
    pub blacklist: Vec<String>,
    pub path_variables: BTreeMap<String, String>,
    pub extra_variables: BTreeMap<String, String>,
    pub config_variables: BTreeMap<String, String>,
}

impl ArchiveOptions {
    pub fn new(isolate: impl Into<PathBuf>, isolated: impl Into<PathBuf>) -> Self {
        Self {
            isolate: isolate.into(),
            isolated: isolated.into(),
            blacklist: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }
}

/// One archive target: a working directory plus its options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub cwd: PathBuf,
    pub opts: ArchiveOptions,
}

impl Tree {
    /// Relative `isolate`/`isolated` paths are resolved against `cwd`.
    pub fn new(cwd: impl Into<PathBuf>, mut opts: ArchiveOptions) -> Self {
        let cwd = paths::normalize(&cwd.into());
        opts.isolate = paths::normalize(&cwd.join(&opts.isolate));
        opts.isolated = paths::normalize(&cwd.join(&opts.isolated));
        Self { cwd, opts }
    }

    /// `out/foo_test.isolated` -> `foo_test`.
    pub fn name(&self) -> String {
        paths::file_stem_name(&self.opts.isolated)
    }
}

/// A hashed dependency, on its way to the deduplicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAsset {
    pub metadata: FileMetadata,
    pub full_path: PathBuf,
}

/// Outcome of a successfully isolated tree.
#[derive(Debug, Clone)]
pub struct IsolatedTree {
    pub name: String,
    pub digest: String,
    pub state_path: PathBuf,
    pub state: SavedState,
}

/// The `.isolated` manifest. Field order is the serialized key order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Isolated {
    pub algo: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    pub files: BTreeMap<String, FileMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<u8>,
    pub relative_cwd: String,
    pub version: String,
}

/// Resolved tree, ready for hashing.
struct Prepared {
    state: SavedState,
    /// `(key relative to root_dir, full path)`, sorted by key.
    files: Vec<(String, PathBuf)>,
}

pub struct TreeIsolator {
    parser: Arc<dyn ConfigFileParser>,
    hasher: Arc<Hasher>,
}

impl TreeIsolator {
    pub fn new(parser: Arc<dyn ConfigFileParser>, hasher: Arc<Hasher>) -> Self {
        Self { parser, hasher }
    }

    /// Isolate `tree`, sending every dependency to `sink` as it is hashed.
    pub async fn isolate(
        &self,
        tree: &Tree,
        sink: &mpsc::Sender<FileAsset>,
        cancel: &CancellationToken,
    ) -> Result<IsolatedTree> {
        let name = tree.name();
        let algo = self.hasher.algo();
        let prepared = {
            let tree = tree.clone();
            let parser = Arc::clone(&self.parser);
            let handle = tokio::task::spawn_blocking(move || prepare(&tree, parser.as_ref(), algo));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IsolateError::Interrupted),
                res = handle => res.map_err(|e| IsolateError::Panicked(e.to_string()))??,
            }
        };
        let Prepared { mut state, files } = prepared;
        debug!("{}: {} dependencies under {}", name, files.len(), state.root_dir.display());

        let read_only = state.read_only.unwrap_or(0) > 0;
        let previous = std::mem::take(&mut state.files);
        let mut hashed: BTreeMap<String, FileMetadata> = BTreeMap::new();

        for chunk in files.chunks(HASH_BATCH_SIZE) {
            let batch: Vec<(PathBuf, Option<FileMetadata>)> = chunk
                .iter()
                .map(|(key, full)| (full.clone(), previous.get(key).cloned()))
                .collect();
            let hasher = Arc::clone(&self.hasher);
            let handle = tokio::task::spawn_blocking(move || hasher.metadata_batch(&batch, read_only));
            let results = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IsolateError::Interrupted),
                res = handle => res.map_err(|e| IsolateError::Panicked(e.to_string()))?,
            };

            for ((key, full), meta) in chunk.iter().zip(results) {
                let meta = meta?;
                emit(
                    sink,
                    cancel,
                    FileAsset {
                        metadata: meta.clone(),
                        full_path: full.clone(),
                    },
                )
                .await?;
                hashed.insert(key.clone(), meta);
            }
        }

        let manifest = Isolated {
            algo: algo.to_string(),
            command: state.command.clone(),
            files: hashed
                .iter()
                .map(|(k, v)| (k.clone(), v.for_isolated()))
                .collect(),
            read_only: state.read_only,
            relative_cwd: state.relative_cwd.clone(),
            version: ISOLATED_FILE_VERSION.to_string(),
        };
        let isolated = &tree.opts.isolated;
        let bytes = serde_json::to_vec(&manifest).map_err(|source| IsolateError::Json {
            path: isolated.clone(),
            source,
        })?;
        if let Some(parent) = isolated.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IsolateError::io(parent, e))?;
        }
        tokio::fs::write(isolated, &bytes)
            .await
            .map_err(|e| IsolateError::io(isolated, e))?;
        let digest = algo.digest_bytes(&bytes);

        emit(
            sink,
            cancel,
            FileAsset {
                metadata: FileMetadata {
                    digest: Some(digest.clone()),
                    size: Some(bytes.len() as u64),
                    priority: Some(0),
                    ..FileMetadata::default()
                },
                full_path: isolated.clone(),
            },
        )
        .await?;

        state.files = hashed;
        info!("{}: {} files, isolated {}", name, state.files.len(), digest);
        Ok(IsolatedTree {
            name,
            digest,
            state_path: state::state_path(isolated),
            state,
        })
    }
}

/// Send on the shared stream unless cancelled. A closed stream means a
/// downstream stage already gave up.
async fn emit(
    sink: &mpsc::Sender<FileAsset>,
    cancel: &CancellationToken,
    asset: FileAsset,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(IsolateError::Interrupted),
        res = sink.send(asset) => res.map_err(|_| IsolateError::Interrupted),
    }
}

/// Load state and config, substitute variables and expand directories.
fn prepare(tree: &Tree, parser: &dyn ConfigFileParser, algo: HashAlgo) -> Result<Prepared> {
    let opts = &tree.opts;
    let state_path = state::state_path(&opts.isolated);
    let isolated_dir = opts.isolated.parent().unwrap_or_else(|| Path::new("/"));
    let isolate_file = paths::posix_offset(&opts.isolate, isolated_dir).unwrap_or_default();

    let mut state = SavedState::load_or_default(&state_path, algo);
    if !state.isolate_file.is_empty() && state.isolate_file != isolate_file {
        warn!(
            "Discarding saved state {}: isolate file changed from {} to {}",
            state_path.display(),
            state.isolate_file,
            isolate_file
        );
        state = SavedState::new(algo);
    }
    state.isolate_file = isolate_file;
    state.update_config(&opts.config_variables);
    state.extra_variables = opts.extra_variables.clone();
    state.path_variables = opts.path_variables.clone();

    let settings = load_isolate_for_config(&opts.isolate, parser, &state.config_variables)?;
    let isolate_dir = if settings.is_empty() {
        opts.isolate.parent().unwrap_or_else(|| Path::new("/")).to_path_buf()
    } else {
        settings.isolate_dir().to_path_buf()
    };

    let variables = substitution_variables(tree, &isolate_dir, &state)?;
    let command = settings
        .command()
        .iter()
        .map(|arg| eval_variables(arg, &variables))
        .collect::<Result<Vec<_>>>()?;
    let deps = settings
        .files()
        .iter()
        .map(|f| eval_variables(f, &variables))
        .collect::<Result<Vec<_>>>()?;

    // Resolve against the isolate dir, keeping the directory marker.
    let resolved: Vec<(PathBuf, bool)> = deps
        .iter()
        .map(|dep| {
            let full = paths::normalize(&isolate_dir.join(paths::from_posix(dep)));
            (full, dep.ends_with('/'))
        })
        .collect();

    let mut root_dir = isolate_dir.clone();
    for (full, is_dir) in &resolved {
        let anchor = if *is_dir {
            full.as_path()
        } else {
            full.parent().unwrap_or(full)
        };
        root_dir = paths::common_ancestor(&root_dir, anchor);
    }
    let relative_cwd = match paths::posix_offset(&isolate_dir, &root_dir) {
        Some(p) if !p.is_empty() => p,
        _ => ".".to_string(),
    };

    let blacklist = compile_blacklist(&opts.blacklist)?;
    let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();
    for ((full, is_dir), dep) in resolved.into_iter().zip(&deps) {
        let stat = std::fs::symlink_metadata(&full).map_err(|e| IsolateError::io(&full, e))?;
        if is_dir {
            if !stat.is_dir() {
                return Err(IsolateError::config(format!(
                    "{} is not a directory but ends with a slash",
                    dep
                )));
            }
            for path in expand_directory(&full, &blacklist)? {
                let key = root_key(&path, &root_dir)?;
                files.insert(key, path);
            }
        } else {
            if stat.is_dir() {
                return Err(IsolateError::config(format!(
                    "{} is a directory but doesn't end with a slash",
                    dep
                )));
            }
            files.insert(root_key(&full, &root_dir)?, full);
        }
    }

    state.command = command;
    state.read_only = settings.read_only();
    state.relative_cwd = relative_cwd;
    state.root_dir = root_dir;
    Ok(Prepared {
        state,
        files: files.into_iter().collect(),
    })
}

fn root_key(path: &Path, root_dir: &Path) -> Result<String> {
    path.strip_prefix(root_dir)
        .map(paths::to_posix)
        .map_err(|_| {
            IsolateError::config(format!(
                "{} is outside of {}",
                path.display(),
                root_dir.display()
            ))
        })
}

/// Values available to `<(NAME)`: config, then extra, then path variables.
///
/// Relative path variable values are re-expressed relative to the isolate
/// directory.
fn substitution_variables(
    tree: &Tree,
    isolate_dir: &Path,
    state: &SavedState,
) -> Result<BTreeMap<String, String>> {
    let mut out = state.config_variables.clone();
    out.extend(state.extra_variables.clone());
    for (name, value) in &state.path_variables {
        let native = paths::from_posix(value);
        if native.is_absolute() {
            out.insert(name.clone(), value.clone());
            continue;
        }
        let full = paths::normalize(&tree.cwd.join(native));
        let rel = paths::posix_offset(&full, isolate_dir).ok_or_else(|| {
            IsolateError::config(format!(
                "path variable {}={} can't be made relative to {}",
                name,
                value,
                isolate_dir.display()
            ))
        })?;
        out.insert(name.clone(), if rel.is_empty() { ".".to_string() } else { rel });
    }
    Ok(out)
}

/// Replace every `<(NAME)` in `input`. Unknown names are a config error.
pub fn eval_variables(input: &str, variables: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(PATH_VARIABLE_MARKER) {
        out.push_str(&rest[..start]);
        let after = &rest[start + PATH_VARIABLE_MARKER.len()..];
        let end = after.find(')').ok_or_else(|| {
            IsolateError::config(format!("unterminated variable in {:?}", input))
        })?;
        let name = &after[..end];
        let value = variables.get(name).ok_or_else(|| {
            IsolateError::config(format!("undefined variable {:?} in {:?}", name, input))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn compile_blacklist(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| IsolateError::config(format!("bad blacklist pattern {:?}: {}", p, e)))
        })
        .collect()
}

fn is_blacklisted(relative: &Path, blacklist: &[Pattern]) -> bool {
    let posix = paths::to_posix(relative);
    blacklist.iter().any(|pattern| {
        pattern.matches(&posix)
            || relative
                .components()
                .any(|c| pattern.matches(&c.as_os_str().to_string_lossy()))
    })
}

/// Every non-directory under `dir`, sorted, symlinks not followed.
fn expand_directory(dir: &Path, blacklist: &[Pattern]) -> Result<Vec<PathBuf>> {
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            !is_blacklisted(relative, blacklist)
        });

    let mut out = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            match e.into_io_error() {
                Some(io) => IsolateError::io(path, io),
                None => IsolateError::config(format!("filesystem loop under {}", path.display())),
            }
        })?;
        if !entry.file_type().is_dir() {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}
