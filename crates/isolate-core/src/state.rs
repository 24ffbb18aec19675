//! Saved state: per-target memory of the previous run.
//!
//! Lives next to the `.isolated` output as `<isolated>.state` and lets the
//! next run skip hashing files whose mtime and size did not change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IsolateError, Result};
use crate::hasher::{FileMetadata, HashAlgo};

/// Bump on any breaking change of the layout below.
pub const SAVED_STATE_VERSION: &str = "1.0";

/// `foo.isolated` -> `foo.isolated.state`.
pub fn state_path(isolated: &Path) -> PathBuf {
    let mut name = isolated.as_os_str().to_os_string();
    name.push(".state");
    PathBuf::from(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedState {
    /// Rejects files written on another OS.
    #[serde(rename = "OS")]
    pub os: String,
    pub algo: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub config_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_variables: BTreeMap<String, String>,
    /// Keyed by posix path relative to `root_dir`.
    #[serde(default)]
    pub files: BTreeMap<String, FileMetadata>,
    /// Isolate file, relative to the directory of the `.isolated` file.
    #[serde(default)]
    pub isolate_file: String,
    #[serde(default)]
    pub path_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub read_only: Option<u8>,
    #[serde(default)]
    pub relative_cwd: String,
    #[serde(default)]
    pub root_dir: PathBuf,
    pub version: String,
}

impl SavedState {
    pub fn new(algo: HashAlgo) -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            algo: algo.to_string(),
            command: Vec::new(),
            config_variables: BTreeMap::new(),
            extra_variables: BTreeMap::new(),
            files: BTreeMap::new(),
            isolate_file: String::new(),
            path_variables: BTreeMap::new(),
            read_only: None,
            relative_cwd: String::new(),
            root_dir: PathBuf::new(),
            version: SAVED_STATE_VERSION.to_string(),
        }
    }

    /// Load the state at `path`, or a fresh one.
    ///
    /// Anything unusable (missing, malformed, other OS, other format version,
    /// other algorithm) is discarded wholesale.
    pub fn load_or_default(path: &Path, algo: HashAlgo) -> Self {
        match Self::load(path) {
            Ok(Some(state)) => {
                if let Err(reason) = state.check_compatible(algo) {
                    warn!("Discarding saved state {}: {}", path.display(), reason);
                    Self::new(algo)
                } else {
                    debug!("Loaded {} cached entries from {}", state.files.len(), path.display());
                    state
                }
            }
            Ok(None) => Self::new(algo),
            Err(e) => {
                warn!("Discarding saved state: {}", e);
                Self::new(algo)
            }
        }
    }

    /// `Ok(None)` when there is no file.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(IsolateError::io(path, e)),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|source| IsolateError::Json {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| IsolateError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|source| IsolateError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, content).map_err(|e| IsolateError::io(path, e))?;
        Ok(())
    }

    pub fn check_compatible(&self, algo: HashAlgo) -> std::result::Result<(), String> {
        if self.os != std::env::consts::OS {
            return Err(format!("unexpected OS {:?}", self.os));
        }
        if self.version != SAVED_STATE_VERSION {
            return Err(format!("unsupported version {:?}", self.version));
        }
        if self.algo != algo.as_str() {
            return Err(format!("unexpected algo {:?}", self.algo));
        }
        Ok(())
    }

    /// Config variables are needed before the isolate file can be resolved,
    /// so they are merged first.
    pub fn update_config(&mut self, vars: &BTreeMap<String, String>) {
        for (k, v) in vars {
            self.config_variables.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_state_path() {
        assert_eq!(
            state_path(Path::new("/out/foo.isolated")),
            PathBuf::from("/out/foo.isolated.state")
        );
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("foo.isolated.state");
        let mut state = SavedState::new(HashAlgo::Sha1);
        state.command = vec!["./foo".into()];
        state.files.insert(
            "foo".into(),
            FileMetadata {
                digest: Some("abc".into()),
                size: Some(3),
                mtime: Some(42),
                ..Default::default()
            },
        );
        state.save(&path).unwrap();

        let loaded = SavedState::load_or_default(&path, HashAlgo::Sha1);
        assert_eq!(loaded, state);
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"OS\""));
        assert!(raw.contains("\"t\": 42"));
    }

    #[test]
    fn test_incompatible_state_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("foo.isolated.state");
        let mut state = SavedState::new(HashAlgo::Sha1);
        state.os = "plan9".into();
        state.files.insert("foo".into(), FileMetadata::default());
        state.save(&path).unwrap();
        assert!(SavedState::load_or_default(&path, HashAlgo::Sha1).files.is_empty());

        let mut state = SavedState::new(HashAlgo::Sha1);
        state.version = "0.1".into();
        state.files.insert("foo".into(), FileMetadata::default());
        state.save(&path).unwrap();
        assert!(SavedState::load_or_default(&path, HashAlgo::Sha1).files.is_empty());

        fs::write(&path, "not json").unwrap();
        assert!(SavedState::load_or_default(&path, HashAlgo::Sha1).files.is_empty());
    }

    #[test]
    fn test_update_config() {
        let mut state = SavedState::new(HashAlgo::Sha1);
        state.config_variables.insert("OS".into(), "mac".into());
        let mut vars = BTreeMap::new();
        vars.insert("OS".to_string(), "linux".to_string());
        vars.insert("chromeos".to_string(), "0".to_string());
        state.update_config(&vars);
        assert_eq!(state.config_variables, vars);
    }
}
