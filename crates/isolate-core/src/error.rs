//! Error taxonomy shared by every stage of the archive pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a [`crate::storage::StorageBackend`].
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage {location} is unreachable: {reason}")]
    Unreachable { location: String, reason: String },

    #[error("push of {digest} was rejected: {reason}")]
    PushRejected { digest: String, reason: String },

    #[error("object {0} is not present in the store")]
    NotFound(String),

    #[error("{0} is not supported by this storage backend")]
    Unsupported(&'static str),

    #[error("invalid storage endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("storage I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The crate-wide error type.
#[derive(Debug, Error)]
pub enum IsolateError {
    /// Unparsable or contradictory configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("these configuration variables were missing from the command line: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    #[error("file {} is missing", .0.display())]
    MissingFile(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not supported, only sha-1")]
    HashAlgorithm(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("malformed JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("worker task failed: {0}")]
    Panicked(String),

    #[error("interrupted")]
    Interrupted,
}

impl IsolateError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap an I/O error, turning `NotFound` into [`IsolateError::MissingFile`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::MissingFile(path)
        } else {
            Self::FileSystem { path, source }
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

pub type Result<T, E = IsolateError> = std::result::Result<T, E>;
