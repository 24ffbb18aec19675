//! Isolate Core - content-addressed tree archiver
//!
//! Features:
//! - Per-platform config resolution (merge of variable-gated file lists)
//! - SHA-1 content hashing with an mtime/size cache in saved state
//! - Parallel hashing with Rayon
//! - Cross-tree path dedup and digest dedup before upload
//! - Check-then-push upload to memory, local or S3/R2 stores
//! - Cancellation threaded through every stage

pub mod config;
pub mod dedup;
pub mod error;
pub mod hasher;
pub mod parser;
pub mod paths;
pub mod pipeline;
pub mod state;
pub mod storage;
pub mod tree;

pub use config::{compute_config_name, ConfigName, ConfigSettings, ConfigValue, Configs};
pub use dedup::Deduplicator;
pub use error::{IsolateError, Result, StorageError};
pub use hasher::{hash_file, FileMetadata, HashAlgo, Hasher};
pub use parser::{load_isolate_for_config, ConfigFileParser, JsonConfigParser};
pub use pipeline::{archive, Archiver};
pub use state::SavedState;
pub use storage::{open_storage, StorageBackend, UploadItem};
pub use tree::{ArchiveOptions, FileAsset, IsolatedTree, Tree, TreeIsolator};
