//! S3/R2 store
//!
//! Features:
//! - Credentials and bucket stored in ~/.isolate/config.json
//! - Presigned requests via rusty-s3, sent with reqwest
//! - Objects keyed `<namespace>/<digest>`

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{ObjectReader, PushState, StorageBackend, UploadItem};
use crate::error::{IsolateError, Result, StorageError};

/// Lifetime of signed request URLs.
const SIGN_DURATION: Duration = Duration::from_secs(300);

/// Lifetime of URLs handed out by `fetch_url`.
const FETCH_URL_DURATION: Duration = Duration::from_secs(3600);

/// Contents of `~/.isolate/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub s3: Option<S3Config>,
}

/// Bucket and credentials of an S3-compatible store.
///
/// Missing keys take their default; `endpoint` is normally supplied by the
/// `--isolate-server` URL instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub enabled: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            region: "auto".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            enabled: true,
        }
    }
}

/// `~/.isolate/config.json`, or `./.isolate/config.json` without a home.
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".isolate")
        .join("config.json")
}

/// Load the cloud config from its default location.
pub fn load_config() -> Result<CloudConfig> {
    load_config_from(&get_config_path())
}

/// Load a cloud config file; a missing file is an empty config.
pub fn load_config_from(path: &Path) -> Result<CloudConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CloudConfig::default()),
        Err(e) => return Err(IsolateError::io(path, e)),
    };
    serde_json::from_str(&content).map_err(|source| IsolateError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    client: reqwest::Client,
    namespace: String,
    location: String,
}

impl S3Backend {
    pub fn from_config(config: &S3Config, namespace: &str) -> Result<Self, StorageError> {
        if !config.enabled {
            return Err(StorageError::Unreachable {
                location: config.endpoint.clone(),
                reason: "disabled in config".to_string(),
            });
        }
        let endpoint = config
            .endpoint
            .parse()
            .map_err(|_| StorageError::InvalidEndpoint(config.endpoint.clone()))?;
        let bucket = Bucket::new(
            endpoint,
            UrlStyle::Path,
            config.bucket.clone(),
            config.region.clone(),
        )
        .map_err(|_| StorageError::InvalidEndpoint(config.endpoint.clone()))?;
        let credentials = Credentials::new(config.access_key.clone(), config.secret_key.clone());

        Ok(Self {
            bucket,
            credentials,
            client: reqwest::Client::new(),
            namespace: namespace.to_string(),
            location: format!("{}/{}", config.endpoint.trim_end_matches('/'), config.bucket),
        })
    }

    fn key(&self, digest: &str) -> String {
        format!("{}/{}", self.namespace, digest)
    }

    fn unreachable(&self, e: reqwest::Error) -> StorageError {
        StorageError::Unreachable {
            location: self.location.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn location(&self) -> &str {
        &self.location
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn connect(&self) -> Result<(), StorageError> {
        let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
        action.with_max_keys(1);
        let url = action.sign(Duration::from_secs(30));
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if !resp.status().is_success() {
            return Err(StorageError::Unreachable {
                location: self.location.clone(),
                reason: format!("bucket listing returned {}", resp.status()),
            });
        }
        debug!("Connected to {}", self.location);
        Ok(())
    }

    async fn contains(
        &self,
        items: &[UploadItem],
    ) -> Result<HashMap<String, PushState>, StorageError> {
        let mut set = JoinSet::new();
        for item in items {
            let url = self
                .bucket
                .head_object(Some(&self.credentials), &self.key(&item.digest))
                .sign(SIGN_DURATION);
            let client = self.client.clone();
            let digest = item.digest.clone();
            set.spawn(async move { (digest, client.head(url).send().await) });
        }

        let mut missing = HashMap::new();
        while let Some(done) = set.join_next().await {
            let (digest, resp) = done.map_err(|e| StorageError::Unreachable {
                location: self.location.clone(),
                reason: e.to_string(),
            })?;
            let resp = resp.map_err(|e| self.unreachable(e))?;
            match resp.status() {
                s if s.is_success() => {}
                StatusCode::NOT_FOUND => {
                    missing.insert(digest, PushState::default());
                }
                s => {
                    return Err(StorageError::Unreachable {
                        location: self.location.clone(),
                        reason: format!("HEAD {} returned {}", digest, s),
                    })
                }
            }
        }
        Ok(missing)
    }

    async fn push(&self, item: &UploadItem, _state: PushState) -> Result<(), StorageError> {
        let file = item.open().await?;
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &self.key(&item.digest))
            .sign(SIGN_DURATION);
        let resp = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_LENGTH, item.size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if !resp.status().is_success() {
            return Err(StorageError::PushRejected {
                digest: item.digest.clone(),
                reason: format!("PUT returned {}", resp.status()),
            });
        }
        debug!("Uploaded {} ({} bytes)", item.digest, item.size);
        Ok(())
    }

    async fn fetch(&self, digest: &str, offset: u64) -> Result<ObjectReader, StorageError> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &self.key(digest))
            .sign(SIGN_DURATION);
        let mut req = self.client.get(url);
        if offset > 0 {
            req = req.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }
        let resp = req.send().await.map_err(|e| self.unreachable(e))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(digest.to_string())),
            // Offset past the end.
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Box::new(Cursor::new(Vec::new()))),
            s if s.is_success() => {
                let data = resp.bytes().await.map_err(|e| self.unreachable(e))?;
                Ok(Box::new(Cursor::new(data.to_vec())))
            }
            s => Err(StorageError::Unreachable {
                location: self.location.clone(),
                reason: format!("GET {} returned {}", digest, s),
            }),
        }
    }

    async fn fetch_url(&self, digest: &str) -> Result<String, StorageError> {
        Ok(self
            .bucket
            .get_object(Some(&self.credentials), &self.key(digest))
            .sign(FETCH_URL_DURATION)
            .to_string())
    }
}
