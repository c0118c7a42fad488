use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

pub mod github;
mod narinfo;
pub mod object;
#[cfg(test)]
mod testing;

pub use github::{
    AssetLookup,
    GithubReleaseStorage,
    GithubReleasesConfig,
    ReleaseApiError,
    ReleaseAsset,
    ReleaseCatalog,
    ReleaseLocation,
};
pub use object::ObjectStoreStorage;

/// Directory (or key prefix) holding narinfo records.
pub const NARINFO_DIR: &str = "narinfo";
pub const NARINFO_EXTENSION: &str = "narinfo";
/// Key prefix holding NAR payloads for object-store backends.
pub const NAR_DIR: &str = "nar";

pub type NarStream = BoxStream<'static, Result<Bytes>>;

/// Capabilities shared by every cache storage backend.
///
/// Misses are reported as `Ok(None)` or `Ok(false)`. Errors are reserved for
/// failures the caller has to act on.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn has_narinfo(&self, hash: &str) -> Result<bool>;

    async fn get_narinfo(&self, hash: &str) -> Result<Option<String>>;

    /// Stores the narinfo text verbatim, replacing any previous record.
    async fn put_narinfo(&self, hash: &str, content: &str) -> Result<()>;

    async fn has_nar(&self, filename: &str) -> Result<bool>;

    async fn get_nar_stream(&self, filename: &str) -> Result<Option<NarStream>>;

    async fn put_nar_stream(&self, filename: &str, data: NarStream) -> Result<()>;

    /// Direct link to the payload. Never touches the network, so the link
    /// may point at a payload that was never uploaded.
    fn nar_download_url(&self, filename: &str) -> String;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskStorageConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Disk(DiskStorageConfig),
    S3(S3Config),
    GithubReleases(GithubReleasesConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Disk(DiskStorageConfig {
            path: "opencache_storage".to_string(),
        })
    }
}

impl StorageConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageConfig::Disk(_) => "disk",
            StorageConfig::S3(_) => "s3",
            StorageConfig::GithubReleases(_) => "github_releases",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            StorageConfig::Disk(disk) if disk.path.is_empty() => {
                Err(anyhow!("disk storage requires a path"))
            }
            StorageConfig::S3(s3) if s3.bucket.is_empty() || s3.region.is_empty() => {
                Err(anyhow!("s3 storage requires a bucket and a region"))
            }
            StorageConfig::GithubReleases(github) => github.validate(),
            _ => Ok(()),
        }
    }
}

/// Builds the backend selected by `config`.
pub fn create_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    config.validate()?;
    let backend: Arc<dyn StorageBackend> = match config {
        StorageConfig::Disk(disk) => Arc::new(ObjectStoreStorage::disk(disk)?),
        StorageConfig::S3(s3) => Arc::new(ObjectStoreStorage::s3(s3)?),
        StorageConfig::GithubReleases(github) => {
            Arc::new(GithubReleaseStorage::new(github.clone())?)
        }
    };
    tracing::info!(backend = config.backend_name(), "storage backend ready");
    Ok(backend)
}

/// Rejects keys that would escape their directory or collide with hidden
/// files.
pub fn validate_key(kind: &str, key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('.') || key.contains(|c: char| c == '/' || c == '\\') {
        return Err(anyhow!("invalid {}: {:?}", kind, key));
    }
    Ok(())
}

pub async fn read_all(mut stream: NarStream) -> Result<Bytes> {
    let mut bytes = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    Ok(bytes.into())
}

pub fn stream_from_bytes(data: impl Into<Bytes>) -> NarStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}
