//! Storage backend on top of GitHub Releases.
//!
//! NAR files are stored as assets of a single release, identified by its
//! tag. narinfo files stay on the local filesystem under
//! `<local_path>/narinfo/<hash>.narinfo` so they can be exported as a static
//! site later.
//!
//! The release API has no content addressing: the release is created lazily
//! on first use, assets are located by listing, and an overwrite is a delete
//! followed by an upload.

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use metrics::{storage, Timer};
use object_store::local::LocalFileSystem;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{
    header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT},
    Method,
    RequestBuilder,
    Response,
    StatusCode,
};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    narinfo::NarinfoStore,
    read_all,
    validate_key,
    NarStream,
    StorageBackend,
    NARINFO_DIR,
};

const GITHUB_API_VERSION: &str = "2022-11-28";
const GITHUB_JSON: &str = "application/vnd.github+json";
const OCTET_STREAM: &str = "application/octet-stream";
const CLIENT_USER_AGENT: &str = "opencache";

/// Page size used when listing release assets. GitHub caps it at 100.
pub const ASSETS_PER_PAGE: usize = 100;
/// Upper bound on listing pages walked while looking for one asset.
pub const MAX_ASSET_PAGES: usize = 100;

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_upload_url() -> String {
    "https://uploads.github.com".to_string()
}

fn default_web_url() -> String {
    "https://github.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GithubReleasesConfig {
    pub owner: String,
    pub repo: String,
    pub release_tag: String,
    /// Root of the local narinfo store.
    pub local_path: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_upload_url")]
    pub upload_url: String,
    #[serde(default = "default_web_url")]
    pub web_url: String,
}

impl GithubReleasesConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("owner", &self.owner),
            ("repo", &self.repo),
            ("release_tag", &self.release_tag),
            ("local_path", &self.local_path),
        ] {
            if value.is_empty() {
                return Err(anyhow!("github_releases storage requires {}", field));
            }
        }
        if self.token.as_deref().unwrap_or_default().is_empty() {
            return Err(anyhow!(
                "github_releases storage requires a token (set storage.token or GITHUB_TOKEN)"
            ));
        }
        Ok(())
    }

    pub fn narinfo_dir(&self) -> PathBuf {
        PathBuf::from(&self.local_path).join(NARINFO_DIR)
    }

    pub fn location(&self) -> Result<ReleaseLocation> {
        ReleaseLocation::new(&self.web_url, &self.owner, &self.repo, &self.release_tag)
    }
}

fn base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid url {:?}", raw))?;
    if url.cannot_be_a_base() {
        return Err(anyhow!("url {:?} cannot be used as a base", raw));
    }
    Ok(url)
}

fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Characters left alone by JavaScript's `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

/// Public, unauthenticated download location of a release's assets.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseLocation {
    download_base: String,
}

impl ReleaseLocation {
    pub fn new(web_url: &str, owner: &str, repo: &str, tag: &str) -> Result<Self> {
        let releases = endpoint(&base_url(web_url)?, &[owner, repo, "releases", "download"]);
        let download_base = format!("{}/{}", releases.as_str(), encode_component(tag));
        Ok(Self { download_base })
    }

    /// `<web_url>/<owner>/<repo>/releases/download/<tag>`, tag percent-encoded.
    pub fn download_base_url(&self) -> String {
        self.download_base.clone()
    }

    pub fn download_url(&self, filename: &str) -> String {
        format!("{}/{}", self.download_base, encode_component(filename))
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReleaseApiError {
    #[error("{operation} failed with status {status}: {body}")]
    UnexpectedStatus {
        operation: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("{operation} request failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl ReleaseApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::UnexpectedStatus { status, .. } => Some(*status),
            Self::Transport { source, .. } => source.status(),
        }
    }

    fn transport(operation: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| Self::Transport { operation, source }
    }
}

async fn ensure_success(
    operation: &'static str,
    response: Response,
) -> Result<Response, ReleaseApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ReleaseApiError::UnexpectedStatus {
        operation,
        status,
        body,
    })
}

#[derive(Debug, Deserialize)]
struct Release {
    id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseAsset {
    pub id: u64,
    pub name: String,
    /// API url of the asset; answers with the content when asked for
    /// `application/octet-stream`.
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub browser_download_url: Option<String>,
}

/// Outcome of looking up an asset by name.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetLookup {
    Found(ReleaseAsset),
    /// The listing was read completely and has no such asset.
    Missing,
    /// The release or its listing could not be read.
    Unavailable(String),
}

impl AssetLookup {
    pub fn into_asset(self) -> Option<ReleaseAsset> {
        match self {
            AssetLookup::Found(asset) => Some(asset),
            AssetLookup::Missing | AssetLookup::Unavailable(_) => None,
        }
    }
}

/// Lookup-or-create of the release for one tag, and asset operations inside
/// it.
///
/// The release id is memoized for the lifetime of the catalog. Concurrent
/// first calls on the same catalog share one resolution; separate catalogs
/// (or processes) can still race between a lookup miss and the create, which
/// is answered by a single re-lookup when GitHub rejects the create.
pub struct ReleaseCatalog {
    client: reqwest::Client,
    token: String,
    owner: String,
    repo: String,
    tag: String,
    api_url: Url,
    upload_url: Url,
    release_id: OnceCell<u64>,
    metrics: Arc<storage::Metrics>,
}

impl ReleaseCatalog {
    pub fn new(config: &GithubReleasesConfig, metrics: Arc<storage::Metrics>) -> Result<Self> {
        let token = config
            .token
            .clone()
            .ok_or_else(|| anyhow!("github_releases storage requires a token"))?;
        let client = reqwest::Client::builder()
            .build()
            .context("unable to build http client")?;
        Ok(Self {
            client,
            token,
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            tag: config.release_tag.clone(),
            api_url: base_url(&config.api_url)?,
            upload_url: base_url(&config.upload_url)?,
            release_id: OnceCell::new(),
            metrics,
        })
    }

    fn repo_endpoint(&self, base: &Url, segments: &[&str]) -> Url {
        let mut all = vec!["repos", self.owner.as_str(), self.repo.as_str()];
        all.extend_from_slice(segments);
        endpoint(base, &all)
    }

    fn request(&self, method: Method, url: Url, accept: &'static str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(ACCEPT, accept)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
    }

    /// Returns the id of the release for the configured tag, creating the
    /// release when the tag is unknown.
    pub async fn resolve_release(&self) -> Result<u64> {
        self.release_id
            .get_or_try_init(|| self.lookup_or_create_release())
            .await
            .copied()
    }

    async fn lookup_or_create_release(&self) -> Result<u64> {
        if let Some(id) = self.lookup_release().await? {
            debug!(release_id = id, tag = %self.tag, "found release");
            return Ok(id);
        }
        match self.create_release().await {
            Ok(id) => {
                info!(release_id = id, tag = %self.tag, "created release");
                Ok(id)
            }
            Err(err) if err.status() == Some(StatusCode::UNPROCESSABLE_ENTITY) => {
                warn!(tag = %self.tag, "release creation rejected, looking it up again: {}", err);
                match self.lookup_release().await? {
                    Some(id) => Ok(id),
                    None => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn lookup_release(&self) -> Result<Option<u64>, ReleaseApiError> {
        const OPERATION: &str = "release lookup";
        let url = self.repo_endpoint(&self.api_url, &["releases", "tags", &self.tag]);
        let response = self
            .request(Method::GET, url, GITHUB_JSON)
            .send()
            .await
            .map_err(ReleaseApiError::transport(OPERATION))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let release: Release = ensure_success(OPERATION, response)
            .await?
            .json()
            .await
            .map_err(ReleaseApiError::transport(OPERATION))?;
        Ok(Some(release.id))
    }

    async fn create_release(&self) -> Result<u64, ReleaseApiError> {
        const OPERATION: &str = "release creation";
        let url = self.repo_endpoint(&self.api_url, &["releases"]);
        let body = serde_json::json!({
            "tag_name": self.tag,
            "name": format!("Nix Binary Cache ({})", self.tag),
            "body": "Nix binary cache NAR files managed by opencache.",
            "draft": false,
            "prerelease": false,
        });
        let response = self
            .request(Method::POST, url, GITHUB_JSON)
            .json(&body)
            .send()
            .await
            .map_err(ReleaseApiError::transport(OPERATION))?;
        let release: Release = ensure_success(OPERATION, response)
            .await?
            .json()
            .await
            .map_err(ReleaseApiError::transport(OPERATION))?;
        Ok(release.id)
    }

    async fn list_assets_page(
        &self,
        release_id: u64,
        page: usize,
    ) -> Result<Vec<ReleaseAsset>, ReleaseApiError> {
        const OPERATION: &str = "asset listing";
        let release = release_id.to_string();
        let url = self.repo_endpoint(&self.api_url, &["releases", &release, "assets"]);
        let response = self
            .request(Method::GET, url, GITHUB_JSON)
            .query(&[("per_page", ASSETS_PER_PAGE), ("page", page)])
            .send()
            .await
            .map_err(ReleaseApiError::transport(OPERATION))?;
        ensure_success(OPERATION, response)
            .await?
            .json()
            .await
            .map_err(ReleaseApiError::transport(OPERATION))
    }

    /// Looks `filename` up in the release's asset listing, walking pages
    /// until the name shows up or the listing runs out. Failing to resolve
    /// the release is an error; a failed listing is `Unavailable`.
    pub async fn lookup_asset(&self, filename: &str) -> Result<AssetLookup> {
        let release_id = self.resolve_release().await?;
        for page in 1..=MAX_ASSET_PAGES {
            let assets = match self.list_assets_page(release_id, page).await {
                Ok(assets) => assets,
                Err(err) => return Ok(AssetLookup::Unavailable(err.to_string())),
            };
            let last_page = assets.len() < ASSETS_PER_PAGE;
            if let Some(asset) = assets.into_iter().find(|asset| asset.name == filename) {
                return Ok(AssetLookup::Found(asset));
            }
            if last_page {
                return Ok(AssetLookup::Missing);
            }
        }
        warn!(
            filename,
            release_id, "asset listing is longer than {} pages, giving up", MAX_ASSET_PAGES
        );
        Ok(AssetLookup::Missing)
    }

    /// Same as [`Self::lookup_asset`], with listing failures reported as a
    /// miss.
    pub async fn find_asset(&self, filename: &str) -> Result<Option<ReleaseAsset>> {
        let lookup = self.lookup_asset(filename).await?;
        if let AssetLookup::Unavailable(reason) = &lookup {
            warn!(filename, "asset lookup failed, reporting it as missing: {}", reason);
            self.metrics
                .degraded_reads
                .add(1, &self.metrics.labels("find_asset"));
        }
        Ok(lookup.into_asset())
    }

    pub async fn delete_asset(&self, asset_id: u64) -> Result<(), ReleaseApiError> {
        const OPERATION: &str = "asset deletion";
        let asset = asset_id.to_string();
        let url = self.repo_endpoint(&self.api_url, &["releases", "assets", &asset]);
        let response = self
            .request(Method::DELETE, url, GITHUB_JSON)
            .send()
            .await
            .map_err(ReleaseApiError::transport(OPERATION))?;
        ensure_success(OPERATION, response).await?;
        Ok(())
    }

    pub async fn upload_asset(
        &self,
        release_id: u64,
        filename: &str,
        body: Bytes,
    ) -> Result<(), ReleaseApiError> {
        const OPERATION: &str = "asset upload";
        let release = release_id.to_string();
        let url = self.repo_endpoint(&self.upload_url, &["releases", &release, "assets"]);
        let response = self
            .request(Method::POST, url, GITHUB_JSON)
            .query(&[("name", filename)])
            .header(CONTENT_TYPE, OCTET_STREAM)
            .header(CONTENT_LENGTH, body.len())
            .body(body)
            .send()
            .await
            .map_err(ReleaseApiError::transport(OPERATION))?;
        ensure_success(OPERATION, response).await?;
        Ok(())
    }

    /// Streams the content of `asset`, following GitHub's redirect to the
    /// blob host. Any failure is reported as `None`.
    pub async fn fetch_asset(&self, asset: &ReleaseAsset) -> Option<NarStream> {
        let url = match Url::parse(&asset.url) {
            Ok(url) => url,
            Err(err) => {
                warn!(asset = %asset.name, "asset has an invalid url {:?}: {}", asset.url, err);
                return None;
            }
        };
        let response = match self.request(Method::GET, url, OCTET_STREAM).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(
                    asset = %asset.name,
                    status = %response.status(),
                    "asset download failed, reporting it as missing"
                );
                return None;
            }
            Err(err) => {
                warn!(asset = %asset.name, "asset download failed, reporting it as missing: {}", err);
                return None;
            }
        };
        let name = asset.name.clone();
        let stream = async_stream::stream! {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                yield chunk.map_err(|e| anyhow!("failed to read asset {}: {}", name, e));
            }
        };
        Some(Box::pin(stream))
    }
}

/// Collects the upload body. GitHub needs the length up front, so the whole
/// payload is held in memory.
async fn prepare_upload(data: NarStream) -> Result<Bytes> {
    read_all(data).await
}

pub struct GithubReleaseStorage {
    catalog: ReleaseCatalog,
    narinfo: NarinfoStore,
    location: ReleaseLocation,
    metrics: Arc<storage::Metrics>,
}

impl GithubReleaseStorage {
    pub fn new(config: GithubReleasesConfig) -> Result<Self> {
        config.validate()?;
        let narinfo_dir = config.narinfo_dir();
        std::fs::create_dir_all(&narinfo_dir).with_context(|| {
            format!(
                "unable to create narinfo directory {}",
                narinfo_dir.display()
            )
        })?;
        let local = LocalFileSystem::new_with_prefix(&config.local_path)?;
        let metrics = Arc::new(storage::Metrics::new("github_releases"));
        info!(
            owner = %config.owner,
            repo = %config.repo,
            tag = %config.release_tag,
            "using github releases storage"
        );
        Ok(Self {
            catalog: ReleaseCatalog::new(&config, metrics.clone())?,
            narinfo: NarinfoStore::new(Arc::new(local)),
            location: config.location()?,
            metrics,
        })
    }

    pub fn catalog(&self) -> &ReleaseCatalog {
        &self.catalog
    }

    pub fn location(&self) -> &ReleaseLocation {
        &self.location
    }
}

#[async_trait]
impl StorageBackend for GithubReleaseStorage {
    async fn has_narinfo(&self, hash: &str) -> Result<bool> {
        let _timer =
            Timer::start_with_labels(&self.metrics.operations, &self.metrics.labels("has_narinfo"));
        self.narinfo.has(hash).await
    }

    async fn get_narinfo(&self, hash: &str) -> Result<Option<String>> {
        let _timer =
            Timer::start_with_labels(&self.metrics.operations, &self.metrics.labels("get_narinfo"));
        self.narinfo.get(hash).await
    }

    async fn put_narinfo(&self, hash: &str, content: &str) -> Result<()> {
        let _timer =
            Timer::start_with_labels(&self.metrics.operations, &self.metrics.labels("put_narinfo"));
        self.narinfo.put(hash, content).await
    }

    async fn has_nar(&self, filename: &str) -> Result<bool> {
        validate_key("nar filename", filename)?;
        let _timer =
            Timer::start_with_labels(&self.metrics.operations, &self.metrics.labels("has_nar"));
        Ok(self.catalog.find_asset(filename).await?.is_some())
    }

    async fn get_nar_stream(&self, filename: &str) -> Result<Option<NarStream>> {
        validate_key("nar filename", filename)?;
        let _timer = Timer::start_with_labels(
            &self.metrics.operations,
            &self.metrics.labels("get_nar_stream"),
        );
        let Some(asset) = self.catalog.find_asset(filename).await? else {
            return Ok(None);
        };
        let stream = self.catalog.fetch_asset(&asset).await;
        if stream.is_none() {
            self.metrics
                .degraded_reads
                .add(1, &self.metrics.labels("get_nar_stream"));
        }
        Ok(stream)
    }

    async fn put_nar_stream(&self, filename: &str, data: NarStream) -> Result<()> {
        validate_key("nar filename", filename)?;
        let _timer = Timer::start_with_labels(
            &self.metrics.operations,
            &self.metrics.labels("put_nar_stream"),
        );
        let release_id = self.catalog.resolve_release().await?;
        let body = prepare_upload(data).await?;

        match self.catalog.lookup_asset(filename).await? {
            AssetLookup::Found(existing) => {
                if let Err(err) = self.catalog.delete_asset(existing.id).await {
                    warn!(
                        filename,
                        asset_id = existing.id,
                        "failed to delete existing asset, uploading anyway: {}",
                        err
                    );
                }
            }
            AssetLookup::Missing => {}
            AssetLookup::Unavailable(reason) => {
                warn!(filename, "could not check for an existing asset: {}", reason);
            }
        }

        let size_bytes = body.len() as u64;
        self.catalog.upload_asset(release_id, filename, body).await?;
        self.metrics.nar_bytes_uploaded.add(size_bytes, &[]);
        info!(filename, size_bytes, release_id, "uploaded nar");
        Ok(())
    }

    fn nar_download_url(&self, filename: &str) -> String {
        self.location.download_url(filename)
    }
}
