use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use metrics::{storage, Timer};
use object_store::{
    aws::{AmazonS3, AmazonS3Builder},
    local::LocalFileSystem,
    path::Path,
    ObjectStore,
    WriteMultipart,
};
use tracing::{debug, info};
use url::Url;

use crate::{
    narinfo::NarinfoStore,
    validate_key,
    DiskStorageConfig,
    NarStream,
    S3Config,
    StorageBackend,
    NAR_DIR,
};

/// Backend keeping narinfo and NAR files side by side in an object store,
/// either a local directory or an S3 bucket.
#[derive(Clone)]
pub struct ObjectStoreStorage {
    object_store: Arc<dyn ObjectStore>,
    narinfo: NarinfoStore,
    public_base: Url,
    metrics: Arc<storage::Metrics>,
}

fn s3_storage(s3: &S3Config) -> Result<AmazonS3> {
    let mut builder = AmazonS3Builder::from_env()
        .with_region(s3.region.as_str())
        .with_bucket_name(s3.bucket.clone());

    // For supporting localstack/minio
    if let Some(endpoint) = &s3.endpoint {
        builder = builder.with_endpoint(endpoint.clone());
        if endpoint.starts_with("http://") {
            builder = builder.with_allow_http(true);
        }
    }
    builder.build().context("unable to build S3 builder")
}

fn s3_public_base(s3: &S3Config) -> Result<Url> {
    let base = match &s3.endpoint {
        Some(endpoint) => format!("{}/{}/", endpoint.trim_end_matches('/'), s3.bucket),
        None => format!("https://{}.s3.{}.amazonaws.com/", s3.bucket, s3.region),
    };
    Url::parse(&base).with_context(|| format!("invalid s3 public url {}", base))
}

fn file_storage(disk: &DiskStorageConfig) -> Result<(LocalFileSystem, Url)> {
    std::fs::create_dir_all(&disk.path)
        .with_context(|| format!("unable to create storage directory {}", disk.path))?;
    let root = std::fs::canonicalize(&disk.path)?;
    let public_base = Url::from_directory_path(&root)
        .map_err(|_| anyhow!("storage path {} is not absolute", root.display()))?;
    let s = LocalFileSystem::new_with_prefix(&root)?;
    Ok((s, public_base))
}

impl ObjectStoreStorage {
    pub fn disk(config: &DiskStorageConfig) -> Result<Self> {
        let (object_store, public_base) = file_storage(config)?;
        info!(path = %config.path, "using disk storage");
        Ok(Self::new(Arc::new(object_store), public_base, "disk"))
    }

    pub fn s3(config: &S3Config) -> Result<Self> {
        let object_store = s3_storage(config)?;
        let public_base = s3_public_base(config)?;
        info!(bucket = %config.bucket, region = %config.region, "using s3 storage");
        Ok(Self::new(Arc::new(object_store), public_base, "s3"))
    }

    fn new(object_store: Arc<dyn ObjectStore>, public_base: Url, backend: &'static str) -> Self {
        Self {
            narinfo: NarinfoStore::new(object_store.clone()),
            object_store,
            public_base,
            metrics: Arc::new(storage::Metrics::new(backend)),
        }
    }

    fn nar_path(filename: &str) -> Result<Path> {
        validate_key("nar filename", filename)?;
        Ok(Path::from(NAR_DIR).child(filename))
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreStorage {
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
        let _timer =
            Timer::start_with_labels(&self.metrics.operations, &self.metrics.labels("has_nar"));
        let path = Self::nar_path(filename)?;
        match self.object_store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to stat nar {}", path)),
        }
    }

    async fn get_nar_stream(&self, filename: &str) -> Result<Option<NarStream>> {
        let _timer = Timer::start_with_labels(
            &self.metrics.operations,
            &self.metrics.labels("get_nar_stream"),
        );
        let path = Self::nar_path(filename)?;
        let get_result = match self.object_store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(anyhow!("can't get nar {:?}: {:?}", path, e)),
        };
        let stream = get_result.into_stream().map(move |chunk| {
            chunk.map_err(|e| anyhow!("error reading nar {}: {:?}", path, e))
        });
        Ok(Some(Box::pin(stream)))
    }

    async fn put_nar_stream(&self, filename: &str, mut data: NarStream) -> Result<()> {
        let _timer = Timer::start_with_labels(
            &self.metrics.operations,
            &self.metrics.labels("put_nar_stream"),
        );
        let path = Self::nar_path(filename)?;
        let m = self.object_store.put_multipart(&path).await?;
        let mut w = WriteMultipart::new(m);
        let mut size_bytes = 0;
        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Err(abort_err) = w.abort().await {
                        debug!(filename, "failed to abort multipart upload: {:?}", abort_err);
                    }
                    return Err(e.context(format!("failed to read nar stream for {}", filename)));
                }
            };
            w.wait_for_capacity(1).await?;
            size_bytes += chunk.len() as u64;
            w.write(&chunk);
        }
        w.finish().await?;
        self.metrics.nar_bytes_uploaded.add(size_bytes, &[]);
        debug!(filename, size_bytes, "stored nar");
        Ok(())
    }

    fn nar_download_url(&self, filename: &str) -> String {
        let mut url = self.public_base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([NAR_DIR, filename]);
        }
        url.to_string()
    }
}
