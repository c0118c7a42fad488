use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use cache_store::{
    validate_key,
    NarStream,
    ReleaseLocation,
    StorageBackend,
    StorageConfig,
    NARINFO_DIR,
};
use futures::{StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::{
    config::CacheConfig,
    static_site::{generate_static_site, ExportOptions, ExportSummary},
};

/// Resolves where an export reads narinfo files from and which release
/// serves the NAR files.
pub fn export_options(config: &CacheConfig, output_dir: Option<PathBuf>) -> Result<ExportOptions> {
    let export = &config.export;
    let configured_release = export
        .release
        .as_ref()
        .map(|release| {
            ReleaseLocation::new(&release.web_url, &release.owner, &release.repo, &release.tag)
        })
        .transpose()?;

    let (narinfo_dir, release) = match &config.storage {
        StorageConfig::GithubReleases(github) => {
            let release = match configured_release {
                Some(release) => release,
                None => github.location()?,
            };
            (github.narinfo_dir(), release)
        }
        StorageConfig::Disk(disk) => {
            let release = configured_release.ok_or_else(|| {
                anyhow!("exporting a disk store requires export.release to locate the NAR files")
            })?;
            (PathBuf::from(&disk.path).join(NARINFO_DIR), release)
        }
        StorageConfig::S3(_) => {
            return Err(anyhow!(
                "static export needs local narinfo files, s3 storage keeps them remotely"
            ));
        }
    };

    Ok(ExportOptions {
        narinfo_dir,
        output_dir: output_dir.unwrap_or_else(|| PathBuf::from(&export.output_dir)),
        store_dir: export.store_dir.clone(),
        priority: export.priority,
        release,
    })
}

pub async fn export(config: &CacheConfig, output_dir: Option<PathBuf>) -> Result<ExportSummary> {
    let options = export_options(config, output_dir)?;
    generate_static_site(&options).await
}

/// Stores the narinfo for `hash`. When a NAR is given it is uploaded first so
/// a published narinfo never points at a missing payload. Returns the NAR
/// download URL.
pub async fn push(
    storage: &dyn StorageBackend,
    hash: &str,
    narinfo_path: &Path,
    nar: Option<(&Path, &str)>,
) -> Result<Option<String>> {
    validate_key("narinfo hash", hash)?;
    let narinfo = tokio::fs::read_to_string(narinfo_path)
        .await
        .with_context(|| format!("unable to read narinfo {}", narinfo_path.display()))?;

    let mut url = None;
    if let Some((nar_path, nar_filename)) = nar {
        validate_key("nar filename", nar_filename)?;
        let file = tokio::fs::File::open(nar_path)
            .await
            .with_context(|| format!("unable to open nar {}", nar_path.display()))?;
        let stream = ReaderStream::new(file).map_err(anyhow::Error::from).boxed();
        storage.put_nar_stream(nar_filename, stream).await?;
        url = Some(storage.nar_download_url(nar_filename));
    }
    storage.put_narinfo(hash, &narinfo).await?;

    info!(hash, nar_url = ?url, "pushed store path");
    Ok(url)
}

async fn write_stream(mut stream: NarStream, file: &mut tokio::fs::File) -> Result<usize> {
    let mut written = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len();
    }
    file.flush().await?;
    Ok(written)
}

/// Writes the NAR to `output`. Returns false when the cache does not hold it.
/// The payload lands in a hidden sibling file first and replaces `output` only
/// once complete.
pub async fn fetch(storage: &dyn StorageBackend, nar_filename: &str, output: &Path) -> Result<bool> {
    let file_name = output
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid output path {}", output.display()))?;
    let Some(stream) = storage.get_nar_stream(nar_filename).await? else {
        return Ok(false);
    };
    let partial = output.with_file_name(format!(".{}.partial", file_name));
    let mut file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("unable to create {}", partial.display()))?;
    let written = match write_stream(stream, &mut file).await {
        Ok(written) => written,
        Err(err) => {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                warn!(path = %partial.display(), "unable to remove partial download: {}", e);
            }
            return Err(err.context(format!("failed to download nar {}", nar_filename)));
        }
    };
    drop(file);
    tokio::fs::rename(&partial, output)
        .await
        .with_context(|| format!("unable to move download to {}", output.display()))?;
    info!(nar_filename, written, output = %output.display(), "fetched nar");
    Ok(true)
}

pub enum Lookup {
    Narinfo(String),
    Nar(String),
}

pub async fn has(storage: &dyn StorageBackend, lookup: &Lookup) -> Result<bool> {
    match lookup {
        Lookup::Narinfo(hash) => storage.has_narinfo(hash).await,
        Lookup::Nar(filename) => storage.has_nar(filename).await,
    }
}
