//! Static Nix binary cache generation.
//!
//! The generated directory can be served by any static host. It holds the
//! narinfo files, a `nix-cache-info` file and a `_redirects` rule sending
//! `/nar/*` requests to the release download URLs where the NAR files live.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use cache_store::{ReleaseLocation, NARINFO_EXTENSION};
use tracing::{debug, info, warn};

pub const CACHE_INFO_FILE: &str = "nix-cache-info";
pub const REDIRECTS_FILE: &str = "_redirects";
pub const DEFAULT_STORE_DIR: &str = "/nix/store";
/// Lower values are preferred by Nix clients.
pub const DEFAULT_PRIORITY: u32 = 30;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub narinfo_dir: PathBuf,
    pub output_dir: PathBuf,
    pub store_dir: String,
    pub priority: u32,
    pub release: ReleaseLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub narinfo_count: usize,
    pub output_dir: PathBuf,
    pub nar_base_url: String,
}

pub fn cache_info(store_dir: &str, priority: u32) -> String {
    format!(
        "StoreDir: {}\nWantMassQuery: 1\nPriority: {}\n",
        store_dir, priority
    )
}

pub fn redirect_rules(nar_base_url: &str) -> String {
    format!("/nar/:filename {}/:filename 302\n", nar_base_url)
}

/// Names of the narinfo files in `dir`, sorted. An unreadable directory
/// holds no records.
async fn list_narinfo_files(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "unable to list narinfo directory, exporting no records: {}", e);
            return Ok(Vec::new());
        }
    };
    let suffix = format!(".{}", NARINFO_EXTENSION);
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.ends_with(&suffix) {
            debug!(name, "skipping non narinfo entry");
            continue;
        }
        // follows symlinks; dangling links are skipped
        match tokio::fs::metadata(entry.path()).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => {
                debug!(name, "skipping narinfo entry that is not a file");
                continue;
            }
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

async fn same_dir(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

pub async fn generate_static_site(options: &ExportOptions) -> Result<ExportSummary> {
    let output_dir = &options.output_dir;
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("unable to create output directory {}", output_dir.display()))?;
    if same_dir(&options.narinfo_dir, output_dir).await {
        return Err(anyhow!(
            "output directory {} is the narinfo directory",
            output_dir.display()
        ));
    }

    tokio::fs::write(
        output_dir.join(CACHE_INFO_FILE),
        cache_info(&options.store_dir, options.priority),
    )
    .await?;

    let narinfo_files = list_narinfo_files(&options.narinfo_dir).await?;
    for name in &narinfo_files {
        tokio::fs::copy(options.narinfo_dir.join(name), output_dir.join(name))
            .await
            .with_context(|| format!("unable to copy narinfo {}", name))?;
    }

    let nar_base_url = options.release.download_base_url();
    tokio::fs::write(output_dir.join(REDIRECTS_FILE), redirect_rules(&nar_base_url)).await?;

    info!(
        narinfo_count = narinfo_files.len(),
        output_dir = %output_dir.display(),
        %nar_base_url,
        "generated static site"
    );
    Ok(ExportSummary {
        narinfo_count: narinfo_files.len(),
        output_dir: output_dir.clone(),
        nar_base_url,
    })
}
