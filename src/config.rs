use std::path::Path;

use anyhow::{anyhow, Result};
use cache_store::StorageConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::static_site::{DEFAULT_PRIORITY, DEFAULT_STORE_DIR};

fn default_output_dir() -> String {
    "opencache_site".to_string()
}

fn default_store_dir() -> String {
    DEFAULT_STORE_DIR.to_string()
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

fn default_web_url() -> String {
    "https://github.com".to_string()
}

/// Release whose download URLs serve the NAR files of an exported site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseConfig {
    pub owner: String,
    pub repo: String,
    pub tag: String,
    #[serde(default = "default_web_url")]
    pub web_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Defaults to the release of a `github_releases` storage backend.
    #[serde(default)]
    pub release: Option<ReleaseConfig>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            output_dir: default_output_dir(),
            store_dir: default_store_dir(),
            priority: default_priority(),
            release: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enable_tracing: bool,
    #[serde(default)]
    pub enable_metrics: bool,
    /// OTLP collector endpoint, the exporter default when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub structured_logging: bool,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl CacheConfig {
    /// Reads the YAML file at `path`, or the defaults when no file is given,
    /// then applies `OPENCACHE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<CacheConfig> {
        let figment = match path {
            Some(path) => {
                let config_str = std::fs::read_to_string(path)
                    .map_err(|e| anyhow!("unable to read config {}: {}", path.display(), e))?;
                Figment::new().merge(Yaml::string(&config_str))
            }
            None => Figment::from(Serialized::defaults(CacheConfig::default())),
        };
        Self::from_figment(figment, std::env::var("GITHUB_TOKEN").ok())
    }

    fn from_figment(figment: Figment, github_token: Option<String>) -> Result<CacheConfig> {
        let mut config: CacheConfig = figment
            .merge(Env::prefixed("OPENCACHE_").split("__"))
            .extract()?;
        if let StorageConfig::GithubReleases(github) = &mut config.storage {
            if github.token.is_none() {
                github.token = github_token;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Backend specific checks (tokens, buckets) happen when the backend is
    /// built, so commands that never touch it still run without them.
    pub fn validate(&self) -> Result<()> {
        if self.export.output_dir.is_empty() {
            return Err(anyhow!("export.output_dir must not be empty"));
        }
        if !self.export.store_dir.starts_with('/') {
            return Err(anyhow!(
                "export.store_dir must be an absolute path: {}",
                self.export.store_dir
            ));
        }
        if let Some(release) = &self.export.release {
            if release.owner.is_empty() || release.repo.is_empty() || release.tag.is_empty() {
                return Err(anyhow!("export.release needs owner, repo and tag"));
            }
        }
        Ok(())
    }
}
