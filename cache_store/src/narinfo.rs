use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use object_store::{path::Path, ObjectStore, PutPayload};

use crate::{validate_key, NARINFO_DIR, NARINFO_EXTENSION};

/// narinfo records kept as `narinfo/<hash>.narinfo` in an object store.
#[derive(Clone)]
pub(crate) struct NarinfoStore {
    object_store: Arc<dyn ObjectStore>,
}

impl NarinfoStore {
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self { object_store }
    }

    fn path(hash: &str) -> Result<Path> {
        validate_key("narinfo hash", hash)?;
        Ok(Path::from(NARINFO_DIR).child(format!("{}.{}", hash, NARINFO_EXTENSION)))
    }

    pub async fn has(&self, hash: &str) -> Result<bool> {
        let path = Self::path(hash)?;
        match self.object_store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to stat narinfo {}", path)),
        }
    }

    pub async fn get(&self, hash: &str) -> Result<Option<String>> {
        let path = Self::path(hash)?;
        let result = match self.object_store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read narinfo {}", path)),
        };
        let bytes = result.bytes().await?;
        let content = String::from_utf8(bytes.to_vec())
            .with_context(|| format!("narinfo {} is not valid utf-8", path))?;
        Ok(Some(content))
    }

    pub async fn put(&self, hash: &str, content: &str) -> Result<()> {
        let path = Self::path(hash)?;
        let payload = PutPayload::from(Bytes::from(content.to_owned()));
        self.object_store
            .put(&path, payload)
            .await
            .with_context(|| format!("failed to write narinfo {}", path))?;
        Ok(())
    }
}
