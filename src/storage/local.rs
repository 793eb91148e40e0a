use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{BlobStore, StoredBlob};

pub const LOCAL_BUCKET: &str = "local";

/// Filesystem blob store for development. Keys map to paths under `root`.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("Refusing blob key outside store root: {key}");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn bucket(&self) -> &str {
        LOCAL_BUCKET
    }

    async fn put(&self, local_path: &Path, key: &str) -> Result<StoredBlob> {
        let target = self.path_for(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let size = tokio::fs::copy(local_path, &target)
            .await
            .with_context(|| format!("Failed to copy {} into blob store", local_path.display()))?;
        Ok(StoredBlob { key: key.to_string(), bucket: LOCAL_BUCKET.to_string(), size })
    }

    async fn delete(&self, key: &str, _bucket: &str) -> Result<()> {
        let target = self.path_for(key)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", target.display())),
        }
    }

    async fn sign_url(&self, key: &str, _bucket: &str, ttl: Duration) -> Result<String> {
        let target = self.path_for(key)?;
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            anyhow::bail!("Blob not found: {key}");
        }
        let absolute = std::path::absolute(&target)
            .with_context(|| format!("Failed to resolve {}", target.display()))?;
        let ttl = chrono::Duration::from_std(ttl).context("URL expiry out of range")?;
        let expires = (chrono::Utc::now() + ttl).timestamp();
        Ok(format!("file://{}?expires={}", absolute.display(), expires))
    }
}
