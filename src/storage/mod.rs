//! Blob storage for rendered videos.

pub mod local;
pub mod s3;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{StorageBackend, StorageSection};

pub use local::LocalBlobStore;
pub use s3::S3BlobStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub bucket: String,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Bucket new uploads land in.
    fn bucket(&self) -> &str;

    async fn put(&self, local_path: &Path, key: &str) -> Result<StoredBlob>;

    async fn delete(&self, key: &str, bucket: &str) -> Result<()>;

    /// Time-limited read URL.
    async fn sign_url(&self, key: &str, bucket: &str, ttl: Duration) -> Result<String>;
}

/// `projects/<projectId>/videos/<fileName>`
pub fn video_key(project_id: &str, file_name: &str) -> String {
    format!("projects/{}/videos/{}", project_id, file_name)
}

pub fn content_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Build the configured store.
pub fn from_config(section: &StorageSection) -> Result<Arc<dyn BlobStore>> {
    match section.backend {
        StorageBackend::S3 => Ok(Arc::new(S3BlobStore::from_config(section)?)),
        StorageBackend::Local => Ok(Arc::new(LocalBlobStore::new(section.local_root.clone()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_key_convention() {
        assert_eq!(video_key("abc", "output.mp4"), "projects/abc/videos/output.mp4");
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("a/output.mp4")), "video/mp4");
        assert_eq!(content_type(Path::new("a/clip.webm")), "video/webm");
        assert_eq!(content_type(Path::new("a/blob")), "application/octet-stream");
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let section = StorageSection::default();
        assert!(from_config(&section).is_err());
    }
}
