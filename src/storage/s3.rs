use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

use super::{BlobStore, StoredBlob, content_type};
use crate::config::StorageSection;

const DEFAULT_REGION: &str = "us-east-1";

pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into() }
    }

    pub fn from_config(section: &StorageSection) -> Result<Self> {
        let bucket = section
            .bucket
            .clone()
            .context("S3 storage requires a bucket (set AWS_S3_BUCKET)")?;
        let (Some(access_key), Some(secret_key)) =
            (section.access_key_id.clone(), section.secret_access_key.clone())
        else {
            anyhow::bail!(
                "S3 storage requires credentials (set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY)"
            );
        };

        let region = section.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(Credentials::new(access_key, secret_key, None, None, "promptreel"))
            .region(Region::new(region))
            .force_path_style(section.force_path_style);
        if let Some(endpoint) = &section.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }

        Ok(Self::new(aws_sdk_s3::Client::from_conf(builder.build()), bucket))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, local_path: &Path, key: &str) -> Result<StoredBlob> {
        let size = tokio::fs::metadata(local_path)
            .await
            .with_context(|| format!("Failed to stat {}", local_path.display()))?
            .len();
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| anyhow!("Failed to open {} for upload: {e}", local_path.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type(local_path))
            .content_length(size as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to upload {key}: {}", DisplayErrorContext(&e)))?;

        debug!(bucket = %self.bucket, key, size, "Uploaded blob");
        Ok(StoredBlob { key: key.to_string(), bucket: self.bucket.clone(), size })
    }

    async fn delete(&self, key: &str, bucket: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to delete {bucket}/{key}: {}", DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn sign_url(&self, key: &str, bucket: &str, ttl: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| anyhow!("Invalid URL expiry {}s: {e}", ttl.as_secs()))?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| anyhow!("Failed to sign URL for {bucket}/{key}: {}", DisplayErrorContext(&e)))?;
        Ok(request.uri().to_string())
    }
}
