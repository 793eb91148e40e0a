use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::render::discovery::{find_all_matching, is_video};
use crate::storage::{BlobStore, video_key};
use crate::store::{DbHandle, NewProject, NewVideo, Project};

/// Outcome of storing a job's videos. Failures are collected as warnings.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VideoReport {
    pub primary_stored: bool,
    pub incidental_stored: usize,
    pub warnings: Vec<String>,
}

/// Writes projects and videos: blob first, then the row.
#[derive(Clone)]
pub struct ArtifactPersister {
    db: DbHandle,
    blobs: Arc<dyn BlobStore>,
}

impl ArtifactPersister {
    pub fn new(db: DbHandle, blobs: Arc<dyn BlobStore>) -> Self {
        Self { db, blobs }
    }

    pub async fn save_project(&self, project: NewProject) -> Result<Project> {
        self.db.call(move |db| db.upsert_project(&project)).await
    }

    pub async fn update_code(&self, project_id: &str, code: &str) -> Result<Option<Project>> {
        let (id, code) = (project_id.to_string(), code.to_string());
        self.db.call(move |db| db.update_project_code(&id, &code)).await
    }

    pub async fn count_videos(&self, project_id: &str) -> Result<i64> {
        let id = project_id.to_string();
        self.db.call(move |db| db.count_videos(&id)).await
    }

    /// Store the primary output (`is_output = true`), then every other video
    /// under `media/videos` once per file name. Flags the project
    /// `artifact_pending` when the primary could not be stored.
    pub async fn store_videos(&self, project_id: &str, work_dir: &Path, primary: &Path) -> VideoReport {
        let mut report = VideoReport::default();

        match self.store_one(project_id, primary, true).await {
            Ok(()) => report.primary_stored = true,
            Err(e) => {
                warn!(project_id, error = %e, "Failed to store primary video");
                report.warnings.push(format!("Failed to store output video: {e:#}"));
            }
        }

        let pending = !report.primary_stored;
        let id = project_id.to_string();
        if let Err(e) = self.db.call(move |db| db.set_artifact_pending(&id, pending)).await {
            warn!(project_id, error = %e, "Failed to update artifact_pending");
            report.warnings.push(format!("Failed to flag project artifact state: {e:#}"));
        }

        let mut seen: HashSet<String> = HashSet::new();
        if let Some(name) = file_name(primary) {
            seen.insert(name);
        }
        for path in incidental_videos(work_dir, primary) {
            let Some(name) = file_name(&path) else { continue };
            if !seen.insert(name) {
                continue;
            }
            match self.store_one(project_id, &path, false).await {
                Ok(()) => report.incidental_stored += 1,
                Err(e) => {
                    warn!(project_id, file = %path.display(), error = %e, "Failed to store video");
                    report.warnings.push(format!("Failed to store {}: {e:#}", path.display()));
                }
            }
        }

        info!(
            project_id,
            primary = report.primary_stored,
            incidental = report.incidental_stored,
            "Stored videos"
        );
        report
    }

    async fn store_one(&self, project_id: &str, path: &Path, is_output: bool) -> Result<()> {
        let name = file_name(path)
            .ok_or_else(|| anyhow::anyhow!("Video path has no file name: {}", path.display()))?;
        let key = video_key(project_id, &name);
        let lookup = key.clone();
        let key_in_use = self.db.call(move |db| db.blob_key_in_use(&lookup)).await?;
        let blob = self.blobs.put(path, &key).await?;

        let video = NewVideo {
            project_id: project_id.to_string(),
            file_type: path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase(),
            file_name: name,
            file_size: blob.size as i64,
            is_output,
            blob_key: blob.key,
            blob_bucket: blob.bucket,
        };
        let (bucket, key) = (video.blob_bucket.clone(), video.blob_key.clone());
        let upsert = match self.db.call(move |db| db.upsert_video(&video)).await {
            Ok(upsert) => upsert,
            Err(e) => {
                // Keep a key that an existing row still references.
                if !key_in_use
                    && let Err(del) = self.blobs.delete(&key, &bucket).await
                {
                    warn!(bucket, key, error = %del, "Failed to delete unrecorded blob");
                }
                return Err(e);
            }
        };

        if let Some((bucket, old_key)) = upsert.replaced
            && let Err(e) = self.blobs.delete(&old_key, &bucket).await
        {
            warn!(bucket, key = old_key, error = %e, "Failed to delete replaced blob");
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

fn incidental_videos(work_dir: &Path, primary: &Path) -> Vec<PathBuf> {
    let videos = work_dir.join("media").join("videos");
    find_all_matching(&videos, |p| is_video(p) && p != primary)
}
