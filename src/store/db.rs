use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;

/// ISO-8601 UTC timestamp with milliseconds.
const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// Async-safe handle to the studio database.
///
/// Wraps `StudioDb` behind `Arc<Mutex>` and runs every access on tokio's
/// blocking pool, so SQLite I/O never stalls async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StudioDb>>,
}

impl DbHandle {
    pub fn new(db: StudioDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StudioDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Synchronous access for startup and tests. Not for async hot paths.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StudioDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct StudioDb {
    conn: Connection,
}

const PROJECT_COLUMNS: &str =
    "id, owner_id, prompt, code, explanation, artifact_pending, created_at, updated_at";

const VIDEO_COLUMNS: &str =
    "id, project_id, file_name, file_type, file_size, is_output, blob_key, blob_bucket, created_at";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        prompt: row.get(2)?,
        code: row.get(3)?,
        explanation: row.get(4)?,
        artifact_pending: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn video_from_row(row: &Row<'_>) -> rusqlite::Result<Video> {
    Ok(Video {
        id: row.get(0)?,
        project_id: row.get(1)?,
        file_name: row.get(2)?,
        file_type: row.get(3)?,
        file_size: row.get(4)?,
        is_output: row.get(5)?,
        blob_key: row.get(6)?,
        blob_bucket: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl StudioDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    code TEXT NOT NULL,
                    explanation TEXT,
                    artifact_pending INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS videos (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    file_name TEXT NOT NULL,
                    file_type TEXT NOT NULL,
                    file_size INTEGER NOT NULL,
                    is_output INTEGER NOT NULL DEFAULT 0,
                    blob_key TEXT NOT NULL,
                    blob_bucket TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_videos_project_file
                    ON videos(project_id, file_name);
                CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects(owner_id, created_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    /// Insert a project, or refresh code/explanation if the id already exists.
    /// Owner and prompt are never changed on conflict.
    pub fn upsert_project(&self, project: &NewProject) -> Result<Project> {
        let sql = format!(
            "INSERT INTO projects (id, owner_id, prompt, code, explanation)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                code = excluded.code,
                explanation = COALESCE(excluded.explanation, projects.explanation),
                updated_at = {NOW}
             RETURNING {PROJECT_COLUMNS}"
        );
        self.conn
            .query_row(
                &sql,
                params![
                    project.id,
                    project.owner_id,
                    project.prompt,
                    project.code,
                    project.explanation
                ],
                project_from_row,
            )
            .context("Failed to upsert project")
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], project_from_row)
            .optional()
            .context("Failed to query project")
    }

    /// The project, only if `owner_id` owns it.
    pub fn get_owned_project(&self, id: &str, owner_id: &str) -> Result<Option<Project>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1 AND owner_id = ?2");
        self.conn
            .query_row(&sql, params![id, owner_id], project_from_row)
            .optional()
            .context("Failed to query project")
    }

    pub fn get_project_detail(&self, id: &str, owner_id: &str) -> Result<Option<ProjectDetail>> {
        match self.get_owned_project(id, owner_id)? {
            Some(project) => {
                let videos = self.list_videos(id)?;
                Ok(Some(ProjectDetail { project, videos }))
            }
            None => Ok(None),
        }
    }

    /// Replace the code of a project. Returns `None` when it does not exist.
    pub fn update_project_code(&self, id: &str, code: &str) -> Result<Option<Project>> {
        let sql = format!(
            "UPDATE projects SET code = ?2, updated_at = {NOW} WHERE id = ?1 RETURNING {PROJECT_COLUMNS}"
        );
        self.conn
            .query_row(&sql, params![id, code], project_from_row)
            .optional()
            .context("Failed to update project code")
    }

    pub fn set_artifact_pending(&self, id: &str, pending: bool) -> Result<()> {
        let sql = format!("UPDATE projects SET artifact_pending = ?2, updated_at = {NOW} WHERE id = ?1");
        self.conn
            .execute(&sql, params![id, pending])
            .context("Failed to update artifact_pending")?;
        Ok(())
    }

    /// Page through the caller's projects, newest first. `page` is 1-based.
    pub fn list_projects(&self, owner_id: &str, page: i64, limit: i64) -> Result<ProjectPage> {
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM projects WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )
            .context("Failed to count projects")?;
        let pagination = Pagination::new(total, page, limit);

        let sql = format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE owner_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params![owner_id, limit, pagination.offset()], project_from_row)
            .context("Failed to query projects")?;
        let mut data = Vec::new();
        for row in rows {
            data.push(row.context("Failed to read project row")?);
        }
        Ok(ProjectPage { data, pagination })
    }

    // ── Videos ────────────────────────────────────────────────────────

    /// Insert a video, or update the existing row with the same
    /// `(project_id, file_name)` in place.
    pub fn upsert_video(&self, video: &NewVideo) -> Result<VideoUpsert> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin video upsert")?;

        let previous: Option<(String, String)> = tx
            .query_row(
                "SELECT blob_bucket, blob_key FROM videos WHERE project_id = ?1 AND file_name = ?2",
                params![video.project_id, video.file_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to look up existing video")?;

        let sql = format!(
            "INSERT INTO videos (id, project_id, file_name, file_type, file_size, is_output, blob_key, blob_bucket)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(project_id, file_name) DO UPDATE SET
                file_type = excluded.file_type,
                file_size = excluded.file_size,
                is_output = excluded.is_output,
                blob_key = excluded.blob_key,
                blob_bucket = excluded.blob_bucket
             RETURNING {VIDEO_COLUMNS}"
        );
        let stored = tx
            .query_row(
                &sql,
                params![
                    uuid::Uuid::new_v4().to_string(),
                    video.project_id,
                    video.file_name,
                    video.file_type,
                    video.file_size,
                    video.is_output,
                    video.blob_key,
                    video.blob_bucket
                ],
                video_from_row,
            )
            .context("Failed to upsert video")?;
        tx.commit().context("Failed to commit video upsert")?;

        let replaced = previous
            .filter(|(bucket, key)| *bucket != stored.blob_bucket || *key != stored.blob_key);
        Ok(VideoUpsert { video: stored, replaced })
    }

    pub fn list_videos(&self, project_id: &str) -> Result<Vec<Video>> {
        let sql = format!(
            "SELECT {VIDEO_COLUMNS} FROM videos WHERE project_id = ?1
             ORDER BY is_output DESC, file_name"
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_videos")?;
        let rows = stmt
            .query_map(params![project_id], video_from_row)
            .context("Failed to query videos")?;
        let mut videos = Vec::new();
        for row in rows {
            videos.push(row.context("Failed to read video row")?);
        }
        Ok(videos)
    }

    pub fn count_videos(&self, project_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM videos WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to count videos")
    }

    pub fn blob_key_in_use(&self, blob_key: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM videos WHERE blob_key = ?1",
                params![blob_key],
                |row| row.get(0),
            )
            .context("Failed to look up blob key")?;
        Ok(count > 0)
    }

    /// The video, only if its project belongs to `owner_id`.
    pub fn get_owned_video(&self, video_id: &str, owner_id: &str) -> Result<Option<Video>> {
        let sql = format!(
            "SELECT {} FROM videos v JOIN projects p ON p.id = v.project_id
             WHERE v.id = ?1 AND p.owner_id = ?2",
            VIDEO_COLUMNS
                .split(", ")
                .map(|c| format!("v.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.conn
            .query_row(&sql, params![video_id, owner_id], video_from_row)
            .optional()
            .context("Failed to query video")
    }
}
