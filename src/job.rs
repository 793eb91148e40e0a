//! In-memory job tracking.
//!
//! Each request gets a job keyed by its id. The phase state machine lives on
//! [`JobPhase`]; every phase change on a [`JobRegistry`] goes through
//! [`JobPhase::can_transition_to`]. Terminal jobs stay visible for a
//! retention period, then a reaper evicts them.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Received,
    GeneratingCode,
    Validating,
    Rendering,
    Persisting,
    CleaningUp,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::GeneratingCode => "generating_code",
            Self::Validating => "validating",
            Self::Rendering => "rendering",
            Self::Persisting => "persisting",
            Self::CleaningUp => "cleaning_up",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed => JobStatus::Completed,
            Self::Failed => JobStatus::Failed,
            _ => JobStatus::Processing,
        }
    }

    /// Legal edges. Re-renders enter at `Validating` straight from `Received`.
    pub fn can_transition_to(&self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (Received, GeneratingCode)
                | (Received, Validating)
                | (GeneratingCode, Validating)
                | (Validating, Rendering)
                | (Rendering, Persisting)
                | (Persisting, CleaningUp)
                | (CleaningUp, Completed)
                | (Received | GeneratingCode | Validating | Rendering, Failed)
        )
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "generating_code" => Ok(Self::GeneratingCode),
            "validating" => Ok(Self::Validating),
            "rendering" => Ok(Self::Rendering),
            "persisting" => Ok(Self::Persisting),
            "cleaning_up" => Ok(Self::CleaningUp),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job phase: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Generate,
    Rerender,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub kind: JobKind,
    pub owner_id: String,
    pub status: JobStatus,
    pub phase: JobPhase,
    pub progress: String,
    pub error: Option<String>,
    pub output_path: Option<String>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub(crate) fn new(id: &str, kind: JobKind, owner_id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            owner_id: owner_id.to_string(),
            status: JobStatus::Processing,
            phase: JobPhase::Received,
            progress: "Request received".to_string(),
            error: None,
            output_path: None,
            warnings: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Illegal job transition {from} -> {to}")]
    IllegalTransition { from: JobPhase, to: JobPhase },
}

pub struct JobRegistry {
    jobs: DashMap<String, JobSnapshot>,
    retention: Duration,
}

impl JobRegistry {
    pub fn new(retention: Duration) -> Self {
        Self { jobs: DashMap::new(), retention }
    }

    /// Register a fresh job, replacing any retained snapshot under the same id.
    pub fn insert(&self, id: &str, kind: JobKind, owner_id: &str) -> JobSnapshot {
        let snapshot = JobSnapshot::new(id, kind, owner_id);
        self.jobs.insert(id.to_string(), snapshot.clone());
        snapshot
    }

    pub fn get(&self, id: &str) -> Option<JobSnapshot> {
        self.jobs.get(id).map(|j| j.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn update<F>(&self, id: &str, f: F) -> Result<(), JobError>
    where
        F: FnOnce(&mut JobSnapshot) -> Result<(), JobError>,
    {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobError::UnknownJob(id.to_string()))?;
        f(entry.value_mut())
    }

    pub fn transition(&self, id: &str, next: JobPhase, progress: &str) -> Result<(), JobError> {
        self.update(id, |job| {
            if !job.phase.can_transition_to(next) {
                return Err(JobError::IllegalTransition { from: job.phase, to: next });
            }
            debug!(job_id = %job.id, from = %job.phase, to = %next, "Job transition");
            job.phase = next;
            job.status = next.status();
            job.progress = progress.to_string();
            if next.is_terminal() {
                job.finished_at = Some(Utc::now());
            }
            Ok(())
        })
    }

    pub fn add_warning(&self, id: &str, warning: &str) -> Result<(), JobError> {
        self.update(id, |job| {
            job.warnings.push(warning.to_string());
            Ok(())
        })
    }

    pub fn set_output(&self, id: &str, path: &str) -> Result<(), JobError> {
        self.update(id, |job| {
            job.output_path = Some(path.to_string());
            Ok(())
        })
    }

    pub fn fail(&self, id: &str, error: &str) -> Result<(), JobError> {
        self.transition(id, JobPhase::Failed, "Failed")?;
        self.update(id, |job| {
            job.error = Some(error.to_string());
            Ok(())
        })
    }

    /// Mark a job failed from whatever phase it reached. Used when the task
    /// driving it died, so the normal edges cannot be relied on.
    pub fn force_fail(&self, id: &str, error: &str) {
        if let Some(mut job) = self.jobs.get_mut(id)
            && !job.phase.is_terminal()
        {
            job.phase = JobPhase::Failed;
            job.status = JobStatus::Failed;
            job.progress = "Failed".to_string();
            job.error = Some(error.to_string());
            job.finished_at = Some(Utc::now());
        }
    }

    /// Drop terminal jobs finished more than `retention` before `now`.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let before = self.jobs.len();
        self.jobs.retain(|_, job| match job.finished_at {
            Some(finished) => now.signed_duration_since(finished) < retention,
            None => true,
        });
        before - self.jobs.len()
    }

    /// Periodically evict expired jobs until the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else { break };
                let evicted = registry.evict_expired(Utc::now());
                if evicted > 0 {
                    debug!(evicted, "Evicted finished jobs");
                }
            }
        })
    }
}
