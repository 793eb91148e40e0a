//! Job orchestration.
//!
//! ```text
//! Received → GeneratingCode → Validating → Rendering → Persisting → CleaningUp → Completed
//!     │            │              │            │
//!     └────────────┴──────────────┴────────────┴──→ Failed
//! ```
//!
//! A job owns one [`Workspace`] under the temp root, named after the job id.
//! Creating a workspace clears whatever an earlier job left at that path.
//! Once a workspace exists it is cleaned up on every exit, and cleanup
//! consumes it.
//!
//! Writes to a project, and its workspace path, are serialized by a
//! per-project lock. Generation takes it from Persisting until cleanup;
//! re-render holds it for the whole job.

pub mod persist;
pub mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, instrument, warn};

use crate::errors::RenderError;
use crate::generator::{CodeGenerator, GenerationOutcome, Prompt};
use crate::job::{JobKind, JobPhase, JobRegistry, JobSnapshot};
use crate::render::RenderExecutor;
use crate::store::{NewProject, Project};
use crate::validator::SandboxValidator;

pub use persist::{ArtifactPersister, VideoReport};
pub use progress::ProgressSink;

/// File the generated source is written to inside a workspace.
pub const SOURCE_FILE: &str = "scene.py";

/// A job's ephemeral working directory.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    pub fn create(temp_root: &Path, job_id: &str) -> std::io::Result<Self> {
        let dir = temp_root.join(job_id);
        match std::fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_source(&self, code: &str) -> std::io::Result<PathBuf> {
        let path = self.dir.join(SOURCE_FILE);
        std::fs::write(&path, code)?;
        Ok(path)
    }

    pub async fn cleanup(self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

pub struct Orchestrator {
    generator: CodeGenerator,
    validator: SandboxValidator,
    renderer: RenderExecutor,
    persister: ArtifactPersister,
    jobs: Arc<JobRegistry>,
    temp_root: PathBuf,
    validate_generated: bool,
    project_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        generator: CodeGenerator,
        validator: SandboxValidator,
        renderer: RenderExecutor,
        persister: ArtifactPersister,
        jobs: Arc<JobRegistry>,
        temp_root: PathBuf,
    ) -> Self {
        Self {
            generator,
            validator,
            renderer,
            persister,
            jobs,
            temp_root,
            validate_generated: true,
            project_locks: DashMap::new(),
        }
    }

    pub fn with_generated_validation(mut self, enabled: bool) -> Self {
        self.validate_generated = enabled;
        self
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    pub fn validator(&self) -> &SandboxValidator {
        &self.validator
    }

    fn advance(&self, job_id: &str, phase: JobPhase, progress: &str) {
        if let Err(e) = self.jobs.transition(job_id, phase, progress) {
            error!(job_id, error = %e, "Job state machine violated");
        }
    }

    async fn fail(&self, job_id: &str, sink: &ProgressSink, message: &str) -> JobSnapshot {
        sink.error(message).await;
        if let Err(e) = self.jobs.fail(job_id, message) {
            error!(job_id, error = %e, "Could not mark job failed");
        }
        self.snapshot(job_id)
    }

    fn snapshot(&self, job_id: &str) -> JobSnapshot {
        self.jobs
            .get(job_id)
            .unwrap_or_else(|| JobSnapshot::new(job_id, JobKind::Generate, ""))
    }

    async fn lock_project(&self, project_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.project_locks.entry(project_id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    fn unlock_project(&self, project_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.project_locks
            .remove_if(project_id, |_, l| Arc::strong_count(l) == 1);
    }

    async fn warn(&self, job_id: &str, sink: &ProgressSink, message: &str) {
        sink.warning(message).await;
        let _ = self.jobs.add_warning(job_id, message);
    }

    /// Prompt to stored video. The job id becomes the project id.
    #[instrument(skip(self, prompt, sink))]
    pub async fn run_generation(
        &self,
        job_id: &str,
        owner_id: &str,
        prompt: Prompt,
        sink: &ProgressSink,
    ) -> JobSnapshot {
        self.jobs.insert(job_id, JobKind::Generate, owner_id);
        info!(owner_id, "Generation job started");

        self.advance(job_id, JobPhase::GeneratingCode, "Generating code");
        sink.line("Generating Manim code...").await;
        let (code, explanation) = match self.generator.generate(&prompt).await {
            GenerationOutcome::Success { code, explanation } => (code, explanation),
            GenerationOutcome::Failure { code, message } => {
                warn!(job_id, code = %code, message, "Code generation failed");
                let snapshot = self.fail(job_id, sink, &code.user_message(&message)).await;
                sink.line("Please try again later.").await;
                return snapshot;
            }
        };
        sink.line("Generated code and explanation successfully.").await;
        sink.line(format!("Code length: {} characters", code.len())).await;

        self.advance(job_id, JobPhase::Validating, "Validating code");
        let workspace = match Workspace::create(&self.temp_root, job_id) {
            Ok(ws) => ws,
            Err(e) => {
                return self
                    .fail(job_id, sink, &format!("Failed to prepare working directory: {e}"))
                    .await;
            }
        };
        let source = match workspace.write_source(&code) {
            Ok(path) => path,
            Err(e) => {
                self.fail(job_id, sink, &format!("Failed to write source file: {e}"))
                    .await;
                self.cleanup_quietly(job_id, workspace).await;
                return self.snapshot(job_id);
            }
        };

        if self.validate_generated {
            sink.line("Validating generated code...").await;
            let report = self.validator.validate(&code).await;
            for problem in report.errors.iter().chain(report.warnings.iter()) {
                self.warn(job_id, sink, problem).await;
            }
            if !report.is_valid {
                info!(job_id, errors = report.errors.len(), "Generated code failed validation, rendering anyway");
            }
        }

        let Some(output) = self.render(job_id, &workspace, &source, sink).await else {
            self.cleanup_quietly(job_id, workspace).await;
            return self.snapshot(job_id);
        };

        let guard = self.lock_project(job_id).await;
        self.advance(job_id, JobPhase::Persisting, "Saving project");
        sink.line("Saving project and videos...").await;
        let project = NewProject {
            id: job_id.to_string(),
            owner_id: owner_id.to_string(),
            prompt: prompt.as_str().to_string(),
            code,
            explanation: Some(explanation),
        };
        match self.persister.save_project(project).await {
            Ok(_) => {
                let report = self.persister.store_videos(job_id, workspace.dir(), &output).await;
                for w in &report.warnings {
                    self.warn(job_id, sink, w).await;
                }
                if report.primary_stored {
                    sink.line(format!(
                        "Saved project and {} video(s).",
                        1 + report.incidental_stored
                    ))
                    .await;
                }
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to save project");
                self.warn(job_id, sink, &format!("Failed to save project: {e:#}")).await;
            }
        }

        let snapshot = self.finish(job_id, workspace, sink).await;
        self.unlock_project(job_id, guard);
        snapshot
    }

    /// Validate, render and re-store new code for an existing project.
    #[instrument(skip(self, project, code, sink), fields(project_id = %project.id))]
    pub async fn run_rerender(&self, project: &Project, code: String, sink: &ProgressSink) -> JobSnapshot {
        let guard = self.lock_project(&project.id).await;
        let snapshot = self.rerender_locked(project, code, sink).await;
        self.unlock_project(&project.id, guard);
        snapshot
    }

    async fn rerender_locked(&self, project: &Project, code: String, sink: &ProgressSink) -> JobSnapshot {
        let job_id = project.id.as_str();
        self.jobs.insert(job_id, JobKind::Rerender, &project.owner_id);
        info!("Re-render job started");

        self.advance(job_id, JobPhase::Validating, "Validating code");
        sink.line("Validating updated code...").await;
        let report = self.validator.validate(&code).await;
        for w in &report.warnings {
            self.warn(job_id, sink, w).await;
        }
        if !report.is_valid {
            sink.line("Code validation failed:").await;
            for e in &report.errors {
                sink.line(format!("- {e}")).await;
            }
            return self
                .fail(job_id, sink, &format!("Invalid code: {}", report.errors.join("; ")))
                .await;
        }
        sink.line("Code validation passed.").await;

        let previous = match self.persister.count_videos(job_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(job_id, error = %e, "Could not count existing videos");
                0
            }
        };

        let workspace = match Workspace::create(&self.temp_root, job_id) {
            Ok(ws) => ws,
            Err(e) => {
                return self
                    .fail(job_id, sink, &format!("Failed to prepare working directory: {e}"))
                    .await;
            }
        };
        let source = match workspace.write_source(&code) {
            Ok(path) => path,
            Err(e) => {
                self.fail(job_id, sink, &format!("Failed to write source file: {e}"))
                    .await;
                self.cleanup_quietly(job_id, workspace).await;
                return self.snapshot(job_id);
            }
        };

        let Some(output) = self.render(job_id, &workspace, &source, sink).await else {
            self.cleanup_quietly(job_id, workspace).await;
            return self.snapshot(job_id);
        };

        self.advance(job_id, JobPhase::Persisting, "Saving project");
        sink.line("Updating project and videos...").await;
        match self.persister.update_code(job_id, &code).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.warn(job_id, sink, "Project no longer exists; videos not saved").await;
                return self.finish(job_id, workspace, sink).await;
            }
            Err(e) => {
                self.warn(job_id, sink, &format!("Failed to update project code: {e:#}")).await;
            }
        }
        let report = self.persister.store_videos(job_id, workspace.dir(), &output).await;
        for w in &report.warnings {
            self.warn(job_id, sink, w).await;
        }
        match self.persister.count_videos(job_id).await {
            Ok(now) => {
                sink.line(format!("Project now has {now} videos (previously had {previous})"))
                    .await;
            }
            Err(e) => warn!(job_id, error = %e, "Could not count videos after update"),
        }

        self.finish(job_id, workspace, sink).await
    }

    /// Rendering phase. `None` means the job has been marked failed.
    async fn render(
        &self,
        job_id: &str,
        workspace: &Workspace,
        source: &Path,
        sink: &ProgressSink,
    ) -> Option<PathBuf> {
        self.advance(job_id, JobPhase::Rendering, "Rendering");
        sink.line("Rendering animation in container...").await;
        match self.renderer.render(workspace.dir(), source).await {
            Ok(path) => {
                sink.line("Render completed successfully.").await;
                let _ = self.jobs.set_output(job_id, &path.display().to_string());
                Some(path)
            }
            Err(e) => {
                error!(job_id, error = %e, "Render failed");
                let message = match &e {
                    RenderError::NoOutput { .. } => "Renderer produced no output video".to_string(),
                    _ => format!("Renderer failed: {e}"),
                };
                self.fail(job_id, sink, &message).await;
                None
            }
        }
    }

    async fn finish(&self, job_id: &str, workspace: Workspace, sink: &ProgressSink) -> JobSnapshot {
        self.advance(job_id, JobPhase::CleaningUp, "Cleaning up");
        sink.line("Cleaning up temporary files...").await;
        match workspace.cleanup().await {
            Ok(()) => sink.line("Temporary files cleaned up.").await,
            Err(e) => {
                self.warn(job_id, sink, &format!("Failed to clean up temporary files: {e}"))
                    .await
            }
        }
        self.advance(job_id, JobPhase::Completed, "Completed");
        sink.line(format!("Process completed successfully. Job ID: {job_id}")).await;
        info!(job_id, "Job completed");
        self.snapshot(job_id)
    }

    async fn cleanup_quietly(&self, job_id: &str, workspace: Workspace) {
        if let Err(e) = workspace.cleanup().await {
            warn!(job_id, error = %e, "Failed to remove working directory");
            let _ = self.jobs.add_warning(job_id, &format!("Failed to clean up temporary files: {e}"));
        }
    }
}
