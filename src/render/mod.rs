//! Render executor: run a scene in a container and find the video it made.
//!
//! Invocation strategies are tried in [`strategy::STRATEGIES`] order; the
//! first clean exit wins. The artifact is then located through
//! [`discovery::locate_output`].

pub mod discovery;
pub mod runtime;
pub mod strategy;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::config::RendererSection;
use crate::errors::{RenderError, StrategyFailure};

pub use runtime::{ContainerOutput, ContainerRun, ContainerRuntime, DockerCli};
pub use strategy::{STRATEGIES, Strategy};

/// Where the working directory is mounted inside the container.
pub const MOUNT_POINT: &str = "/manim";

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub image: String,
    pub timeout: Duration,
    pub memory: String,
    pub cpus: f64,
    pub network: String,
    pub output_name: String,
}

impl From<&RendererSection> for RenderSettings {
    fn from(section: &RendererSection) -> Self {
        Self {
            image: section.image.clone(),
            timeout: Duration::from_secs(section.timeout_secs),
            memory: section.memory.clone(),
            cpus: section.cpus,
            network: section.network.clone(),
            output_name: section.output_name.clone(),
        }
    }
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self::from(&RendererSection::default())
    }
}

impl RenderSettings {
    pub fn output_file_name(&self) -> String {
        format!("{}.mp4", self.output_name)
    }
}

pub struct RenderExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    settings: RenderSettings,
}

impl RenderExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: RenderSettings) -> Self {
        Self { runtime, settings }
    }

    /// Render `source_file` (which must live in `work_dir`) and return the
    /// path of the output video.
    #[instrument(skip(self), fields(work_dir = %work_dir.display()))]
    pub async fn render(&self, work_dir: &Path, source_file: &Path) -> Result<PathBuf, RenderError> {
        // Docker treats a relative `-v` source as a named volume.
        let work_dir = std::path::absolute(work_dir).map_err(|source| RenderError::Workspace {
            path: work_dir.to_path_buf(),
            source,
        })?;
        let work_dir = work_dir.as_path();
        let stem = source_file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("scene")
            .to_string();
        let source_name = source_file
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("scene.py")
            .to_string();

        prepare_dirs(work_dir, &stem)?;

        let mut failures = Vec::new();
        let mut succeeded = false;
        for strategy in STRATEGIES {
            match self.attempt(strategy, work_dir, &source_name).await {
                Ok(()) => {
                    info!(strategy = strategy.name, "Renderer exited cleanly");
                    succeeded = true;
                    break;
                }
                Err(reason) => {
                    warn!(strategy = strategy.name, reason = %reason, "Render strategy failed");
                    failures.push(StrategyFailure { strategy: strategy.name, reason });
                }
            }
        }
        if !succeeded {
            return Err(RenderError::StrategiesExhausted { failures });
        }

        discovery::locate_output(work_dir, &stem, &self.settings.output_file_name())
            .ok_or_else(|| RenderError::NoOutput { work_dir: work_dir.to_path_buf() })
    }

    async fn attempt(&self, strategy: &Strategy, work_dir: &Path, source_name: &str) -> Result<(), String> {
        let job = work_dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("job");
        let run = ContainerRun {
            name: format!("promptreel-{}-{}", job, strategy.name),
            image: self.settings.image.clone(),
            host_dir: work_dir.to_path_buf(),
            mount_point: MOUNT_POINT.to_string(),
            command: strategy.command(source_name, &self.settings.output_name),
            memory: self.settings.memory.clone(),
            cpus: self.settings.cpus,
            network: self.settings.network.clone(),
            timeout: self.settings.timeout,
        };

        let output = self.runtime.run(run).await.map_err(|e| format!("{e:#}"))?;
        if output.succeeded() {
            return Ok(());
        }
        if output.timed_out {
            return Err(format!("timed out after {}s", self.settings.timeout.as_secs()));
        }
        let code = output
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let last_line = output
            .output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim();
        Err(format!("exit {code}: {last_line}"))
    }
}

fn prepare_dirs(work_dir: &Path, stem: &str) -> Result<(), RenderError> {
    let videos = work_dir.join("media").join("videos").join(stem);
    std::fs::create_dir_all(&videos).map_err(|source| RenderError::Workspace {
        path: videos.clone(),
        source,
    })
}
