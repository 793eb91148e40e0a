use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Keep at most this much combined output per container run.
const OUTPUT_TAIL_BYTES: usize = 8 * 1024;

/// One container invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRun {
    /// Unique container name, used to kill it on timeout.
    pub name: String,
    pub image: String,
    /// Host directory mounted read-write at `mount_point`.
    pub host_dir: PathBuf,
    pub mount_point: String,
    pub command: Vec<String>,
    pub memory: String,
    pub cpus: f64,
    pub network: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOutput {
    /// `None` when the process was killed.
    pub exit_code: Option<i32>,
    /// Tail of stdout and stderr.
    pub output: String,
    pub timed_out: bool,
}

impl ContainerOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs a command inside an isolated container.
///
/// `Err` is reserved for failing to start the runtime at all; a command that
/// runs and fails is an `Ok` with a non-zero exit code.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(&self, run: ContainerRun) -> Result<ContainerOutput>;
}

/// `docker run --rm` through the docker CLI.
pub struct DockerCli {
    docker_cmd: String,
}

impl DockerCli {
    pub fn new(docker_cmd: impl Into<String>) -> Self {
        Self { docker_cmd: docker_cmd.into() }
    }

    pub fn run_args(run: &ContainerRun) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            run.name.clone(),
            "--network".to_string(),
            run.network.clone(),
            "--memory".to_string(),
            run.memory.clone(),
            "--cpus".to_string(),
            run.cpus.to_string(),
            "-v".to_string(),
            format!("{}:{}", run.host_dir.display(), run.mount_point),
            "-w".to_string(),
            run.mount_point.clone(),
            run.image.clone(),
        ];
        args.extend(run.command.iter().cloned());
        args
    }

    async fn kill(&self, name: &str) {
        let result = Command::new(&self.docker_cmd)
            .args(["kill", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(container = name, error = %e, "Failed to kill timed-out container");
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run(&self, run: ContainerRun) -> Result<ContainerOutput> {
        let args = Self::run_args(&run);
        debug!(container = %run.name, args = ?args, "docker run");

        let child = Command::new(&self.docker_cmd)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start '{}'", self.docker_cmd))?;

        match tokio::time::timeout(run.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output.context("Failed to collect container output")?;
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(ContainerOutput {
                    exit_code: output.status.code(),
                    output: tail(&combined, OUTPUT_TAIL_BYTES),
                    timed_out: false,
                })
            }
            Err(_) => {
                warn!(container = %run.name, timeout_secs = run.timeout.as_secs(), "Container timed out");
                self.kill(&run.name).await;
                Ok(ContainerOutput { exit_code: None, output: String::new(), timed_out: true })
            }
        }
    }
}

/// Last `max` bytes of `s`, on a char boundary.
pub fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContainerRun {
        ContainerRun {
            name: "promptreel-job-a".into(),
            image: "manimcommunity/manim:latest".into(),
            host_dir: PathBuf::from("/srv/temp/job"),
            mount_point: "/manim".into(),
            command: vec!["python".into(), "-m".into(), "manim".into()],
            memory: "2g".into(),
            cpus: 1.5,
            network: "none".into(),
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_run_args_isolate_and_mount() {
        let args = DockerCli::run_args(&sample());
        let joined = args.join(" ");
        assert!(joined.starts_with("run --rm --name promptreel-job-a"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--memory 2g"));
        assert!(joined.contains("--cpus 1.5"));
        assert!(joined.contains("-v /srv/temp/job:/manim"));
        assert!(joined.ends_with("manimcommunity/manim:latest python -m manim"));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        let s = "aé";
        assert_eq!(tail(s, 1), "");
    }

    #[test]
    fn test_succeeded() {
        let ok = ContainerOutput { exit_code: Some(0), output: String::new(), timed_out: false };
        assert!(ok.succeeded());
        let failed = ContainerOutput { exit_code: Some(1), ..ok.clone() };
        assert!(!failed.succeeded());
        let killed = ContainerOutput { exit_code: None, output: String::new(), timed_out: true };
        assert!(!killed.succeeded());
    }

    #[tokio::test]
    async fn test_missing_docker_binary_is_err() {
        let runtime = DockerCli::new("definitely-not-docker-binary");
        assert!(runtime.run(sample()).await.is_err());
    }
}
