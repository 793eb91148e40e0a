//! Shared fakes for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use promptreel::errors::ModelError;
use promptreel::generator::{CodeGenerator, CodeModel, ModelRequest, RetryPolicy};
use promptreel::job::JobRegistry;
use promptreel::pipeline::{ArtifactPersister, Orchestrator, ProgressSink};
use promptreel::render::{ContainerOutput, ContainerRun, ContainerRuntime, RenderExecutor, RenderSettings};
use promptreel::storage::{BlobStore, LocalBlobStore, StoredBlob};
use promptreel::store::{DbHandle, NewProject, Project, StudioDb};
use promptreel::validator::{SandboxValidator, SyntaxChecker, SyntaxVerdict};
use tempfile::TempDir;

pub const SCENE: &str = "from manim import *\n\nclass Demo(Scene):\n    def construct(self):\n        circle = Circle()\n        self.play(Create(circle))\n        self.wait(1)\n";

// ── Model ─────────────────────────────────────────────────────────────

/// Replays scripted stream results; `complete` always explains.
pub struct MockModel {
    streams: Mutex<VecDeque<Result<String, ModelError>>>,
    pub stream_calls: AtomicUsize,
}

impl MockModel {
    pub fn new(streams: Vec<Result<String, ModelError>>) -> Self {
        Self { streams: Mutex::new(streams.into()), stream_calls: AtomicUsize::new(0) }
    }

    pub fn returning(code: &str) -> Self {
        Self::new(vec![Ok(format!("```python\n{code}```"))])
    }
}

#[async_trait]
impl CodeModel for MockModel {
    async fn stream(&self, _request: &ModelRequest) -> Result<String, ModelError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ModelError::ServiceUnavailable("script exhausted".into())))
    }

    async fn complete(&self, _request: &ModelRequest) -> Result<String, ModelError> {
        Ok("A circle is drawn on screen.".to_string())
    }
}

// ── Container runtime ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum RenderScript {
    /// Exit 0 and write the named videos, relative to the working directory.
    Write(Vec<&'static str>),
    /// Exit 0 without writing anything.
    Nothing,
    /// Exit 1 every time.
    Fail,
}

pub struct FakeRuntime {
    script: RenderScript,
    pub runs: Mutex<Vec<ContainerRun>>,
}

impl FakeRuntime {
    pub fn new(script: RenderScript) -> Self {
        Self { script, runs: Mutex::new(Vec::new()) }
    }

    pub fn run_names(&self) -> Vec<String> {
        self.runs.lock().unwrap().iter().map(|r| r.name.clone()).collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(&self, run: ContainerRun) -> Result<ContainerOutput> {
        let host_dir = run.host_dir.clone();
        self.runs.lock().unwrap().push(run);
        let exit_code = match &self.script {
            RenderScript::Write(files) => {
                for rel in files {
                    let path = host_dir.join(rel);
                    std::fs::create_dir_all(path.parent().unwrap())?;
                    std::fs::write(&path, b"fake video bytes")?;
                }
                0
            }
            RenderScript::Nothing => 0,
            RenderScript::Fail => 1,
        };
        Ok(ContainerOutput {
            exit_code: Some(exit_code),
            output: if exit_code == 0 { String::new() } else { "Traceback: boom".into() },
            timed_out: false,
        })
    }
}

// ── Syntax checker ────────────────────────────────────────────────────

pub struct StubChecker;

#[async_trait]
impl SyntaxChecker for StubChecker {
    async fn check(&self, _code: &str) -> Result<SyntaxVerdict> {
        Ok(SyntaxVerdict::Valid)
    }
}

// ── Blob store ────────────────────────────────────────────────────────

/// Rejects every upload.
pub struct FailingBlobStore;

#[async_trait]
impl BlobStore for FailingBlobStore {
    fn bucket(&self) -> &str {
        "broken"
    }

    async fn put(&self, _local_path: &Path, _key: &str) -> Result<StoredBlob> {
        anyhow::bail!("upload refused")
    }

    async fn delete(&self, _key: &str, _bucket: &str) -> Result<()> {
        Ok(())
    }

    async fn sign_url(&self, _key: &str, _bucket: &str, _ttl: Duration) -> Result<String> {
        anyhow::bail!("signing refused")
    }
}

// ── Harness ───────────────────────────────────────────────────────────

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub db: DbHandle,
    pub jobs: Arc<JobRegistry>,
    pub runtime: Arc<FakeRuntime>,
    pub model: Arc<MockModel>,
    pub temp_root: PathBuf,
    pub blob_root: PathBuf,
    _dir: TempDir,
}

pub struct HarnessBuilder {
    model: MockModel,
    script: RenderScript,
    failing_blobs: bool,
}

impl HarnessBuilder {
    pub fn new(model: MockModel, script: RenderScript) -> Self {
        Self { model, script, failing_blobs: false }
    }

    pub fn failing_blobs(mut self) -> Self {
        self.failing_blobs = true;
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let temp_root = dir.path().join("temp");
        let blob_root = dir.path().join("blobs");
        let db = DbHandle::new(StudioDb::new_in_memory().unwrap());
        let blobs: Arc<dyn BlobStore> = if self.failing_blobs {
            Arc::new(FailingBlobStore)
        } else {
            Arc::new(LocalBlobStore::new(blob_root.clone()))
        };
        let jobs = Arc::new(JobRegistry::new(Duration::from_secs(60)));
        let model = Arc::new(self.model);
        let runtime = Arc::new(FakeRuntime::new(self.script));
        let retry = RetryPolicy { max_attempts: 3, base_delay: Duration::ZERO };

        let orchestrator = Orchestrator::new(
            CodeGenerator::new(model.clone(), retry),
            SandboxValidator::new(Arc::new(StubChecker), 100 * 1024),
            RenderExecutor::new(runtime.clone(), RenderSettings::default()),
            ArtifactPersister::new(db.clone(), blobs),
            jobs.clone(),
            temp_root.clone(),
        );

        Harness { orchestrator, db, jobs, runtime, model, temp_root, blob_root, _dir: dir }
    }
}

impl Harness {
    /// Poison the database mutex so every later call fails.
    pub fn poison_db(&self) {
        let db = self.db.clone();
        let _ = std::thread::spawn(move || {
            let _guard = db.lock_sync().unwrap();
            panic!("poisoning the database lock");
        })
        .join();
        assert!(self.db.lock_sync().is_err());
    }

    pub fn seed_project(&self, id: &str, owner_id: &str) -> Project {
        let db = self.db.lock_sync().unwrap();
        db.upsert_project(&NewProject {
            id: id.into(),
            owner_id: owner_id.into(),
            prompt: "a circle".into(),
            code: SCENE.into(),
            explanation: None,
        })
        .unwrap()
    }
}

/// Drain everything a sink received once the sender side is gone.
pub async fn collect_lines(mut rx: tokio::sync::mpsc::Receiver<String>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
        lines.push(line.trim_end().to_string());
    }
    lines
}

pub fn sink() -> (ProgressSink, tokio::sync::mpsc::Receiver<String>) {
    ProgressSink::channel(256)
}
