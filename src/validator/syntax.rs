use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxVerdict {
    Valid,
    /// Interpreter diagnostics.
    Invalid(String),
}

/// Compile-only check of a source string.
///
/// `Err` means the check itself could not run, which callers report as a
/// validation error rather than a crash.
#[async_trait]
pub trait SyntaxChecker: Send + Sync {
    async fn check(&self, code: &str) -> Result<SyntaxVerdict>;
}

/// Runs `<python> -m py_compile` on a throwaway copy of the code.
pub struct PythonSyntaxChecker {
    python_cmd: String,
    timeout: Duration,
    scratch_root: PathBuf,
}

impl PythonSyntaxChecker {
    pub fn new(python_cmd: impl Into<String>, timeout: Duration) -> Self {
        Self {
            python_cmd: python_cmd.into(),
            timeout,
            scratch_root: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_root(mut self, root: PathBuf) -> Self {
        self.scratch_root = root;
        self
    }

    async fn compile(&self, file: &std::path::Path) -> Result<SyntaxVerdict> {
        let mut cmd = Command::new(&self.python_cmd);
        cmd.arg("-m")
            .arg("py_compile")
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                anyhow::anyhow!("syntax check timed out after {}s", self.timeout.as_secs())
            })?
            .with_context(|| format!("could not run '{}'", self.python_cmd))?;

        if output.status.success() {
            return Ok(SyntaxVerdict::Valid);
        }
        let mut diagnostics = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if diagnostics.is_empty() {
            diagnostics = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        Ok(SyntaxVerdict::Invalid(diagnostics))
    }
}

#[async_trait]
impl SyntaxChecker for PythonSyntaxChecker {
    async fn check(&self, code: &str) -> Result<SyntaxVerdict> {
        let dir = self
            .scratch_root
            .join(format!("promptreel-syntax-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("could not create scratch dir {}", dir.display()))?;
        let file = dir.join("candidate.py");

        let result = match tokio::fs::write(&file, code).await {
            Ok(()) => self.compile(&file).await,
            Err(e) => Err(anyhow::Error::new(e).context("could not write scratch file")),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            debug!(dir = %dir.display(), error = %e, "Failed to remove syntax scratch dir");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_interpreter_is_an_error() {
        let scratch = tempfile::tempdir().unwrap();
        let checker = PythonSyntaxChecker::new("definitely-not-a-python-binary", Duration::from_secs(5))
            .with_scratch_root(scratch.path().to_path_buf());
        let err = checker.check("x = 1").await.unwrap_err();
        assert!(err.to_string().contains("could not run"));
        // Scratch directory is removed even on failure.
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }
}
