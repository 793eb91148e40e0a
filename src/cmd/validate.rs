//! Offline scene check: `promptreel validate <FILE>`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use promptreel::config::StudioToml;
use promptreel::validator::{PythonSyntaxChecker, SandboxValidator};

/// Print the report; returns whether the code is valid.
pub async fn cmd_validate(config: &StudioToml, file: &Path) -> Result<bool> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let checker = PythonSyntaxChecker::new(
        &config.validator.python_cmd,
        Duration::from_secs(config.validator.syntax_timeout_secs),
    );
    let validator = SandboxValidator::new(Arc::new(checker), config.validator.max_code_bytes);
    let report = validator.validate(&code).await;

    if report.is_valid {
        println!("{}: valid", file.display());
    } else {
        println!("{}: invalid", file.display());
        for error in &report.errors {
            println!("  error: {error}");
        }
    }
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }

    Ok(report.is_valid)
}
