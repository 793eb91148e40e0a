//! Sandbox validator: static deny-list, interpreter syntax check, Manim
//! domain checks. Stages run in order and stop at the first failing one.

pub mod rules;
pub mod syntax;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use syntax::{PythonSyntaxChecker, SyntaxChecker, SyntaxVerdict};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self { is_valid: errors.is_empty(), errors, warnings }
    }
}

pub struct SandboxValidator {
    checker: Arc<dyn SyntaxChecker>,
    max_code_bytes: usize,
}

impl SandboxValidator {
    pub fn new(checker: Arc<dyn SyntaxChecker>, max_code_bytes: usize) -> Self {
        Self { checker, max_code_bytes }
    }

    pub async fn validate(&self, code: &str) -> ValidationReport {
        let mut warnings = Vec::new();

        let errors = static_errors(code, self.max_code_bytes, &mut warnings);
        if !errors.is_empty() {
            debug!(errors = errors.len(), "Static analysis rejected code");
            return ValidationReport::from_parts(errors, warnings);
        }

        match self.checker.check(code).await {
            Ok(SyntaxVerdict::Valid) => {}
            Ok(SyntaxVerdict::Invalid(diagnostics)) => {
                return ValidationReport::from_parts(
                    vec![format!("Python syntax error: {}", diagnostics)],
                    warnings,
                );
            }
            Err(e) => {
                return ValidationReport::from_parts(
                    vec![format!("Failed to perform syntax validation: {:#}", e)],
                    warnings,
                );
            }
        }

        let errors = domain_errors(code, &mut warnings);
        ValidationReport::from_parts(errors, warnings)
    }
}

/// Static stage. Empty and oversized input stop immediately; deny-list hits
/// are all reported together.
pub fn static_errors(code: &str, max_code_bytes: usize, warnings: &mut Vec<String>) -> Vec<String> {
    if code.trim().is_empty() {
        return vec!["Code cannot be empty".to_string()];
    }
    if code.len() > max_code_bytes {
        return vec![format!(
            "Code exceeds maximum allowed size ({}KB)",
            max_code_bytes / 1024
        )];
    }

    let errors: Vec<String> = rules::DENY_RULES
        .iter()
        .filter(|rule| rule.violated_by(code))
        .map(|rule| rule.message.to_string())
        .collect();

    if rules::WHILE_TRUE.is_match(code) && !rules::BREAK.is_match(code) {
        warnings.push("Potential infinite loop detected (while True without break)".to_string());
    }
    errors
}

fn domain_errors(code: &str, warnings: &mut Vec<String>) -> Vec<String> {
    let mut errors = Vec::new();
    if !rules::MANIM_IMPORT.is_match(code) {
        errors.push("Manim library is not imported".to_string());
    }
    if !rules::SCENE_SUBCLASS.is_match(code) {
        errors.push("No Scene class definition found".to_string());
    }
    if !rules::CONSTRUCT_METHOD.is_match(code) {
        errors.push("No construct method found in Scene class".to_string());
    }

    if !rules::DRAWABLE.is_match(code) {
        warnings.push(
            "No common Manim objects detected, code might not produce visual output".to_string(),
        );
    }
    if !rules::SCENE_CALL.is_match(code) {
        warnings.push("No animation methods detected (play, wait, add, remove)".to_string());
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GOOD: &str = "from manim import *\n\nclass Demo(Scene):\n    def construct(self):\n        c = Circle()\n        self.play(Create(c))\n";

    struct Stub {
        verdict: fn() -> anyhow::Result<SyntaxVerdict>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SyntaxChecker for Stub {
        async fn check(&self, _code: &str) -> anyhow::Result<SyntaxVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.verdict)()
        }
    }

    fn validator(verdict: fn() -> anyhow::Result<SyntaxVerdict>) -> (SandboxValidator, Arc<Stub>) {
        let stub = Arc::new(Stub { verdict, calls: AtomicUsize::new(0) });
        (SandboxValidator::new(stub.clone(), 100 * 1024), stub)
    }

    #[tokio::test]
    async fn test_empty_code_is_invalid() {
        let (v, stub) = validator(|| Ok(SyntaxVerdict::Valid));
        let report = v.validate("").await;
        assert!(!report.is_valid);
        assert_eq!(report.errors, vec!["Code cannot be empty"]);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
        assert!(!v.validate("   \n").await.is_valid);
    }

    #[tokio::test]
    async fn test_os_system_is_always_invalid() {
        let (v, _) = validator(|| Ok(SyntaxVerdict::Valid));
        let code = format!("import os\n{GOOD}        os.system('rm -rf /')\n");
        let report = v.validate(&code).await;
        assert!(!report.is_valid);
        assert!(report.errors.iter().any(|e| e.contains("os.system")));
    }

    #[tokio::test]
    async fn test_oversized_code_is_rejected() {
        let (v, _) = validator(|| Ok(SyntaxVerdict::Valid));
        let code = format!("{GOOD}#{}", "x".repeat(100 * 1024));
        let report = v.validate(&code).await;
        assert_eq!(report.errors, vec!["Code exceeds maximum allowed size (100KB)"]);
    }

    #[tokio::test]
    async fn test_good_scene_is_valid() {
        let (v, stub) = validator(|| Ok(SyntaxVerdict::Valid));
        let report = v.validate(GOOD).await;
        assert_eq!(report, ValidationReport { is_valid: true, errors: vec![], warnings: vec![] });
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_syntax_failure_short_circuits_domain_checks() {
        let (v, _) = validator(|| Ok(SyntaxVerdict::Invalid("line 3: invalid syntax".into())));
        let report = v.validate("print(").await;
        assert_eq!(report.errors, vec!["Python syntax error: line 3: invalid syntax"]);
    }

    #[tokio::test]
    async fn test_checker_error_is_reported_not_raised() {
        let (v, _) = validator(|| Err(anyhow::anyhow!("python not found")));
        let report = v.validate(GOOD).await;
        assert!(!report.is_valid);
        assert_eq!(report.errors, vec!["Failed to perform syntax validation: python not found"]);
    }

    #[tokio::test]
    async fn test_domain_errors_are_all_listed() {
        let (v, _) = validator(|| Ok(SyntaxVerdict::Valid));
        let report = v.validate("x = 1\n").await;
        assert_eq!(report.errors.len(), 3);
        assert_eq!(report.warnings.len(), 2);
    }

    #[tokio::test]
    async fn test_warnings_survive_into_report() {
        let (v, _) = validator(|| Ok(SyntaxVerdict::Valid));
        let code = format!("{GOOD}        while True:\n            pass\n");
        let report = v.validate(&code).await;
        assert!(report.is_valid);
        assert_eq!(
            report.warnings,
            vec!["Potential infinite loop detected (while True without break)"]
        );
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let json = serde_json::to_value(ValidationReport::default()).unwrap();
        assert!(json.get("isValid").is_some());
    }
}
