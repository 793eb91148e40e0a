//! Typed error hierarchy for the promptreel pipeline.
//!
//! - `InputError`: request-level validation failures, surfaced before a job exists
//! - `ModelError`: failures from a `CodeModel` transport, tagged where they are caught
//! - `GenerationErrorCode`: the five codes a generation failure is reported under
//! - `RenderError`: render-stage failures (process vs. missing artifact)

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors found in a request before any job is created.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("Prompt is required")]
    EmptyPrompt,

    #[error("Updated code is required")]
    EmptyCode,
}

/// Error codes a failed generation is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationErrorCode {
    ServiceUnavailable,
    QuotaExceeded,
    ApiKeyError,
    NetworkError,
    Unknown,
}

impl GenerationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::ApiKeyError => "API_KEY_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Credential problems will not fix themselves between attempts.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ApiKeyError)
    }

    /// Friendly message shown to the caller for this code.
    pub fn user_message(&self, original: &str) -> String {
        match self {
            Self::ServiceUnavailable => {
                "AI service is currently busy. Please try again in a few minutes.".to_string()
            }
            Self::QuotaExceeded => "API quota exceeded. Please try again later.".to_string(),
            Self::ApiKeyError => "Service configuration error. Please contact support.".to_string(),
            Self::NetworkError => {
                "Network connectivity issue. Please check your connection and try again."
                    .to_string()
            }
            Self::Unknown => format!("Service temporarily unavailable: {}", original),
        }
    }
}

impl std::fmt::Display for GenerationErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a code-generation model transport.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("model quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("model credentials rejected: {0}")]
    Credentials(String),

    #[error("network error talking to model: {0}")]
    Network(String),

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("model error: {0}")]
    Other(String),
}

impl ModelError {
    pub fn code(&self) -> GenerationErrorCode {
        match self {
            Self::ServiceUnavailable(_) => GenerationErrorCode::ServiceUnavailable,
            Self::QuotaExceeded(_) => GenerationErrorCode::QuotaExceeded,
            Self::Credentials(_) => GenerationErrorCode::ApiKeyError,
            Self::Network(_) => GenerationErrorCode::NetworkError,
            Self::EmptyResponse | Self::Other(_) => GenerationErrorCode::Unknown,
        }
    }

    /// Tag an untyped upstream message by the substrings the model API is
    /// known to use. Used when the transport only hands back text.
    pub fn classify_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        let owned = message.to_string();
        if lower.contains("overloaded")
            || lower.contains("unavailable")
            || lower.contains("503")
        {
            Self::ServiceUnavailable(owned)
        } else if lower.contains("quota")
            || lower.contains("resource_exhausted")
            || lower.contains("rate limit")
            || lower.contains("429")
        {
            Self::QuotaExceeded(owned)
        } else if lower.contains("api key")
            || lower.contains("api_key")
            || lower.contains("permission_denied")
            || lower.contains("unauthenticated")
        {
            Self::Credentials(owned)
        } else if lower.contains("network")
            || lower.contains("fetch failed")
            || lower.contains("connection")
            || lower.contains("timed out")
            || lower.contains("dns")
        {
            Self::Network(owned)
        } else {
            Self::Other(owned)
        }
    }
}

/// One failed attempt of a render invocation strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    pub strategy: &'static str,
    pub reason: String,
}

impl std::fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.strategy, self.reason)
    }
}

/// Errors from the render stage.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to prepare working directory {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("All renderer invocations failed ({})", format_failures(.failures))]
    StrategiesExhausted { failures: Vec<StrategyFailure> },

    #[error("Renderer finished but produced no output video under {}", .work_dir.display())]
    NoOutput { work_dir: PathBuf },
}

impl RenderError {
    /// True when the renderer ran cleanly but left nothing behind.
    pub fn is_missing_output(&self) -> bool {
        matches!(self, Self::NoOutput { .. })
    }
}

fn format_failures(failures: &[StrategyFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_error_is_the_only_non_retryable_code() {
        assert!(!GenerationErrorCode::ApiKeyError.is_retryable());
        for code in [
            GenerationErrorCode::ServiceUnavailable,
            GenerationErrorCode::QuotaExceeded,
            GenerationErrorCode::NetworkError,
            GenerationErrorCode::Unknown,
        ] {
            assert!(code.is_retryable(), "{code} should be retryable");
        }
    }

    #[test]
    fn unknown_message_embeds_original_text() {
        let msg = GenerationErrorCode::Unknown.user_message("boom");
        assert_eq!(msg, "Service temporarily unavailable: boom");
        let quota = GenerationErrorCode::QuotaExceeded.user_message("ignored");
        assert!(quota.contains("quota"));
        assert!(!quota.contains("ignored"));
    }

    #[test]
    fn error_code_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&GenerationErrorCode::ServiceUnavailable).unwrap();
        assert_eq!(json, "\"SERVICE_UNAVAILABLE\"");
        let parsed: GenerationErrorCode = serde_json::from_str("\"API_KEY_ERROR\"").unwrap();
        assert_eq!(parsed, GenerationErrorCode::ApiKeyError);
    }

    #[test]
    fn classify_message_recognizes_known_substrings() {
        assert_eq!(
            ModelError::classify_message("The model is overloaded").code(),
            GenerationErrorCode::ServiceUnavailable
        );
        assert_eq!(
            ModelError::classify_message("RESOURCE_EXHAUSTED: quota").code(),
            GenerationErrorCode::QuotaExceeded
        );
        assert_eq!(
            ModelError::classify_message("API key not valid").code(),
            GenerationErrorCode::ApiKeyError
        );
        assert_eq!(
            ModelError::classify_message("fetch failed").code(),
            GenerationErrorCode::NetworkError
        );
        assert_eq!(
            ModelError::classify_message("something odd").code(),
            GenerationErrorCode::Unknown
        );
    }

    #[test]
    fn render_error_variants_are_distinguishable() {
        let exhausted = RenderError::StrategiesExhausted {
            failures: vec![
                StrategyFailure { strategy: "a", reason: "exit 1".into() },
                StrategyFailure { strategy: "b", reason: "exit 2".into() },
            ],
        };
        assert!(!exhausted.is_missing_output());
        assert!(exhausted.to_string().contains("a: exit 1; b: exit 2"));

        let missing = RenderError::NoOutput { work_dir: PathBuf::from("/tmp/job") };
        assert!(missing.is_missing_output());
        assert!(missing.to_string().contains("no output"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&InputError::EmptyPrompt);
        assert_std_error(&ModelError::EmptyResponse);
        assert_std_error(&RenderError::NoOutput { work_dir: PathBuf::new() });
    }
}
