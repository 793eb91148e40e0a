//! Code generation: prompt in, Manim source plus explanation out.
//!
//! `CodeGenerator` owns the conversation shape, retry/backoff, output cleaning
//! and the explanation fallback. The transport sits behind [`CodeModel`] so the
//! generator can be driven by a scripted model in tests.

pub mod gemini;

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::errors::{GenerationErrorCode, InputError, ModelError};

pub use gemini::GeminiModel;

/// Fixed system preamble for the code call.
pub const SYSTEM_PREAMBLE: &str = "You are a Manim code generation assistant. \
Generate Python code using the Manim Community library that creates the animation described by the user. \
Respond with a single complete, runnable Python module: import from manim, define exactly one class \
that extends Scene, and put the whole animation inside its construct(self) method. \
Do not include explanations, prose, or anything outside the code.";

/// Primed model reply that precedes the user's prompt.
const PRIMING_REPLY: &str = "Understood. I will reply with only the main executable Manim code.";

pub const INVALID_OUTPUT_MESSAGE: &str = "generated output not recognizable as valid source";

static SCENE_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*class\s+\w+\s*\([^)]*Scene[^)]*\)\s*:").expect("scene class pattern")
});

static FENCE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*```\s*[\w+-]*\s*$").expect("fence pattern"));

/// A non-empty, trimmed prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt(String);

impl Prompt {
    pub fn parse(raw: &str) -> Result<Self, InputError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InputError::EmptyPrompt);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Prompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self { role: Role::Model, text: text.into() }
    }
}

/// One request to the model: optional system instruction plus history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelRequest {
    pub system: Option<String>,
    pub turns: Vec<Turn>,
}

/// Transport to a conversational code model.
#[async_trait]
pub trait CodeModel: Send + Sync {
    /// Streamed call; the returned text is every chunk concatenated in order.
    async fn stream(&self, request: &ModelRequest) -> Result<String, ModelError>;

    /// Single-shot call.
    async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Result of one generation. Never an `Err`: failures are data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Success { code: String, explanation: String },
    Failure { code: GenerationErrorCode, message: String },
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    fn failure(code: GenerationErrorCode, message: impl Into<String>) -> Self {
        Self::Failure { code, message: message.into() }
    }
}

pub struct CodeGenerator {
    model: Arc<dyn CodeModel>,
    retry: RetryPolicy,
}

impl CodeGenerator {
    pub fn new(model: Arc<dyn CodeModel>, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }

    pub async fn generate(&self, prompt: &Prompt) -> GenerationOutcome {
        let raw = match self.stream_code(prompt).await {
            Ok(raw) => raw,
            Err(e) => return GenerationOutcome::failure(e.code(), e.to_string()),
        };

        let code = strip_code_fences(&raw);
        if !looks_like_scene(&code) {
            warn!(chars = raw.len(), "Model output has no Scene subclass");
            return GenerationOutcome::failure(GenerationErrorCode::Unknown, INVALID_OUTPUT_MESSAGE);
        }
        info!(chars = code.len(), "Generated scene source");

        let explanation = self.explain(prompt, &code).await;
        GenerationOutcome::Success { code, explanation }
    }

    async fn stream_code(&self, prompt: &Prompt) -> Result<String, ModelError> {
        let request = code_request(prompt);
        let attempts = self.retry.attempts();
        let mut attempt = 1;
        loop {
            let result = match self.model.stream(&request).await {
                Ok(text) if text.trim().is_empty() => Err(ModelError::EmptyResponse),
                other => other,
            };
            match result {
                Ok(text) => return Ok(text),
                Err(e) if attempt < attempts && e.code().is_retryable() => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(attempt, code = %e.code(), delay_ms = delay.as_millis() as u64, error = %e,
                        "Code generation attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(attempt, code = %e.code(), error = %e, "Code generation failed");
                    return Err(e);
                }
            }
        }
    }

    async fn explain(&self, prompt: &Prompt, code: &str) -> String {
        let request = ModelRequest {
            system: None,
            turns: vec![Turn::user(format!(
                "Explain in a short paragraph, for a viewer with no programming background, \
                 what the animation produced by this Manim code shows.\n\n{code}"
            ))],
        };
        match self.model.complete(&request).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                debug!("Empty explanation, using template");
                fallback_explanation(prompt)
            }
            Err(e) => {
                warn!(error = %e, "Explanation call failed, using template");
                fallback_explanation(prompt)
            }
        }
    }
}

fn code_request(prompt: &Prompt) -> ModelRequest {
    ModelRequest {
        system: Some(SYSTEM_PREAMBLE.to_string()),
        turns: vec![
            Turn::user(SYSTEM_PREAMBLE),
            Turn::model(PRIMING_REPLY),
            Turn::user(prompt.as_str()),
        ],
    }
}

pub fn fallback_explanation(prompt: &Prompt) -> String {
    format!(
        "This animation was generated from the request \"{}\". \
         It is a single Manim scene that draws and animates the described content.",
        prompt
    )
}

/// Drop every line that is only a triple-backtick fence (with or without a
/// language tag), then trim.
pub fn strip_code_fences(raw: &str) -> String {
    raw.lines()
        .filter(|line| !FENCE_LINE.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

pub fn looks_like_scene(code: &str) -> bool {
    SCENE_CLASS.is_match(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const SCENE: &str = "from manim import *\n\nclass Hello(Scene):\n    def construct(self):\n        self.play(Write(Text(\"hi\")))";

    struct ScriptedModel {
        stream_results: Mutex<VecDeque<Result<String, ModelError>>>,
        complete_result: Mutex<Option<Result<String, ModelError>>>,
        stream_calls: Mutex<u32>,
        last_explain_request: Mutex<Option<ModelRequest>>,
    }

    impl ScriptedModel {
        fn new(stream: Vec<Result<String, ModelError>>, complete: Result<String, ModelError>) -> Self {
            Self {
                stream_results: Mutex::new(stream.into()),
                complete_result: Mutex::new(Some(complete)),
                stream_calls: Mutex::new(0),
                last_explain_request: Mutex::new(None),
            }
        }

        fn stream_calls(&self) -> u32 {
            *self.stream_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CodeModel for ScriptedModel {
        async fn stream(&self, _request: &ModelRequest) -> Result<String, ModelError> {
            *self.stream_calls.lock().unwrap() += 1;
            self.stream_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ModelError::Other("script exhausted".into())))
        }

        async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
            *self.last_explain_request.lock().unwrap() = Some(request.clone());
            self.complete_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(ModelError::EmptyResponse))
        }
    }

    fn generator(model: Arc<ScriptedModel>) -> CodeGenerator {
        CodeGenerator::new(model, RetryPolicy { max_attempts: 3, base_delay: Duration::ZERO })
    }

    fn prompt() -> Prompt {
        Prompt::parse("a circle turning into a square").unwrap()
    }

    #[test]
    fn test_prompt_rejects_blank() {
        assert_eq!(Prompt::parse(""), Err(InputError::EmptyPrompt));
        assert_eq!(Prompt::parse("  \n\t"), Err(InputError::EmptyPrompt));
        assert_eq!(Prompt::parse("  spin  ").unwrap().as_str(), "spin");
    }

    #[test]
    fn test_strip_code_fences() {
        let raw = "```python\nfrom manim import *\nclass A(Scene):\n    pass\n```\n";
        assert_eq!(strip_code_fences(raw), "from manim import *\nclass A(Scene):\n    pass");
        let bare = "```\nx = 1\n```";
        assert_eq!(strip_code_fences(bare), "x = 1");
    }

    #[test]
    fn test_strip_code_fences_is_idempotent() {
        for raw in ["```python\nprint(1)\n```", "plain", "  ```py\n\nA\n```  \n", "``` \n```"] {
            let once = strip_code_fences(raw);
            assert_eq!(strip_code_fences(&once), once);
        }
    }

    #[test]
    fn test_strip_keeps_inline_backticks() {
        let raw = "s = \"```not a fence``` \"\nclass A(Scene): pass";
        assert!(strip_code_fences(raw).contains("```not a fence```"));
    }

    #[test]
    fn test_looks_like_scene() {
        assert!(looks_like_scene(SCENE));
        assert!(looks_like_scene("class Intro(ThreeDScene):\n  pass"));
        assert!(looks_like_scene("class Intro(MovingCameraScene, Mixin) :\n  pass"));
        assert!(!looks_like_scene("I'm sorry, I can't help with that."));
        assert!(!looks_like_scene("class Plain(object):\n  pass"));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_generate_success_with_explanation() {
        let model = Arc::new(ScriptedModel::new(
            vec![Ok(format!("```python\n{SCENE}\n```"))],
            Ok("  A greeting is written.  ".into()),
        ));
        let outcome = generator(model.clone()).generate(&prompt()).await;
        assert_eq!(
            outcome,
            GenerationOutcome::Success {
                code: SCENE.to_string(),
                explanation: "A greeting is written.".to_string()
            }
        );
        // The explanation is asked about the cleaned code, not the raw reply.
        let request = model.last_explain_request.lock().unwrap().clone().unwrap();
        assert!(request.turns[0].text.ends_with(SCENE));
    }

    #[tokio::test]
    async fn test_generate_retries_transient_errors() {
        let model = Arc::new(ScriptedModel::new(
            vec![
                Err(ModelError::ServiceUnavailable("503".into())),
                Err(ModelError::Network("reset".into())),
                Ok(SCENE.into()),
            ],
            Ok("explained".into()),
        ));
        let outcome = generator(model.clone()).generate(&prompt()).await;
        assert!(outcome.is_success());
        assert_eq!(model.stream_calls(), 3);
    }

    #[tokio::test]
    async fn test_generate_gives_up_after_max_attempts() {
        let model = Arc::new(ScriptedModel::new(
            vec![
                Err(ModelError::QuotaExceeded("429".into())),
                Err(ModelError::QuotaExceeded("429".into())),
                Err(ModelError::QuotaExceeded("429".into())),
                Ok(SCENE.into()),
            ],
            Ok("unused".into()),
        ));
        let outcome = generator(model.clone()).generate(&prompt()).await;
        assert!(matches!(
            outcome,
            GenerationOutcome::Failure { code: GenerationErrorCode::QuotaExceeded, .. }
        ));
        assert_eq!(model.stream_calls(), 3);
    }

    #[tokio::test]
    async fn test_api_key_error_is_not_retried() {
        let model = Arc::new(ScriptedModel::new(
            vec![Err(ModelError::Credentials("API key not valid".into())), Ok(SCENE.into())],
            Ok("unused".into()),
        ));
        let outcome = generator(model.clone()).generate(&prompt()).await;
        assert!(matches!(
            outcome,
            GenerationOutcome::Failure { code: GenerationErrorCode::ApiKeyError, .. }
        ));
        assert_eq!(model.stream_calls(), 1);
    }

    #[tokio::test]
    async fn test_unrecognizable_output_fails_without_retry() {
        let model = Arc::new(ScriptedModel::new(
            vec![Ok("Sure! Here is a description of a circle.".into()), Ok(SCENE.into())],
            Ok("unused".into()),
        ));
        let outcome = generator(model.clone()).generate(&prompt()).await;
        assert_eq!(
            outcome,
            GenerationOutcome::Failure {
                code: GenerationErrorCode::Unknown,
                message: INVALID_OUTPUT_MESSAGE.to_string()
            }
        );
        assert_eq!(model.stream_calls(), 1);
    }

    #[tokio::test]
    async fn test_explanation_failure_falls_back_to_template() {
        let model = Arc::new(ScriptedModel::new(
            vec![Ok(SCENE.into())],
            Err(ModelError::ServiceUnavailable("busy".into())),
        ));
        let outcome = generator(model).generate(&prompt()).await;
        match outcome {
            GenerationOutcome::Success { explanation, .. } => {
                assert!(explanation.contains("a circle turning into a square"));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }
}
