use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CodeModel, ModelRequest};
use crate::errors::ModelError;

/// Gemini `generateContent` / `streamGenerateContent` over HTTPS.
pub struct GeminiModel {
    client: reqwest::Client,
    api_base: String,
    model: String,
    api_key: Option<String>,
}

impl GeminiModel {
    pub fn new(
        api_base: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.api_base, self.model, method)
    }

    fn key(&self) -> Result<&str, ModelError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ModelError::Credentials("no API key configured".to_string()))
    }

    async fn send(
        &self,
        method: &str,
        query: &[(&str, &str)],
        request: &ModelRequest,
    ) -> Result<reqwest::Response, ModelError> {
        let resp = self
            .client
            .post(self.endpoint(method))
            .query(query)
            .header("x-goog-api-key", self.key()?)
            .json(&WireRequest::from(request))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl CodeModel for GeminiModel {
    async fn stream(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let resp = self
            .send("streamGenerateContent", &[("alt", "sse")], request)
            .await?;

        let mut parser = SseParser::default();
        let mut text = String::new();
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(classify_transport)?;
            for event in parser.feed(&chunk) {
                text.push_str(&event.into_text()?);
            }
        }
        for event in parser.finish() {
            text.push_str(&event.into_text()?);
        }
        debug!(chars = text.len(), model = %self.model, "Stream finished");
        Ok(text)
    }

    async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let resp = self.send("generateContent", &[], request).await?;
        let parsed: WireResponse = resp
            .json()
            .await
            .map_err(|e| ModelError::Other(format!("malformed response: {e}")))?;
        parsed.into_text()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    contents: Vec<WireContent>,
}

impl From<&ModelRequest> for WireRequest {
    fn from(request: &ModelRequest) -> Self {
        Self {
            system_instruction: request.system.as_ref().map(|text| WireContent {
                role: None,
                parts: vec![WirePart { text: Some(text.clone()) }],
            }),
            contents: request
                .turns
                .iter()
                .map(|turn| WireContent {
                    role: Some(turn.role.as_str().to_string()),
                    parts: vec![WirePart { text: Some(turn.text.clone()) }],
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl WireResponse {
    fn into_text(self) -> Result<String, ModelError> {
        if let Some(err) = self.error {
            return Err(ModelError::classify_message(&format!("{}: {}", err.status, err.message)));
        }
        Ok(self
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect())
    }
}

/// Incremental `text/event-stream` decoder for `alt=sse` responses.
///
/// Bytes are buffered until a full line arrives, so a UTF-8 sequence split
/// across network chunks decodes intact.
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
    data: String,
}

impl SseParser {
    fn feed(&mut self, bytes: &[u8]) -> Vec<WireResponse> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            self.line(line.trim_end_matches(['\r', '\n']), &mut events);
        }
        events
    }

    fn finish(&mut self) -> Vec<WireResponse> {
        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            let line = String::from_utf8_lossy(&rest);
            self.line(line.trim_end_matches('\r'), &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn line(&mut self, line: &str, events: &mut Vec<WireResponse>) {
        if line.is_empty() {
            self.dispatch(events);
        } else if let Some(data) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(data.strip_prefix(' ').unwrap_or(data));
        }
    }

    fn dispatch(&mut self, events: &mut Vec<WireResponse>) {
        let data = std::mem::take(&mut self.data);
        if data.trim().is_empty() {
            return;
        }
        match serde_json::from_str::<WireResponse>(&data) {
            Ok(event) => events.push(event),
            Err(e) => debug!(error = %e, "Skipping undecodable SSE event"),
        }
    }
}

fn classify_transport(err: reqwest::Error) -> ModelError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ModelError::Network(err.to_string())
    } else {
        ModelError::classify_message(&err.to_string())
    }
}

/// Map a non-2xx status to an error, falling back to the body text.
fn classify_status(status: StatusCode, body: &str) -> ModelError {
    let detail = format!("{status}: {}", body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ModelError::Credentials(detail),
        StatusCode::TOO_MANY_REQUESTS => ModelError::QuotaExceeded(detail),
        StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::BAD_GATEWAY
        | StatusCode::GATEWAY_TIMEOUT
        | StatusCode::INTERNAL_SERVER_ERROR => ModelError::ServiceUnavailable(detail),
        _ => ModelError::classify_message(&detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GenerationErrorCode;
    use crate::generator::Turn;

    #[test]
    fn test_sse_parser_across_chunk_boundaries() {
        let mut parser = SseParser::default();
        let first = parser.feed(b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"from ma");
        assert!(first.is_empty());
        let second = parser.feed(b"nim\"}]}}]}\r\n\r\ndata: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" import *\"}]}}]}\n\n");
        let text: String = second.into_iter().map(|e| e.into_text().unwrap()).collect();
        assert_eq!(text, "from manim import *");
    }

    #[test]
    fn test_sse_parser_keeps_multibyte_char_split_across_chunks() {
        let event = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Text(\\\"π\\\")\"}]}}]}\n\n";
        let bytes = event.as_bytes();
        let split = event.find('π').unwrap() + 1;
        assert!(!event.is_char_boundary(split));

        let mut parser = SseParser::default();
        assert!(parser.feed(&bytes[..split]).is_empty());
        let events = parser.feed(&bytes[split..]);
        assert_eq!(events.len(), 1);
        let text = events.into_iter().next().unwrap().into_text().unwrap();
        assert_eq!(text, "Text(\"π\")");
    }

    #[test]
    fn test_sse_parser_flushes_unterminated_event() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"x\"}]}}]}").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_sse_error_event_is_classified() {
        let mut parser = SseParser::default();
        let events = parser.feed(
            b"data: {\"error\":{\"code\":429,\"message\":\"Quota exceeded\",\"status\":\"RESOURCE_EXHAUSTED\"}}\n\n",
        );
        let err = events.into_iter().next().unwrap().into_text().unwrap_err();
        assert_eq!(err.code(), GenerationErrorCode::QuotaExceeded);
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, "overloaded").code(),
            GenerationErrorCode::ServiceUnavailable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "").code(),
            GenerationErrorCode::QuotaExceeded
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, "").code(),
            GenerationErrorCode::ApiKeyError
        );
        // Gemini reports a bad key as 400 INVALID_ARGUMENT with API_KEY_INVALID.
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "API key not valid. reason: API_KEY_INVALID").code(),
            GenerationErrorCode::ApiKeyError
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "bad schema").code(),
            GenerationErrorCode::Unknown
        );
    }

    #[test]
    fn test_wire_request_shape() {
        let request = ModelRequest {
            system: Some("sys".into()),
            turns: vec![Turn::user("hi"), Turn::model("ok")],
        };
        let json = serde_json::to_value(WireRequest::from(&request)).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][1]["parts"][0]["text"], "ok");
    }

    #[tokio::test]
    async fn test_missing_key_is_credentials_error() {
        let model = GeminiModel::new("http://127.0.0.1:9", "m", None, Duration::from_secs(1)).unwrap();
        let err = model.complete(&ModelRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), GenerationErrorCode::ApiKeyError);
    }
}
