//! OpenAI-compatible inference client.
//!
//! Sends non-streaming chat completion requests with tool definitions and
//! parses the reply into a `ModelTurn`. No retries or fallbacks: any failure
//! goes straight back to the caller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::errors::InferenceError;
use super::parse::parse_completion_response;
use super::types::{ChatCompletionRequest, ChatMessage, ModelTurn, ToolDefinition};
use super::ChatModel;
use crate::config::LlmSettings;

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a hosted chat completions endpoint.
pub struct InferenceClient {
    http: HttpClient,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    request_timeout_secs: u64,
}

impl std::fmt::Debug for InferenceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl InferenceClient {
    /// Build a client from settings. Fails without an API key.
    ///
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, InferenceError> {
        let api_key = settings.resolved_api_key().ok_or(InferenceError::Config {
            reason: format!(
                "no API key: set llm.api_key or {}",
                crate::config::API_KEY_ENV
            ),
        })?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: settings.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            request_timeout_secs: settings.request_timeout_secs,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: self.request_timeout_secs,
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl ChatModel for InferenceClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let tools = (!tools.is_empty()).then(|| tools.to_vec());

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        // Request metadata only; the body can be huge.
        tracing::debug!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            max_tokens = body.max_tokens,
            "chat completion request"
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| self.map_send_error(&url, e))?;

        let turn = parse_completion_response(&body_text)?;
        tracing::debug!(
            tool_calls = turn.tool_calls.len(),
            text_len = turn.text.as_deref().map(str::len).unwrap_or(0),
            finish_reason = turn.finish_reason.as_deref().unwrap_or("none"),
            "chat completion response"
        );
        Ok(turn)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::FunctionDefinition;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(base_url: &str) -> LlmSettings {
        LlmSettings {
            base_url: base_url.to_string(),
            model: "test/model".to_string(),
            api_key: Some("sk-test".to_string()),
            request_timeout_secs: 1,
            ..LlmSettings::default()
        }
    }

    fn read_file_tool() -> ToolDefinition {
        ToolDefinition {
            r#type: "function".into(),
            function: FunctionDefinition {
                name: "read_file".into(),
                description: "Read a file".into(),
                parameters: serde_json::json!({"type": "object"}),
            },
        }
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let mut s = settings("http://localhost:1");
        s.api_key = Some("   ".into());
        // Only meaningful when the fallback env var is unset.
        if std::env::var(crate::config::API_KEY_ENV).is_err() {
            let err = InferenceClient::from_settings(&s).unwrap_err();
            assert!(matches!(err, InferenceError::Config { .. }));
        }
    }

    #[tokio::test]
    async fn test_complete_sends_tools_and_parses_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "test/model",
                "tool_choice": "auto",
                "stream": false,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "Looking at billing first.",
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "read_file", "arguments": "{\"path\":\"billing.py\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = InferenceClient::from_settings(&settings(&server.uri())).unwrap();
        let turn = client
            .complete(&[ChatMessage::user("go")], &[read_file_tool()])
            .await
            .unwrap();

        assert_eq!(turn.text.as_deref(), Some("Looking at billing first."));
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].arguments["path"], "billing.py");
    }

    #[tokio::test]
    async fn test_trailing_slash_in_base_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let client =
            InferenceClient::from_settings(&settings(&format!("{}/", server.uri()))).unwrap();
        let turn = client.complete(&[ChatMessage::user("hi")], &[]).await.unwrap();
        assert_eq!(turn, ModelTurn::text("ok"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let client = InferenceClient::from_settings(&settings(&server.uri())).unwrap();
        let err = client.complete(&[ChatMessage::user("hi")], &[]).await.unwrap_err();
        match err {
            InferenceError::HttpError { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "rate limited");
            }
            other => panic!("expected HttpError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_endpoint_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"choices": []}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = InferenceClient::from_settings(&settings(&server.uri())).unwrap();
        let err = client.complete(&[ChatMessage::user("hi")], &[]).await.unwrap_err();
        assert!(matches!(err, InferenceError::Timeout { duration_secs: 1 }));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_failed() {
        let client = InferenceClient::from_settings(&settings("http://127.0.0.1:1")).unwrap();
        let err = client.complete(&[ChatMessage::user("hi")], &[]).await.unwrap_err();
        assert!(matches!(err, InferenceError::ConnectionFailed { .. }));
    }
}
