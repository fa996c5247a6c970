//! OpenAI-compatible enrichment provider.
//!
//! Works with any server exposing `/chat/completions` with JSON mode
//! (OpenAI, vLLM, LM Studio, OpenRouter).

pub mod error;
pub mod types;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use paperscope_core::{defaults, Error, Result};

use crate::provider::{retry_after, truncate, Capability, EnrichmentProvider, PromptRequest};

pub use error::{to_pipeline_error, OpenAIErrorCode};
use types::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, OpenAIErrorResponse, ResponseFormat};

/// Provider backed by an OpenAI-compatible chat completions API.
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(base_url: &str, model: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl EnrichmentProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> &[Capability] {
        &Capability::ALL
    }

    #[instrument(skip(self, request), fields(subsystem = "inference", component = "openai", op = "complete_json", model = %self.model, prompt_len = request.prompt.len()))]
    async fn complete_json(&self, request: &PromptRequest) -> Result<String> {
        let start = Instant::now();

        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system".into(),
                content: Some(request.system.clone()),
            });
        }
        messages.push(ChatMessage {
            role: "user".into(),
            content: Some(request.prompt.clone()),
        });

        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: defaults::ENRICH_TEMPERATURE,
            response_format: ResponseFormat::json_object(),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let hint = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            let (kind, message) = match serde_json::from_str::<OpenAIErrorResponse>(&text) {
                Ok(parsed) => (
                    parsed.error.code.unwrap_or(parsed.error.error_type),
                    parsed.error.message,
                ),
                Err(_) => (String::new(), truncate(&text, 200).to_string()),
            };
            let code = OpenAIErrorCode::from_response(status.as_u16(), &kind);
            return Err(to_pipeline_error(code, &message, hint));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("openai response envelope: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Serialization("openai response has no choices".into()))?;

        debug!(
            finish_reason = choice.finish_reason.as_deref().unwrap_or("unknown"),
            duration_ms = start.elapsed().as_millis() as u64,
            "OpenAI completion finished"
        );
        Ok(choice.message.content.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> PromptRequest {
        PromptRequest {
            system: String::new(),
            prompt: "Title: Test".into(),
        }
    }

    fn provider(server: &MockServer) -> OpenAiProvider {
        OpenAiProvider::new(&server.uri(), "gpt-4o-mini", "sk-test", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_complete_json_sends_bearer_and_reads_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "{\"summary\":\"s\"}"},
                    "finish_reason": "stop"
                }]
            })))
            .mount(&server)
            .await;

        let out = provider(&server).complete_json(&request()).await.unwrap();
        assert_eq!(out, "{\"summary\":\"s\"}");
    }

    #[tokio::test]
    async fn test_rate_limit_maps_with_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "1")
                    .set_body_json(serde_json::json!({
                        "error": {"message": "Rate limit reached", "type": "requests", "code": "rate_limit_exceeded"}
                    })),
            )
            .mount(&server)
            .await;

        let err = provider(&server).complete_json(&request()).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_auth_failure_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"message": "Invalid API key", "type": "invalid_request_error", "code": "invalid_api_key"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server).complete_json(&request()).await.unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable(_)));
    }
}
