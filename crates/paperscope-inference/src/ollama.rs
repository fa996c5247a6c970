//! Ollama enrichment provider.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use paperscope_core::{defaults, Error, Result};

use crate::provider::{status_error, Capability, EnrichmentProvider, PromptRequest};

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    format: &'a str,
    options: ChatOptions,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
    /// `/api/generate`-style payloads put the text here instead.
    #[serde(default)]
    response: Option<String>,
}

/// Provider backed by a local Ollama server's chat API.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl EnrichmentProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> &[Capability] {
        &Capability::ALL
    }

    #[instrument(skip(self, request), fields(subsystem = "inference", component = "ollama", op = "complete_json", model = %self.model, prompt_len = request.prompt.len()))]
    async fn complete_json(&self, request: &PromptRequest) -> Result<String> {
        let start = Instant::now();

        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            format: "json",
            options: ChatOptions {
                temperature: defaults::ENRICH_TEMPERATURE,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(status_error("ollama", status, &headers, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("ollama response envelope: {e}")))?;

        let content = parsed
            .message
            .map(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .or(parsed.response)
            .unwrap_or_default();

        debug!(
            response_len = content.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Ollama completion finished"
        );
        Ok(content)
    }
}
