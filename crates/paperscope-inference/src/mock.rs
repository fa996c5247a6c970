//! Deterministic offline provider.
//!
//! Produces a stable enrichment derived from the prompt's metadata, so local
//! runs and tests need no model server. Failures can be scripted in order
//! (`then_fail`) or keyed on prompt content (`fail_when`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use paperscope_core::{Error, Result};

use crate::provider::{Capability, EnrichmentProvider, PromptRequest};

/// A failure the mock can be told to produce.
#[derive(Debug, Clone, PartialEq)]
pub enum MockFailure {
    /// 5xx-style transient error.
    Transient,
    /// Rate limit with an optional retry hint.
    RateLimited(Option<Duration>),
    /// A response that is not valid structured output.
    Malformed,
    /// Provider refuses service (auth, quota).
    Unavailable,
    /// Non-retryable request error.
    Permanent,
}

impl MockFailure {
    fn produce(&self, provider: &str) -> Result<String> {
        match self {
            MockFailure::Transient => Err(Error::TransientIo(format!("{provider}: HTTP 503"))),
            MockFailure::RateLimited(retry_after) => Err(Error::RateLimited {
                message: format!("{provider}: HTTP 429"),
                retry_after: *retry_after,
            }),
            MockFailure::Malformed => Ok("Sure! Here is the analysis you asked for.".to_string()),
            MockFailure::Unavailable => Err(Error::ProviderUnavailable(format!("{provider}: quota exhausted"))),
            MockFailure::Permanent => Err(Error::PermanentInput(format!("{provider}: HTTP 400"))),
        }
    }
}

pub struct MockProvider {
    name: String,
    model: String,
    capabilities: Vec<Capability>,
    script: Mutex<VecDeque<MockFailure>>,
    rules: Vec<(String, MockFailure)>,
    latency: Duration,
    calls: AtomicUsize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            model: "deterministic".to_string(),
            capabilities: Capability::ALL.to_vec(),
            script: Mutex::new(VecDeque::new()),
            rules: Vec::new(),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Use a different provider name (handy when a test wires two mocks).
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    /// Fail the next call (after earlier scripted failures) this way.
    pub fn then_fail(mut self, failure: MockFailure) -> Self {
        self.script.get_mut().push_back(failure);
        self
    }

    /// Always fail when the prompt contains `needle`.
    pub fn fail_when(mut self, needle: &str, failure: MockFailure) -> Self {
        self.rules.push((needle.to_string(), failure));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of `complete_json` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn deterministic_response(prompt: &str) -> String {
        let field = |prefix: &str| {
            prompt
                .lines()
                .find_map(|l| l.strip_prefix(prefix))
                .map(str::trim)
                .unwrap_or_default()
                .to_string()
        };
        let title = field("Title:");
        let categories: Vec<String> = field("Categories:")
            .split(',')
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        let concepts: Vec<String> = title
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .filter(|w| w.chars().count() >= 5)
            .take(3)
            .map(str::to_string)
            .collect();
        let triples: Vec<_> = concepts
            .windows(2)
            .map(|pair| json!({"subject": pair[0], "predicate": "related", "object": pair[1]}))
            .collect();

        json!({
            "summary": format!("Deterministic summary of \"{title}\"."),
            "key_points": [format!("{title} is analysed offline.")],
            "tags": categories,
            "key_concepts": concepts,
            "entities": [],
            "relation_triples": triples,
            "chapters": [{
                "title": "Overview",
                "explanation": format!("What \"{title}\" contributes."),
                "related_concepts": concepts,
            }],
        })
        .to_string()
    }
}

#[async_trait]
impl EnrichmentProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn complete_json(&self, request: &PromptRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some((_, failure)) = self
            .rules
            .iter()
            .find(|(needle, _)| request.prompt.contains(needle.as_str()))
        {
            return failure.produce(&self.name);
        }
        if let Some(failure) = self.script.lock().await.pop_front() {
            return failure.produce(&self.name);
        }
        Ok(Self::deterministic_response(&request.prompt))
    }
}
