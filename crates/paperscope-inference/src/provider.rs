//! Enrichment provider abstraction and configuration-driven selection.
//!
//! A provider turns a prompt into a raw JSON document. Which provider runs
//! is decided by [`ProviderSettings`], a tagged variant built from the
//! environment:
//!
//! ```text
//! PAPERSCOPE_PROVIDER=ollama            → local Ollama server
//! PAPERSCOPE_PROVIDER=openai            → OpenAI-compatible chat completions
//! PAPERSCOPE_PROVIDER=mock              → deterministic offline provider
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use paperscope_core::{defaults, Error, Result};

use crate::mock::MockProvider;
use crate::ollama::OllamaProvider;
use crate::openai::OpenAiProvider;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Semantic operations a provider can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Summarize,
    ExtractEntities,
    ExtractRelations,
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::Summarize,
        Capability::ExtractEntities,
        Capability::ExtractRelations,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Summarize => write!(f, "summarize"),
            Self::ExtractEntities => write!(f, "extract_entities"),
            Self::ExtractRelations => write!(f, "extract_relations"),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// A system + user prompt pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    pub system: String,
    pub prompt: String,
}

/// A language-model backend able to produce structured JSON.
///
/// Implementations map upstream failures onto the pipeline taxonomy:
/// rate limits become [`Error::RateLimited`] (with the `Retry-After` hint
/// when present), timeouts and 5xx become [`Error::TransientIo`], and other
/// client errors are permanent.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Provider family, e.g. `"ollama"`.
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    /// Run the prompt and return the raw structured output.
    async fn complete_json(&self, request: &PromptRequest) -> Result<String>;

    /// `name:model`, recorded on every enrichment result.
    fn label(&self) -> String {
        format!("{}:{}", self.name(), self.model())
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Map a non-success HTTP response onto the error taxonomy.
pub(crate) fn status_error(provider: &str, status: u16, headers: &HeaderMap, body: &str) -> Error {
    let context = format!("{provider} returned {status}: {}", truncate(body, 200));
    match status {
        429 => Error::RateLimited {
            message: context,
            retry_after: retry_after(headers),
        },
        401 | 403 => Error::ProviderUnavailable(context),
        _ => Error::from_status(status, context),
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Provider selection, one variant per backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderSettings {
    Ollama {
        base_url: String,
        model: String,
    },
    OpenAi {
        base_url: String,
        model: String,
        #[serde(skip_serializing)]
        api_key: Option<String>,
    },
    Mock,
}

impl ProviderSettings {
    /// Read the settings for a provider kind from the environment.
    pub fn from_env(kind: &str) -> Result<Self> {
        let var = |name: &str, default: &str| std::env::var(name).unwrap_or_else(|_| default.to_string());
        match kind.trim().to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama {
                base_url: var("PAPERSCOPE_OLLAMA_URL", defaults::OLLAMA_URL),
                model: var("PAPERSCOPE_OLLAMA_MODEL", defaults::OLLAMA_MODEL),
            }),
            "openai" => Ok(Self::OpenAi {
                base_url: var("PAPERSCOPE_OPENAI_URL", defaults::OPENAI_URL),
                model: var("PAPERSCOPE_OPENAI_MODEL", defaults::OPENAI_MODEL),
                api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            }),
            "mock" => Ok(Self::Mock),
            other => Err(Error::Config(format!(
                "unknown enrichment provider '{other}' (expected ollama, openai, or mock)"
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ollama { .. } => "ollama",
            Self::OpenAi { .. } => "openai",
            Self::Mock => "mock",
        }
    }

    /// Reject settings that could never work.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Ollama { base_url, model } => {
                require_url(base_url)?;
                require_non_empty("ollama model", model)
            }
            Self::OpenAi {
                base_url,
                model,
                api_key,
            } => {
                require_url(base_url)?;
                require_non_empty("openai model", model)?;
                if api_key.is_none() {
                    return Err(Error::Config(
                        "OPENAI_API_KEY must be set when the openai provider is selected".into(),
                    ));
                }
                Ok(())
            }
            Self::Mock => Ok(()),
        }
    }

    /// Instantiate the provider.
    pub fn build(&self, timeout: Duration) -> Result<Arc<dyn EnrichmentProvider>> {
        self.validate()?;
        Ok(match self {
            Self::Ollama { base_url, model } => {
                Arc::new(OllamaProvider::new(base_url, model, timeout)?)
            }
            Self::OpenAi {
                base_url,
                model,
                api_key,
            } => Arc::new(OpenAiProvider::new(
                base_url,
                model,
                api_key.as_deref().unwrap_or_default(),
                timeout,
            )?),
            Self::Mock => Arc::new(MockProvider::new()),
        })
    }
}

fn require_url(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(Error::Config(format!("provider URL must be http(s): '{url}'")))
    }
}

fn require_non_empty(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::Config(format!("{what} must not be empty")))
    } else {
        Ok(())
    }
}
