//! # paperscope-inference
//!
//! Enrichment provider gateway for paperscope.
//!
//! This crate provides:
//! - The [`EnrichmentProvider`] trait over language-model backends
//! - Ollama and OpenAI-compatible implementations
//! - A deterministic mock provider for offline runs and tests
//! - Prompt construction and structured-output validation
//! - [`EnrichmentGateway`], which adds timeouts, backoff and fallback
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use paperscope_core::RetryPolicy;
//! use paperscope_inference::{EnrichmentGateway, ProviderSettings};
//!
//! let primary = ProviderSettings::from_env("ollama").unwrap();
//! let gateway = EnrichmentGateway::from_settings(
//!     &primary,
//!     None,
//!     RetryPolicy::default(),
//!     Duration::from_secs(300),
//! )
//! .unwrap();
//! ```

pub mod gateway;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod parse;
pub mod prompt;
pub mod provider;

pub use gateway::EnrichmentGateway;
pub use mock::{MockFailure, MockProvider};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use parse::parse_enrichment;
pub use prompt::{build_prompt, EnrichmentInput};
pub use provider::{Capability, EnrichmentProvider, PromptRequest, ProviderSettings};
