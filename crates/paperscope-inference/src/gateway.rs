//! Primary/fallback enrichment gateway.
//!
//! Each provider call runs under a timeout. Transient failures and rate
//! limits back off (honoring `Retry-After`) up to the retry policy; a
//! structurally invalid response is retried once immediately and then counts
//! as the provider being unusable. When the primary is unusable the optional
//! fallback gets the same treatment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use paperscope_core::{EnrichmentResult, Error, Result, RetryPolicy};

use crate::parse::parse_enrichment;
use crate::prompt::{build_prompt, EnrichmentInput};
use crate::provider::{Capability, EnrichmentProvider, ProviderSettings};

pub struct EnrichmentGateway {
    primary: Arc<dyn EnrichmentProvider>,
    fallback: Option<Arc<dyn EnrichmentProvider>>,
    retry: RetryPolicy,
    call_timeout: Duration,
    capabilities: Vec<Capability>,
}

impl EnrichmentGateway {
    pub fn new(primary: Arc<dyn EnrichmentProvider>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            primary,
            fallback: None,
            retry,
            call_timeout,
            capabilities: Capability::ALL.to_vec(),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn EnrichmentProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Restrict the requested capabilities (defaults to all of them).
    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    /// Build providers from settings. Invalid settings are a configuration error.
    pub fn from_settings(
        primary: &ProviderSettings,
        fallback: Option<&ProviderSettings>,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Result<Self> {
        let mut gateway = Self::new(primary.build(call_timeout)?, retry, call_timeout);
        if let Some(settings) = fallback {
            gateway = gateway.with_fallback(settings.build(call_timeout)?);
        }
        Ok(gateway)
    }

    pub fn primary_label(&self) -> String {
        self.primary.label()
    }

    pub fn fallback_label(&self) -> Option<String> {
        self.fallback.as_ref().map(|f| f.label())
    }

    /// Enrich one paper, falling back to the secondary provider when the
    /// primary signals unavailability.
    #[instrument(skip(self, input), fields(subsystem = "inference", component = "gateway", op = "enrich", paper_key = %input.candidate.paper_key()))]
    pub async fn enrich(&self, input: &EnrichmentInput<'_>) -> Result<EnrichmentResult> {
        let primary_err = match self.run_provider(self.primary.as_ref(), input).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !triggers_fallback(&primary_err) {
            return Err(primary_err);
        }

        let Some(fallback) = self.fallback.as_ref() else {
            return Err(Error::ProviderUnavailable(format!(
                "{}: {primary_err}",
                self.primary.label()
            )));
        };

        warn!(
            primary = %self.primary.label(),
            fallback = %fallback.label(),
            error = %primary_err,
            "Primary provider unavailable, using fallback"
        );
        match self.run_provider(fallback.as_ref(), input).await {
            Ok(result) => Ok(result),
            Err(fallback_err) => Err(Error::ProviderUnavailable(format!(
                "{}: {primary_err}; {}: {fallback_err}",
                self.primary.label(),
                fallback.label()
            ))),
        }
    }

    async fn run_provider(
        &self,
        provider: &dyn EnrichmentProvider,
        input: &EnrichmentInput<'_>,
    ) -> Result<EnrichmentResult> {
        let label = provider.label();
        let capabilities: Vec<Capability> = self
            .capabilities
            .iter()
            .copied()
            .filter(|c| provider.capabilities().contains(c))
            .collect();
        if capabilities.is_empty() {
            return Err(Error::ProviderUnavailable(format!(
                "{label} supports none of the requested capabilities"
            )));
        }

        let request = build_prompt(input, &capabilities);
        let paper_key = input.candidate.paper_key();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        let mut reformat_used = false;

        loop {
            let start = Instant::now();
            let outcome = match tokio::time::timeout(self.call_timeout, provider.complete_json(&request)).await {
                Err(_) => Err(Error::TransientIo(format!(
                    "{label} timed out after {}s",
                    self.call_timeout.as_secs_f64()
                ))),
                Ok(response) => response
                    .and_then(|raw| parse_enrichment(&raw, &paper_key, &label, &capabilities)),
            };

            match outcome {
                Ok(result) => {
                    info!(
                        provider = %label,
                        attempt,
                        duration_ms = start.elapsed().as_millis() as u64,
                        concepts = result.key_concepts.len(),
                        relations = result.relation_triples.len(),
                        "Enrichment complete"
                    );
                    return Ok(result);
                }
                Err(Error::Serialization(msg)) if !reformat_used => {
                    reformat_used = true;
                    warn!(provider = %label, error = %msg, "Invalid structured output, retrying once");
                }
                Err(Error::Serialization(msg)) => {
                    return Err(Error::ProviderUnavailable(format!(
                        "{label} returned invalid structured output twice: {msg}"
                    )));
                }
                Err(e) if e.is_retryable() => {
                    if attempt >= max_attempts {
                        return Err(Error::RetriesExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.retry.delay_after(attempt, &e);
                    warn!(
                        provider = %label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Provider call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(provider = %label, error = %e, "Provider call failed permanently");
                    return Err(e);
                }
            }
        }
    }
}

/// Anything except a rejected request means the provider itself is unusable.
fn triggers_fallback(error: &Error) -> bool {
    !matches!(error, Error::PermanentInput(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockFailure, MockProvider};
    use chrono::Utc;
    use paperscope_core::{ArtifactRef, CandidateRecord};
    use std::path::PathBuf;

    fn fixtures() -> (CandidateRecord, ArtifactRef) {
        let candidate = CandidateRecord {
            source_id: "huggingface".into(),
            external_id: "2401.00001".into(),
            title: "Scaling Sparse Experts".into(),
            authors: vec!["A. Smith".into()],
            abstract_text: "We scale experts.".into(),
            categories: vec![],
            document_url: "https://arxiv.org/pdf/2401.00001.pdf".into(),
            published_at: None,
            discovered_at: Utc::now(),
        };
        let artifact = ArtifactRef {
            paper_key: candidate.paper_key(),
            storage_path: PathBuf::from("/tmp/document.pdf"),
            checksum: "blake3:00".into(),
            byte_size: 1,
            document_url: candidate.document_url.clone(),
            fetched_at: Utc::now(),
            fetch_attempts: 1,
        };
        (candidate, artifact)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100)).with_jitter_ratio(0.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_success() {
        let (candidate, artifact) = fixtures();
        let primary = Arc::new(MockProvider::new());
        let gateway = EnrichmentGateway::new(primary.clone(), policy(), Duration::from_secs(5));
        let input = EnrichmentInput { candidate: &candidate, artifact: &artifact, excerpt: None };
        let result = gateway.enrich(&input).await.unwrap();
        assert_eq!(result.provider, "mock:deterministic");
        assert_eq!(result.paper_key, "huggingface:2401.00001");
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honors_hint_then_succeeds() {
        let (candidate, artifact) = fixtures();
        let primary = Arc::new(
            MockProvider::new().then_fail(MockFailure::RateLimited(Some(Duration::from_secs(7)))),
        );
        let gateway = EnrichmentGateway::new(primary.clone(), policy(), Duration::from_secs(5));
        let input = EnrichmentInput { candidate: &candidate, artifact: &artifact, excerpt: None };

        let start = tokio::time::Instant::now();
        gateway.enrich(&input).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_retried_once_then_fallback() {
        let (candidate, artifact) = fixtures();
        let primary = Arc::new(
            MockProvider::new()
                .then_fail(MockFailure::Malformed)
                .then_fail(MockFailure::Malformed),
        );
        let fallback = Arc::new(MockProvider::new().named("backup"));
        let gateway = EnrichmentGateway::new(primary.clone(), policy(), Duration::from_secs(5))
            .with_fallback(fallback.clone());
        let input = EnrichmentInput { candidate: &candidate, artifact: &artifact, excerpt: None };

        let result = gateway.enrich(&input).await.unwrap();
        assert_eq!(primary.calls(), 2);
        assert_eq!(fallback.calls(), 1);
        assert_eq!(result.provider, "backup:deterministic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_once_recovers_on_same_provider() {
        let (candidate, artifact) = fixtures();
        let primary = Arc::new(MockProvider::new().then_fail(MockFailure::Malformed));
        let gateway = EnrichmentGateway::new(primary.clone(), policy(), Duration::from_secs(5));
        let input = EnrichmentInput { candidate: &candidate, artifact: &artifact, excerpt: None };
        assert!(gateway.enrich(&input).await.is_ok());
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_exhausted_is_provider_unavailable() {
        let (candidate, artifact) = fixtures();
        let primary = Arc::new(MockProvider::new().fail_when("Title:", MockFailure::Transient));
        let fallback = Arc::new(
            MockProvider::new()
                .named("backup")
                .fail_when("Title:", MockFailure::Unavailable),
        );
        let gateway = EnrichmentGateway::new(primary.clone(), policy(), Duration::from_secs(5))
            .with_fallback(fallback.clone());
        let input = EnrichmentInput { candidate: &candidate, artifact: &artifact, excerpt: None };

        let err = gateway.enrich(&input).await.unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable(_)));
        assert_eq!(primary.calls(), 3);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let (candidate, artifact) = fixtures();
        let primary = Arc::new(MockProvider::new().with_latency(Duration::from_secs(60)));
        let gateway = EnrichmentGateway::new(primary.clone(), RetryPolicy::new(2, Duration::from_millis(10)), Duration::from_secs(1));
        let input = EnrichmentInput { candidate: &candidate, artifact: &artifact, excerpt: None };

        let err = gateway.enrich(&input).await.unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable(_)));
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_input_does_not_fall_back() {
        let (candidate, artifact) = fixtures();
        let primary = Arc::new(MockProvider::new().then_fail(MockFailure::Permanent));
        let fallback = Arc::new(MockProvider::new().named("backup"));
        let gateway = EnrichmentGateway::new(primary, policy(), Duration::from_secs(5))
            .with_fallback(fallback.clone());
        let input = EnrichmentInput { candidate: &candidate, artifact: &artifact, excerpt: None };

        assert!(matches!(gateway.enrich(&input).await, Err(Error::PermanentInput(_))));
        assert_eq!(fallback.calls(), 0);
    }
}
