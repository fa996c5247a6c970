//! Source connectors: turn upstream listings into [`CandidateRecord`]s.
//!
//! Each connector normalizes its upstream format into the common schema,
//! skipping (and counting) entries it cannot use and deduplicating by
//! external id. `discover` is safe to call again; the orchestrator wraps it
//! in [`discover_with_retry`].

pub mod huggingface;
pub mod payload;
pub mod static_list;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument};

use paperscope_core::{retry, Discovery, Error, Result, RetryPolicy, StageOutcome};

use crate::config::{SourceConfig, SourceKind};

pub use huggingface::{HuggingFaceConnector, HuggingFaceMode};
pub use static_list::StaticListConnector;

/// An upstream listing of trending papers.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_id(&self) -> &str;

    /// Fetch and normalize the current listing.
    async fn discover(&self) -> Result<Discovery>;
}

/// Instantiate the connector for a configured source.
pub fn build_connector(config: &SourceConfig, client: &reqwest::Client) -> Result<Arc<dyn SourceConnector>> {
    config.validate()?;
    Ok(match config.kind {
        SourceKind::HuggingfaceApi => Arc::new(HuggingFaceConnector::new(
            &config.source_id,
            HuggingFaceMode::Api,
            config.resolved_endpoint(),
            config.limit,
            client.clone(),
        )),
        SourceKind::HuggingfacePage => Arc::new(HuggingFaceConnector::new(
            &config.source_id,
            HuggingFaceMode::Page,
            config.resolved_endpoint(),
            config.limit,
            client.clone(),
        )),
        SourceKind::StaticFile => Arc::new(StaticListConnector::new(
            &config.source_id,
            config.resolved_endpoint(),
            config.limit,
        )),
    })
}

/// Run `discover` under a per-attempt timeout with bounded backoff.
#[instrument(skip(connector, policy), fields(subsystem = "jobs", component = "sources", op = "discover", source_id = %connector.source_id()))]
pub async fn discover_with_retry(
    connector: &dyn SourceConnector,
    policy: &RetryPolicy,
    attempt_timeout: Duration,
) -> Result<Discovery> {
    let discovery = retry(policy, "discover", |attempt| async move {
        let result = match tokio::time::timeout(attempt_timeout, connector.discover()).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransientIo(format!(
                "discovery of '{}' timed out after {}s (attempt {attempt})",
                connector.source_id(),
                attempt_timeout.as_secs_f64()
            ))),
        };
        StageOutcome::from_result(result)
    })
    .await?;

    info!(
        candidate_count = discovery.candidates.len(),
        skipped_count = discovery.skipped,
        "Discovery complete"
    );
    Ok(discovery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySource {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl SourceConnector for FlakySource {
        fn source_id(&self) -> &str {
            "flaky"
        }

        async fn discover(&self) -> Result<Discovery> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(Error::TransientIo("connection reset".into()))
            } else {
                Ok(Discovery::default())
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1)).with_jitter_ratio(0.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_recovers_after_transient_errors() {
        let source = FlakySource { calls: AtomicU32::new(0), fail_first: 2 };
        assert!(discover_with_retry(&source, &policy(), Duration::from_secs(5)).await.is_ok());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_gives_up_after_max_attempts() {
        let source = FlakySource { calls: AtomicU32::new(0), fail_first: u32::MAX };
        let err = discover_with_retry(&source, &policy(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_build_connector_rejects_invalid_config() {
        let config = SourceConfig {
            endpoint: "not a url".into(),
            ..SourceConfig::huggingface_api(5)
        };
        assert!(build_connector(&config, &reqwest::Client::new()).is_err());
    }
}
