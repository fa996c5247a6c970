//! Pipeline configuration.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PAPERSCOPE_STORAGE_ROOT` | `./data/papers` | Artifact storage root |
//! | `PAPERSCOPE_SOURCES_FILE` | unset | YAML source list; defaults to the Hugging Face daily papers API |
//! | `PAPERSCOPE_INGEST_LIMIT` | `20` | Max candidates per source per job |
//! | `PAPERSCOPE_PROVIDER` | `ollama` | Primary enrichment provider |
//! | `PAPERSCOPE_FALLBACK_PROVIDER` | unset | Secondary provider |
//! | `PAPERSCOPE_{FETCH,ENRICH,GRAPH}_WORKERS` | `4`, `2`, `4` | Stage pool sizes |
//! | `PAPERSCOPE_{FETCH,ENRICH,DISCOVERY}_MAX_ATTEMPTS` | `3` | Attempts per stage call |
//! | `PAPERSCOPE_RETRY_BASE_MS` | `1000` | Backoff base delay |
//! | `PAPERSCOPE_{FETCH,ENRICH,GRAPH}_TIMEOUT_SECS` | `120`, `300`, `30` | Stage call timeouts |
//! | `PAPERSCOPE_JOB_TIMEOUT_SECS` | `3600` | Advisory job deadline |
//! | `PAPERSCOPE_OVERLAP_POLICY` | `queue` | `queue` or `reject` |
//! | `PAPERSCOPE_CRON` | `0 3 * * *` | Scheduled trigger |
//! | `PAPERSCOPE_TIMEZONE` | `UTC` | IANA timezone name such as `Europe/Berlin` |
//! | `PAPERSCOPE_SCHEDULER_ENABLED` | `true` | Enable the scheduled trigger |

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use paperscope_core::{defaults, Error, Result, RetryPolicy};
use paperscope_inference::ProviderSettings;

/// How a source is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Hugging Face `daily_papers` JSON API.
    HuggingfaceApi,
    /// Hugging Face trending page, payload taken from embedded props.
    HuggingfacePage,
    /// Curated JSON list on disk.
    StaticFile,
}

fn default_limit() -> usize {
    defaults::INGEST_LIMIT
}

fn default_enabled() -> bool {
    true
}

/// One configured upstream listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: SourceKind,
    /// URL for HTTP sources, file path for `static_file`. Hugging Face
    /// sources default to the public endpoints when unset.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl SourceConfig {
    pub fn huggingface_api(limit: usize) -> Self {
        Self {
            source_id: defaults::HF_SOURCE_ID.to_string(),
            kind: SourceKind::HuggingfaceApi,
            endpoint: defaults::HF_DAILY_PAPERS_API.to_string(),
            limit,
            enabled: true,
        }
    }

    pub fn resolved_endpoint(&self) -> &str {
        match (self.kind, self.endpoint.trim().is_empty()) {
            (SourceKind::HuggingfaceApi, true) => defaults::HF_DAILY_PAPERS_API,
            (SourceKind::HuggingfacePage, true) => defaults::HF_PAPERS_PAGE,
            _ => self.endpoint.trim(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() || self.source_id.contains(':') {
            return Err(Error::Config(format!(
                "invalid source id '{}': must be non-empty and must not contain ':'",
                self.source_id
            )));
        }
        if self.limit == 0 {
            return Err(Error::Config(format!("source '{}' has limit 0", self.source_id)));
        }
        match self.kind {
            SourceKind::HuggingfaceApi | SourceKind::HuggingfacePage => {
                let endpoint = self.resolved_endpoint();
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    return Err(Error::Config(format!(
                        "source '{}' endpoint must be an http(s) URL",
                        self.source_id
                    )));
                }
            }
            SourceKind::StaticFile => {
                if self.endpoint.trim().is_empty() {
                    return Err(Error::Config(format!("source '{}' needs a file path", self.source_id)));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    sources: Vec<SourceConfig>,
}

/// Load a YAML source list:
///
/// ```yaml
/// sources:
///   - source_id: huggingface
///     kind: huggingface_api
///     endpoint: https://huggingface.co/api/daily_papers
///     limit: 20
/// ```
pub fn load_sources(path: &Path) -> Result<Vec<SourceConfig>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
    let file: SourcesFile = serde_yaml::from_str(&text)
        .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
    Ok(file.sources)
}

/// What to do when a trigger overlaps a running job for the same source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Accept and run after the in-flight job releases the source.
    Queue,
    /// Refuse with `AlreadyRunning`.
    Reject,
}

impl FromStr for OverlapPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" => Ok(Self::Reject),
            other => Err(Error::Config(format!(
                "unknown overlap policy '{other}' (expected queue or reject)"
            ))),
        }
    }
}

/// Concurrency limit of each stage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePools {
    pub fetch: usize,
    pub enrich: usize,
    pub graph: usize,
}

impl Default for StagePools {
    fn default() -> Self {
        Self {
            fetch: defaults::FETCH_WORKERS,
            enrich: defaults::ENRICH_WORKERS,
            graph: defaults::GRAPH_WORKERS,
        }
    }
}

/// Per-stage call timeouts plus the advisory job deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub discovery: Duration,
    pub fetch: Duration,
    pub enrich: Duration,
    pub graph: Duration,
    /// Only prevents new candidates from starting.
    pub job: Duration,
    pub excerpt: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            discovery: Duration::from_secs(defaults::DISCOVERY_TIMEOUT_SECS),
            fetch: Duration::from_secs(defaults::FETCH_TIMEOUT_SECS),
            enrich: Duration::from_secs(defaults::ENRICH_TIMEOUT_SECS),
            graph: Duration::from_secs(defaults::GRAPH_TIMEOUT_SECS),
            job: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
            excerpt: Duration::from_secs(defaults::EXCERPT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub cron: String,
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: defaults::CRON.to_string(),
            timezone: defaults::TIMEZONE.to_string(),
        }
    }
}

/// Everything the orchestrator needs to run a job.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub storage_root: PathBuf,
    pub sources: Vec<SourceConfig>,
    pub provider: ProviderSettings,
    pub fallback_provider: Option<ProviderSettings>,
    pub pools: StagePools,
    pub timeouts: StageTimeouts,
    pub discovery_retry: RetryPolicy,
    pub fetch_retry: RetryPolicy,
    pub enrich_retry: RetryPolicy,
    pub overlap_policy: OverlapPolicy,
    pub scheduler: SchedulerConfig,
    /// Extract a text excerpt from each PDF before enrichment.
    pub extract_excerpts: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(defaults::STORAGE_ROOT),
            sources: vec![SourceConfig::huggingface_api(defaults::INGEST_LIMIT)],
            provider: ProviderSettings::Ollama {
                base_url: defaults::OLLAMA_URL.to_string(),
                model: defaults::OLLAMA_MODEL.to_string(),
            },
            fallback_provider: None,
            pools: StagePools::default(),
            timeouts: StageTimeouts::default(),
            discovery_retry: RetryPolicy::default(),
            fetch_retry: RetryPolicy::default(),
            enrich_retry: RetryPolicy::default(),
            overlap_policy: OverlapPolicy::Queue,
            scheduler: SchedulerConfig::default(),
            extract_excerpts: true,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(name).unwrap_or(default))
}

impl IngestConfig {
    /// Build the configuration from environment variables (see module docs).
    pub fn from_env() -> Result<Self> {
        let limit = env_parse::<usize>("PAPERSCOPE_INGEST_LIMIT").unwrap_or(defaults::INGEST_LIMIT);
        let sources = match std::env::var("PAPERSCOPE_SOURCES_FILE") {
            Ok(path) if !path.trim().is_empty() => load_sources(Path::new(path.trim()))?,
            _ => vec![SourceConfig::huggingface_api(limit)],
        };

        let provider_kind = std::env::var("PAPERSCOPE_PROVIDER").unwrap_or_else(|_| "ollama".to_string());
        let provider = ProviderSettings::from_env(&provider_kind)?;
        let fallback_provider = match std::env::var("PAPERSCOPE_FALLBACK_PROVIDER") {
            Ok(kind) if !kind.trim().is_empty() => Some(ProviderSettings::from_env(&kind)?),
            _ => None,
        };

        let base_delay = Duration::from_millis(
            env_parse("PAPERSCOPE_RETRY_BASE_MS").unwrap_or(defaults::RETRY_BASE_MS),
        );
        let policy = |var: &str| {
            RetryPolicy::new(env_parse(var).unwrap_or(defaults::MAX_ATTEMPTS), base_delay)
        };

        let overlap_policy = match std::env::var("PAPERSCOPE_OVERLAP_POLICY") {
            Ok(v) if !v.trim().is_empty() => v.parse()?,
            _ => OverlapPolicy::Queue,
        };

        Ok(Self {
            storage_root: std::env::var("PAPERSCOPE_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(defaults::STORAGE_ROOT)),
            sources,
            provider,
            fallback_provider,
            pools: StagePools {
                fetch: env_parse("PAPERSCOPE_FETCH_WORKERS").unwrap_or(defaults::FETCH_WORKERS),
                enrich: env_parse("PAPERSCOPE_ENRICH_WORKERS").unwrap_or(defaults::ENRICH_WORKERS),
                graph: env_parse("PAPERSCOPE_GRAPH_WORKERS").unwrap_or(defaults::GRAPH_WORKERS),
            },
            timeouts: StageTimeouts {
                fetch: env_secs("PAPERSCOPE_FETCH_TIMEOUT_SECS", defaults::FETCH_TIMEOUT_SECS),
                enrich: env_secs("PAPERSCOPE_ENRICH_TIMEOUT_SECS", defaults::ENRICH_TIMEOUT_SECS),
                graph: env_secs("PAPERSCOPE_GRAPH_TIMEOUT_SECS", defaults::GRAPH_TIMEOUT_SECS),
                job: env_secs("PAPERSCOPE_JOB_TIMEOUT_SECS", defaults::JOB_TIMEOUT_SECS),
                ..StageTimeouts::default()
            },
            discovery_retry: policy("PAPERSCOPE_DISCOVERY_MAX_ATTEMPTS"),
            fetch_retry: policy("PAPERSCOPE_FETCH_MAX_ATTEMPTS"),
            enrich_retry: policy("PAPERSCOPE_ENRICH_MAX_ATTEMPTS"),
            overlap_policy,
            scheduler: SchedulerConfig {
                enabled: std::env::var("PAPERSCOPE_SCHEDULER_ENABLED")
                    .map(|v| v != "false" && v != "0")
                    .unwrap_or(true),
                cron: std::env::var("PAPERSCOPE_CRON").unwrap_or_else(|_| defaults::CRON.to_string()),
                timezone: std::env::var("PAPERSCOPE_TIMEZONE")
                    .unwrap_or_else(|_| defaults::TIMEZONE.to_string()),
            },
            extract_excerpts: true,
        })
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    pub fn with_sources(mut self, sources: Vec<SourceConfig>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_provider(mut self, provider: ProviderSettings) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_fallback_provider(mut self, provider: ProviderSettings) -> Self {
        self.fallback_provider = Some(provider);
        self
    }

    pub fn with_pools(mut self, pools: StagePools) -> Self {
        self.pools = pools;
        self
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Use the same policy for discovery, fetch and enrichment.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.discovery_retry = policy.clone();
        self.fetch_retry = policy.clone();
        self.enrich_retry = policy;
        self
    }

    pub fn with_overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = policy;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_excerpts(mut self, enabled: bool) -> Self {
        self.extract_excerpts = enabled;
        self
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Reject configurations that cannot run a job.
    pub fn validate(&self) -> Result<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(Error::Config("storage root must not be empty".into()));
        }
        if self.enabled_sources().next().is_none() {
            return Err(Error::Config("no enabled sources configured".into()));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.source_id.as_str()) {
                return Err(Error::Config(format!("duplicate source id '{}'", source.source_id)));
            }
        }
        if self.pools.fetch == 0 || self.pools.enrich == 0 || self.pools.graph == 0 {
            return Err(Error::Config("stage pool sizes must be at least 1".into()));
        }
        self.provider.validate()?;
        if let Some(fallback) = &self.fallback_provider {
            fallback.validate()?;
        }
        Ok(())
    }
}
