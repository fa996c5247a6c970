//! Centralized default constants for the paperscope pipeline.
//!
//! Configuration loaders fall back to these values when the corresponding
//! environment variable is unset or unparsable.

// =============================================================================
// SOURCES
// =============================================================================

/// Source id of the built-in Hugging Face daily papers connector.
pub const HF_SOURCE_ID: &str = "huggingface";

/// Hugging Face daily papers JSON API.
pub const HF_DAILY_PAPERS_API: &str = "https://huggingface.co/api/daily_papers";

/// Hugging Face trending papers page.
pub const HF_PAPERS_PAGE: &str = "https://huggingface.co/papers";

/// Maximum candidates taken from one source per job.
pub const INGEST_LIMIT: usize = 20;

/// User agent sent to trend sources and document servers.
pub const USER_AGENT: &str = "PaperScopeBot/1.0 (+https://github.com/paperscope/paperscope)";

/// Fallback PDF location for arXiv-hosted papers.
pub const ARXIV_PDF_BASE: &str = "https://arxiv.org/pdf";

// =============================================================================
// STORAGE
// =============================================================================

/// Root directory for downloaded documents and manifests.
pub const STORAGE_ROOT: &str = "./data/papers";

/// File name of the stored document inside a paper directory.
pub const DOCUMENT_FILE: &str = "document.pdf";

/// File name of the manifest inside a paper directory.
pub const MANIFEST_FILE: &str = "manifest.json";

// =============================================================================
// RETRY / BACKOFF
// =============================================================================

/// Attempts per retried operation (discovery, fetch, provider call).
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay of the exponential backoff curve in milliseconds.
pub const RETRY_BASE_MS: u64 = 1_000;

/// Upper bound of any single backoff delay in milliseconds.
pub const RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Jitter added to each delay, as a fraction of the exponential step.
pub const RETRY_JITTER_RATIO: f64 = 0.25;

// =============================================================================
// WORKER POOLS
// =============================================================================

pub const FETCH_WORKERS: usize = 4;
pub const ENRICH_WORKERS: usize = 2;
pub const GRAPH_WORKERS: usize = 4;


/// Capacity of the orchestrator event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// TIMEOUTS
// =============================================================================

pub const DISCOVERY_TIMEOUT_SECS: u64 = 30;
pub const FETCH_TIMEOUT_SECS: u64 = 120;
pub const ENRICH_TIMEOUT_SECS: u64 = 300;
pub const GRAPH_TIMEOUT_SECS: u64 = 30;

/// Advisory job deadline; no new candidates start after it passes.
pub const JOB_TIMEOUT_SECS: u64 = 3_600;

/// Timeout for the `pdftotext` subprocess.
pub const EXCERPT_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// ENRICHMENT
// =============================================================================

pub const OLLAMA_URL: &str = "http://localhost:11434";
pub const OLLAMA_MODEL: &str = "llama3.1";
pub const OPENAI_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_MODEL: &str = "gpt-4o-mini";

/// Pages of the PDF fed to the prompt.
pub const EXCERPT_MAX_PAGES: u32 = 12;

/// Characters of extracted text fed to the prompt.
pub const EXCERPT_MAX_CHARS: usize = 20_000;

/// Sampling temperature for structured extraction.
pub const ENRICH_TEMPERATURE: f32 = 0.2;

/// Caps applied to provider output before it reaches the graph.
pub const MAX_CONCEPTS: usize = 24;
pub const MAX_RELATIONS: usize = 32;
pub const MAX_TAGS: usize = 12;
pub const MAX_CHAPTERS: usize = 16;
pub const MAX_CHAPTER_CONCEPTS: usize = 8;

// =============================================================================
// GRAPH
// =============================================================================

/// Predicate used when a relation triple has none.
pub const DEFAULT_RELATION: &str = "related";

/// Default page size for graph read queries.
pub const PAGE_LIMIT: i64 = 50;

/// Upper bound on papers returned by the paper network view.
pub const NETWORK_MAX_LIMIT: i64 = 200;

// =============================================================================
// SCHEDULER
// =============================================================================

/// Daily at 03:00.
pub const CRON: &str = "0 3 * * *";
pub const TIMEZONE: &str = "UTC";

// =============================================================================
// SERVER
// =============================================================================

pub const SERVER_HOST: &str = "0.0.0.0";
pub const SERVER_PORT: u16 = 3000;

/// Request body limit for the trigger API.
pub const MAX_BODY_BYTES: usize = 64 * 1024;
