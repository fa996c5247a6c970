//! # paperscope-jobs
//!
//! Ingestion runtime for paperscope.
//!
//! This crate provides:
//! - Source connectors for the Hugging Face daily papers feed and curated lists
//! - A content-addressed artifact store for downloaded documents
//! - The ingestion orchestrator with bounded stage pools and checkpointed resume
//! - A cron scheduler that triggers scheduled runs
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use paperscope_db::Database;
//! use paperscope_jobs::{IngestConfig, IngestOrchestrator};
//! use paperscope_core::{JobRequest, TriggerKind};
//!
//! let db = Database::connect("postgres://...", Default::default()).await?;
//! let orchestrator = IngestOrchestrator::builder(
//!     IngestConfig::from_env()?,
//!     Arc::new(db.graph.clone()),
//!     Arc::new(db.jobs.clone()),
//! )
//! .build()?;
//!
//! orchestrator.resume_unfinished().await?;
//! let job_id = orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await?;
//! ```

pub mod artifacts;
pub mod config;
pub mod events;
pub mod excerpt;
pub mod graph_writer;
pub mod locks;
pub mod orchestrator;
pub mod scheduler;
pub mod sources;

use std::time::Duration;

use paperscope_core::{defaults, Error, Result};

pub use artifacts::ArtifactStore;
pub use config::{
    load_sources, IngestConfig, OverlapPolicy, SchedulerConfig, SourceConfig, SourceKind,
    StagePools, StageTimeouts,
};
pub use events::IngestEvent;
pub use excerpt::ExcerptExtractor;
pub use graph_writer::GraphWriter;
pub use orchestrator::{IngestOrchestrator, OrchestratorBuilder, SourcePreview};
pub use scheduler::IngestScheduler;
pub use sources::{HuggingFaceConnector, HuggingFaceMode, SourceConnector, StaticListConnector};

/// Shared HTTP client for discovery and document downloads.
///
/// Per-request deadlines come from the stage timeouts; the client only
/// bounds connection setup.
pub fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(defaults::USER_AGENT)
        .connect_timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| Error::Config(format!("building HTTP client: {e}")))
}
