//! # paperscope-core
//!
//! Core types, traits, and abstractions for the paperscope ingestion pipeline.
//!
//! This crate holds the data model shared by every stage (candidates,
//! artifacts, enrichment results, graph mutations, jobs, checkpoints), the
//! error taxonomy, explicit stage outcomes with bounded backoff, and the
//! natural-key normalization that makes graph writes idempotent.

pub mod defaults;
pub mod error;
pub mod models;
pub mod mutation;
pub mod normalize;
pub mod retry;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use mutation::build_mutation;
pub use normalize::{normalize_author, normalize_concept, paper_key};
pub use retry::{retry, RetryPolicy, StageOutcome};
pub use traits::*;

/// New time-ordered identifier.
pub fn new_v7() -> uuid::Uuid {
    uuid::Uuid::now_v7()
}
