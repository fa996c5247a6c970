//! Storage abstractions shared by the pipeline crates.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    Checkpoint, CommitResult, GraphMutation, GraphNode, GraphStats, IngestionJob, NodeKey,
    PaperNeighborhood, PaperNetwork,
};
use crate::Result;

/// Knowledge graph persistence with merge-by-natural-key semantics.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Apply one candidate's mutation atomically.
    ///
    /// Nodes are merged before edges. Re-applying an identical mutation
    /// leaves the graph unchanged. Edges marked `require_existing` whose
    /// endpoints do not exist are dropped and counted. Lost races surface as
    /// [`crate::Error::GraphConflict`] with nothing written.
    async fn apply(&self, mutation: &GraphMutation) -> Result<CommitResult>;

    async fn get_node(&self, key: &NodeKey) -> Result<Option<GraphNode>>;

    /// Most recently merged papers first.
    async fn recent_papers(&self, limit: i64) -> Result<Vec<GraphNode>>;

    /// The paper and everything one hop away from it.
    async fn paper_neighborhood(&self, paper_key: &str) -> Result<Option<PaperNeighborhood>>;

    /// The `limit` most recent papers and the concepts they share.
    async fn paper_network(&self, limit: i64) -> Result<PaperNetwork>;

    async fn stats(&self) -> Result<GraphStats>;
}

/// Durable job records and checkpoints.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &IngestionJob) -> Result<()>;

    /// Replace a job record. Jobs already in a terminal state are immutable
    /// and updating them is an error.
    async fn update_job(&self, job: &IngestionJob) -> Result<()>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<IngestionJob>>;

    /// Newest first.
    async fn list_jobs(&self, limit: i64) -> Result<Vec<IngestionJob>>;

    /// Pending and running jobs, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<IngestionJob>>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>>;

    /// Make every saved record durable. Called on shutdown.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
