//! Graph writes with a transaction timeout and a single conflict retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use paperscope_core::{CommitResult, Error, GraphMutation, GraphStore, Result};

pub struct GraphWriter {
    store: Arc<dyn GraphStore>,
    timeout: Duration,
}

impl GraphWriter {
    pub fn new(store: Arc<dyn GraphStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Apply one candidate's mutation. A [`Error::GraphConflict`] is retried
    /// once in a fresh transaction; a second conflict is surfaced.
    #[instrument(skip(self, mutation), fields(subsystem = "jobs", component = "graph_writer", op = "write", paper_key = %mutation.paper_key))]
    pub async fn write(&self, mutation: &GraphMutation) -> Result<CommitResult> {
        let start = Instant::now();
        let result = match self.attempt(mutation).await {
            Err(Error::GraphConflict(msg)) => {
                warn!(error = %msg, "Graph conflict, retrying with a fresh transaction");
                self.attempt(mutation).await
            }
            other => other,
        }?;

        info!(
            nodes_created = result.nodes_created,
            nodes_updated = result.nodes_updated,
            edges_created = result.edges_created,
            edges_updated = result.edges_updated,
            edges_pruned = result.edges_pruned,
            relations_dropped = result.relations_dropped,
            duration_ms = start.elapsed().as_millis() as u64,
            "Graph mutation committed"
        );
        Ok(result)
    }

    async fn attempt(&self, mutation: &GraphMutation) -> Result<CommitResult> {
        tokio::time::timeout(self.timeout, self.store.apply(mutation))
            .await
            .map_err(|_| {
                Error::TransientIo(format!(
                    "graph transaction timed out after {}s",
                    self.timeout.as_secs_f64()
                ))
            })?
    }
}
