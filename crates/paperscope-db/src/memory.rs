//! In-memory graph and job stores.
//!
//! Used by tests and by `PAPERSCOPE_STORE=memory` for local runs. The graph
//! is an arena of nodes keyed by [`NodeKey`] plus an edge map keyed by
//! `(from, rel, to, relation)`; edges reference nodes only by key and record
//! the papers that assert them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use paperscope_core::{
    Checkpoint, CommitResult, Error, GraphEdge, GraphMutation, GraphNode, GraphStats, GraphStore,
    IngestionJob, JobStore, NodeKey, NodeLabel, PaperNeighborhood, PaperNetwork, RelType, Result,
};

type EdgeKey = (NodeKey, RelType, NodeKey, String);

struct StoredNode {
    properties: Map<String, JsonValue>,
    touched: u64,
}

struct StoredEdge {
    properties: Map<String, JsonValue>,
    asserted_by: BTreeSet<String>,
}

#[derive(Default)]
struct Arena {
    nodes: BTreeMap<NodeKey, StoredNode>,
    edges: BTreeMap<EdgeKey, StoredEdge>,
    clock: u64,
}

impl Arena {
    fn recent_papers(&self, limit: i64) -> Vec<GraphNode> {
        let mut papers: Vec<_> = self
            .nodes
            .iter()
            .filter(|(k, _)| k.label == NodeLabel::Paper)
            .collect();
        papers.sort_by(|a, b| b.1.touched.cmp(&a.1.touched).then(a.0.cmp(b.0)));
        papers
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(k, n)| GraphNode {
                key: k.clone(),
                properties: JsonValue::Object(n.properties.clone()),
            })
            .collect()
    }
}

fn graph_edge(key: &EdgeKey, stored: &StoredEdge) -> GraphEdge {
    GraphEdge {
        from: key.0.clone(),
        rel: key.1,
        to: key.2.clone(),
        relation: key.3.clone(),
        asserted_by: stored.asserted_by.iter().cloned().collect(),
    }
}

fn merged(existing: &Map<String, JsonValue>, update: &Map<String, JsonValue>) -> Map<String, JsonValue> {
    let mut out = existing.clone();
    for (k, v) in update {
        out.insert(k.clone(), v.clone());
    }
    out
}

/// In-memory [`GraphStore`].
#[derive(Default)]
pub struct MemoryGraphStore {
    arena: RwLock<Arena>,
    injected_conflicts: AtomicUsize,
    commits: RwLock<Vec<String>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `apply` fail with a conflict before touching the graph.
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Paper keys of every committed mutation, in commit order.
    pub async fn commits(&self) -> Vec<String> {
        self.commits.read().await.clone()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn apply(&self, mutation: &GraphMutation) -> Result<CommitResult> {
        let injected = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::GraphConflict(format!(
                "injected conflict for {}",
                mutation.paper_key
            )));
        }

        let mut guard = self.arena.write().await;
        let arena: &mut Arena = &mut guard;

        // Validate before writing anything so a rejected mutation leaves no trace.
        for edge in mutation.edges.iter().filter(|e| !e.require_existing) {
            for end in [&edge.from, &edge.to] {
                let known = arena.nodes.contains_key(end)
                    || mutation.nodes.iter().any(|n| &n.key == end);
                if !known {
                    return Err(Error::PermanentInput(format!(
                        "edge references a missing node: {end}"
                    )));
                }
            }
        }

        let mut result = CommitResult::default();
        arena.clock += 1;
        let now = arena.clock;

        for node in &mutation.nodes {
            match arena.nodes.get_mut(&node.key) {
                Some(stored) => {
                    let next = merged(&stored.properties, &node.properties);
                    if next != stored.properties {
                        stored.properties = next;
                        stored.touched = now;
                        result.nodes_updated += 1;
                    }
                }
                None => {
                    arena.nodes.insert(
                        node.key.clone(),
                        StoredNode {
                            properties: node.properties.clone(),
                            touched: now,
                        },
                    );
                    result.nodes_created += 1;
                }
            }
        }

        let mut asserted = BTreeSet::new();
        for edge in &mutation.edges {
            if edge.require_existing
                && !(arena.nodes.contains_key(&edge.from) && arena.nodes.contains_key(&edge.to))
            {
                debug!(from = %edge.from, to = %edge.to, "Dropping unresolved relation");
                result.relations_dropped += 1;
                continue;
            }
            let key = (
                edge.from.clone(),
                edge.rel,
                edge.to.clone(),
                edge.relation.clone(),
            );
            match arena.edges.get_mut(&key) {
                Some(stored) => {
                    let next = merged(&stored.properties, &edge.properties);
                    let newly_asserted = stored.asserted_by.insert(mutation.paper_key.clone());
                    if next != stored.properties || newly_asserted {
                        stored.properties = next;
                        result.edges_updated += 1;
                    }
                }
                None => {
                    arena.edges.insert(
                        key.clone(),
                        StoredEdge {
                            properties: edge.properties.clone(),
                            asserted_by: BTreeSet::from([mutation.paper_key.clone()]),
                        },
                    );
                    result.edges_created += 1;
                }
            }
            asserted.insert(key);
        }

        if mutation.prune_paper_edges {
            let retracted: Vec<EdgeKey> = arena
                .edges
                .iter()
                .filter(|(k, stored)| {
                    matches!(k.1, RelType::Mentions | RelType::RelatesTo)
                        && stored.asserted_by.contains(&mutation.paper_key)
                        && !asserted.contains(*k)
                })
                .map(|(k, _)| k.clone())
                .collect();
            for key in retracted {
                let orphaned = match arena.edges.get_mut(&key) {
                    Some(stored) => {
                        stored.asserted_by.remove(&mutation.paper_key);
                        stored.asserted_by.is_empty()
                    }
                    None => false,
                };
                if orphaned {
                    arena.edges.remove(&key);
                    result.edges_pruned += 1;
                } else {
                    result.edges_updated += 1;
                }
            }
        }

        self.commits.write().await.push(mutation.paper_key.clone());
        Ok(result)
    }

    async fn get_node(&self, key: &NodeKey) -> Result<Option<GraphNode>> {
        let arena = self.arena.read().await;
        Ok(arena.nodes.get(key).map(|n| GraphNode {
            key: key.clone(),
            properties: JsonValue::Object(n.properties.clone()),
        }))
    }

    async fn recent_papers(&self, limit: i64) -> Result<Vec<GraphNode>> {
        Ok(self.arena.read().await.recent_papers(limit))
    }

    async fn paper_neighborhood(&self, paper_key: &str) -> Result<Option<PaperNeighborhood>> {
        let arena = self.arena.read().await;
        let center = NodeKey::paper(paper_key);
        let Some(stored) = arena.nodes.get(&center) else {
            return Ok(None);
        };

        let mut edges = Vec::new();
        let mut neighbors = BTreeMap::new();
        for (key, stored) in &arena.edges {
            let (from, _, to, _) = key;
            let other = if *from == center {
                to
            } else if *to == center {
                from
            } else {
                continue;
            };
            edges.push(graph_edge(key, stored));
            if let Some(node) = arena.nodes.get(other) {
                neighbors.insert(other.clone(), JsonValue::Object(node.properties.clone()));
            }
        }

        Ok(Some(PaperNeighborhood {
            paper: GraphNode {
                key: center.clone(),
                properties: JsonValue::Object(stored.properties.clone()),
            },
            nodes: neighbors
                .into_iter()
                .map(|(key, properties)| GraphNode { key, properties })
                .collect(),
            edges,
        }))
    }

    async fn paper_network(&self, limit: i64) -> Result<PaperNetwork> {
        let arena = self.arena.read().await;
        let papers = arena.recent_papers(limit);
        let included: BTreeSet<&NodeKey> = papers.iter().map(|p| &p.key).collect();
        let mut mentions = Vec::new();
        let mut concepts = BTreeMap::new();
        for (key, stored) in &arena.edges {
            if key.1 != RelType::Mentions || !included.contains(&key.0) {
                continue;
            }
            mentions.push(graph_edge(key, stored));
            if let Some(node) = arena.nodes.get(&key.2) {
                concepts.insert(key.2.clone(), JsonValue::Object(node.properties.clone()));
            }
        }
        let concepts = concepts
            .into_iter()
            .map(|(key, properties)| GraphNode { key, properties })
            .collect();
        Ok(PaperNetwork::assemble(papers, mentions, concepts))
    }

    async fn stats(&self) -> Result<GraphStats> {
        let arena = self.arena.read().await;
        let mut stats = GraphStats::default();
        for key in arena.nodes.keys() {
            *stats.nodes.entry(key.label.as_str().to_string()).or_default() += 1;
        }
        for (_, rel, _, _) in arena.edges.keys() {
            *stats.edges.entry(rel.as_str().to_string()).or_default() += 1;
        }
        Ok(stats)
    }
}

/// In-memory [`JobStore`].
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, IngestionJob>>,
    checkpoints: RwLock<HashMap<Uuid, Checkpoint>>,
    checkpoint_writes: AtomicUsize,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save_checkpoint` calls so far.
    pub fn checkpoint_writes(&self) -> usize {
        self.checkpoint_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: &IngestionJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(Error::Internal(format!("job {} already exists", job.job_id)));
        }
        jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &IngestionJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let existing = jobs
            .get_mut(&job.job_id)
            .ok_or_else(|| Error::NotFound(format!("job {}", job.job_id)))?;
        if existing.status.is_terminal() {
            return Err(Error::Internal(format!(
                "job {} is {} and can no longer change",
                job.job_id,
                existing.status.as_str()
            )));
        }
        *existing = job.clone();
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<IngestionJob>> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<IngestionJob>> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<_> = jobs.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.job_id.cmp(&a.job_id)));
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }

    async fn list_unfinished(&self) -> Result<Vec<IngestionJob>> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<_> = jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));
        Ok(list)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoint_writes.fetch_add(1, Ordering::SeqCst);
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.job_id, checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(&job_id).cloned())
    }
}
