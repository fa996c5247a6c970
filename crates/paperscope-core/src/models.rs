//! Core data models for the ingestion pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::normalize::paper_key;

// =============================================================================
// DISCOVERY
// =============================================================================

/// A publication produced by a source connector, not yet fetched or enriched.
///
/// Uniquely identified by `(source_id, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source_id: String,
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub document_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

impl CandidateRecord {
    /// Stable key used across storage, checkpoints, and the graph.
    pub fn paper_key(&self) -> String {
        paper_key(&self.source_id, &self.external_id)
    }

    /// Year bucket used by the storage layout.
    pub fn storage_year(&self) -> i32 {
        use chrono::Datelike;
        self.published_at.unwrap_or(self.discovered_at).year()
    }
}

/// Result of one `discover` call: the candidates plus the number of
/// upstream entries that were malformed or duplicated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Discovery {
    pub candidates: Vec<CandidateRecord>,
    pub skipped: usize,
}

impl Discovery {
    /// Consume the batch lazily.
    pub fn into_iter_candidates(self) -> impl Iterator<Item = CandidateRecord> {
        self.candidates.into_iter()
    }
}

// =============================================================================
// ARTIFACTS
// =============================================================================

/// A downloaded document persisted in the content-addressed store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub paper_key: String,
    pub storage_path: PathBuf,
    /// Content hash in `algorithm:hex` form.
    pub checksum: String,
    pub byte_size: u64,
    pub document_url: String,
    pub fetched_at: DateTime<Utc>,
    pub fetch_attempts: u32,
}

// =============================================================================
// ENRICHMENT
// =============================================================================

/// A named entity extracted from a paper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// A `(subject, predicate, object)` assertion extracted from a paper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTriple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// Graph concept referenced by a chapter explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterConcept {
    pub label: String,
    /// Node type hint from the provider (`Concept`, `Paper`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
}

/// Explanation of one section of a paper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub explanation: String,
    #[serde(default)]
    pub related_concepts: Vec<ChapterConcept>,
}

/// Structured insights produced by an enrichment provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub paper_key: String,
    /// `provider:model` that produced this result.
    pub provider: String,
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub key_concepts: Vec<String>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relation_triples: Vec<RelationTriple>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Section-by-section explanations, in paper order.
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    pub generated_at: DateTime<Utc>,
}

/// Contents of `manifest.json` stored next to each document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub candidate: CandidateRecord,
    pub artifact: ArtifactRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<EnrichmentResult>,
}

// =============================================================================
// GRAPH
// =============================================================================

/// Node labels of the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeLabel {
    Paper,
    Author,
    Concept,
}

impl NodeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::Paper => "Paper",
            NodeLabel::Author => "Author",
            NodeLabel::Concept => "Concept",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Paper" => Some(NodeLabel::Paper),
            "Author" => Some(NodeLabel::Author),
            "Concept" => Some(NodeLabel::Concept),
            _ => None,
        }
    }
}

/// Relationship types of the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelType {
    #[serde(rename = "AUTHORED_BY")]
    AuthoredBy,
    #[serde(rename = "MENTIONS")]
    Mentions,
    #[serde(rename = "RELATES_TO")]
    RelatesTo,
}

impl RelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelType::AuthoredBy => "AUTHORED_BY",
            RelType::Mentions => "MENTIONS",
            RelType::RelatesTo => "RELATES_TO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AUTHORED_BY" => Some(RelType::AuthoredBy),
            "MENTIONS" => Some(RelType::Mentions),
            "RELATES_TO" => Some(RelType::RelatesTo),
            _ => None,
        }
    }
}

/// Natural key of a graph node: label plus normalized identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub label: NodeLabel,
    pub key: String,
}

impl NodeKey {
    pub fn paper(paper_key: impl Into<String>) -> Self {
        Self {
            label: NodeLabel::Paper,
            key: paper_key.into(),
        }
    }

    pub fn author(normalized_name: impl Into<String>) -> Self {
        Self {
            label: NodeLabel::Author,
            key: normalized_name.into(),
        }
    }

    pub fn concept(normalized_label: impl Into<String>) -> Self {
        Self {
            label: NodeLabel::Concept,
            key: normalized_label.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.label.as_str(), self.key)
    }
}

/// Merge a node by natural key, setting the given properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpsert {
    pub key: NodeKey,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// Merge an edge keyed by `(from, rel, to, relation)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeUpsert {
    pub from: NodeKey,
    pub rel: RelType,
    pub to: NodeKey,
    /// Qualifier for RELATES_TO edges (the triple predicate); empty otherwise.
    #[serde(default)]
    pub relation: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// When set, the edge is dropped unless both endpoints exist after the
    /// node merges of the same mutation.
    #[serde(default)]
    pub require_existing: bool,
}

/// Ordered node and edge upserts for one candidate.
///
/// Nodes are always applied before edges.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphMutation {
    pub paper_key: String,
    pub nodes: Vec<NodeUpsert>,
    pub edges: Vec<EdgeUpsert>,
    /// Withdraw `paper_key` from every MENTIONS and RELATES_TO edge it asserted
    /// earlier but this mutation no longer asserts. Edges left without any
    /// asserting paper are removed, so a superseding enrichment replaces the
    /// old one without touching edges other papers still assert.
    #[serde(default)]
    pub prune_paper_edges: bool,
}

/// Counts reported by a committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitResult {
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub edges_created: usize,
    pub edges_updated: usize,
    pub edges_pruned: usize,
    pub relations_dropped: usize,
}

/// A node as read back from the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub key: NodeKey,
    pub properties: serde_json::Value,
}

/// An edge as read back from the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: NodeKey,
    pub rel: RelType,
    pub to: NodeKey,
    pub relation: String,
    /// Paper keys whose mutations assert this edge, sorted.
    #[serde(default)]
    pub asserted_by: Vec<String>,
}

/// A paper and the nodes one hop away from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperNeighborhood {
    pub paper: GraphNode,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Two papers that mention at least one common concept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConcepts {
    pub papers: [String; 2],
    /// Concept keys, sorted.
    pub shared_concepts: Vec<String>,
    pub weight: usize,
}

/// Recent papers, the concepts they mention, and which papers overlap.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PaperNetwork {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub shared: Vec<SharedConcepts>,
}

impl PaperNetwork {
    /// Build the view from papers, their MENTIONS edges and concept nodes.
    ///
    /// Edges whose paper is not among `papers` are ignored. Pairs are ordered
    /// by weight, then by paper keys.
    pub fn assemble(papers: Vec<GraphNode>, mentions: Vec<GraphEdge>, concepts: Vec<GraphNode>) -> Self {
        let included: std::collections::BTreeSet<&str> =
            papers.iter().map(|p| p.key.key.as_str()).collect();
        let edges: Vec<GraphEdge> = mentions
            .into_iter()
            .filter(|e| e.rel == RelType::Mentions && included.contains(e.from.key.as_str()))
            .collect();

        let mut by_concept: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in &edges {
            by_concept
                .entry(edge.to.key.as_str())
                .or_default()
                .push(edge.from.key.as_str());
        }
        let mut pairs: BTreeMap<(&str, &str), Vec<String>> = BTreeMap::new();
        for (concept, mut mentioned_by) in by_concept {
            mentioned_by.sort_unstable();
            mentioned_by.dedup();
            for (i, a) in mentioned_by.iter().enumerate() {
                for b in &mentioned_by[i + 1..] {
                    pairs.entry((*a, *b)).or_default().push(concept.to_string());
                }
            }
        }
        let mut shared: Vec<SharedConcepts> = pairs
            .into_iter()
            .map(|((a, b), shared_concepts)| SharedConcepts {
                papers: [a.to_string(), b.to_string()],
                weight: shared_concepts.len(),
                shared_concepts,
            })
            .collect();
        shared.sort_by(|x, y| y.weight.cmp(&x.weight).then_with(|| x.papers.cmp(&y.papers)));

        let referenced: std::collections::BTreeSet<&str> =
            edges.iter().map(|e| e.to.key.as_str()).collect();
        let mut nodes = papers;
        nodes.extend(
            concepts
                .into_iter()
                .filter(|c| c.key.label == NodeLabel::Concept && referenced.contains(c.key.key.as_str())),
        );
        Self { nodes, edges, shared }
    }
}

/// Node and edge counts grouped by label and type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: BTreeMap<String, i64>,
    pub edges: BTreeMap<String, i64>,
}

impl GraphStats {
    pub fn node_count(&self) -> i64 {
        self.nodes.values().sum()
    }

    pub fn edge_count(&self) -> i64 {
        self.edges.values().sum()
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// What started an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TriggerKind::Scheduled),
            "manual" => Some(TriggerKind::Manual),
            _ => None,
        }
    }
}

/// Status of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    PartialSuccess,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::PartialSuccess => "partial_success",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "partial_success" => Some(JobStatus::PartialSuccess),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal jobs are immutable history.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// Coarse progress marker of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Discovering,
    Processing,
    Finished,
}

/// Per-candidate pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStage {
    Discovered,
    Fetching,
    Fetched,
    FetchFailed,
    Enriching,
    Enriched,
    EnrichFailed,
    GraphWriting,
    GraphWritten,
    GraphWriteFailed,
}

/// The next unit of work for a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStep {
    Fetch,
    Enrich,
    GraphWrite,
}

impl CandidateStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStage::Discovered => "discovered",
            CandidateStage::Fetching => "fetching",
            CandidateStage::Fetched => "fetched",
            CandidateStage::FetchFailed => "fetch_failed",
            CandidateStage::Enriching => "enriching",
            CandidateStage::Enriched => "enriched",
            CandidateStage::EnrichFailed => "enrich_failed",
            CandidateStage::GraphWriting => "graph_writing",
            CandidateStage::GraphWritten => "graph_written",
            CandidateStage::GraphWriteFailed => "graph_write_failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            CandidateStage::FetchFailed
                | CandidateStage::EnrichFailed
                | CandidateStage::GraphWriteFailed
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_failed() || *self == CandidateStage::GraphWritten
    }

    /// Whether this state marks a finished stage (the states that get checkpointed).
    pub fn is_stage_boundary(&self) -> bool {
        matches!(
            self,
            CandidateStage::Fetched | CandidateStage::Enriched
        ) || self.is_terminal()
    }

    /// Legal forward transitions of the candidate state machine.
    pub fn can_transition_to(&self, next: CandidateStage) -> bool {
        use CandidateStage::*;
        matches!(
            (self, next),
            (Discovered, Fetching)
                | (Fetching, Fetched)
                | (Fetching, FetchFailed)
                | (Fetched, Enriching)
                | (Enriching, Enriched)
                | (Enriching, EnrichFailed)
                | (Enriched, GraphWriting)
                | (GraphWriting, GraphWritten)
                | (GraphWriting, GraphWriteFailed)
        )
    }

    /// State to restart from after a process restart. Stages that were in
    /// flight fall back to the last completed boundary.
    pub fn resume_point(&self) -> CandidateStage {
        match self {
            CandidateStage::Fetching => CandidateStage::Discovered,
            CandidateStage::Enriching => CandidateStage::Fetched,
            CandidateStage::GraphWriting => CandidateStage::Enriched,
            other => *other,
        }
    }

    /// Work that remains to be done from this state, if any.
    pub fn next_step(&self) -> Option<StageStep> {
        match self.resume_point() {
            CandidateStage::Discovered => Some(StageStep::Fetch),
            CandidateStage::Fetched => Some(StageStep::Enrich),
            CandidateStage::Enriched => Some(StageStep::GraphWrite),
            _ => None,
        }
    }
}

/// Why a candidate failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Error class (see `Error::class`).
    pub class: String,
    pub message: String,
}

impl From<&crate::Error> for FailureReason {
    fn from(e: &crate::Error) -> Self {
        Self {
            class: e.class().to_string(),
            message: e.to_string(),
        }
    }
}

/// Per-candidate record inside a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateOutcome {
    pub paper_key: String,
    pub candidate: CandidateRecord,
    pub stage: CandidateStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CandidateOutcome {
    pub fn discovered(candidate: CandidateRecord) -> Self {
        Self {
            paper_key: candidate.paper_key(),
            candidate,
            stage: CandidateStage::Discovered,
            error: None,
            storage_path: None,
            provider: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn advance(&mut self, next: CandidateStage) -> crate::Result<()> {
        if !self.stage.can_transition_to(next) {
            return Err(crate::Error::Internal(format!(
                "illegal candidate transition {} -> {} for {}",
                self.stage.as_str(),
                next.as_str(),
                self.paper_key
            )));
        }
        self.stage = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a failure state together with its reason.
    pub fn fail(&mut self, next: CandidateStage, reason: FailureReason) -> crate::Result<()> {
        self.advance(next)?;
        self.error = Some(reason);
        Ok(())
    }
}

/// Discovery outcome of one source within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub discovered: usize,
    pub skipped: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parameters of a trigger.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobRequest {
    /// Restrict discovery to these source ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_filter: Option<Vec<String>>,
    /// Only keep candidates published (or discovered) at or after this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Re-run only the failed candidates of this earlier job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_job: Option<Uuid>,
}

impl JobRequest {
    pub fn includes_source(&self, source_id: &str) -> bool {
        match &self.source_filter {
            Some(filter) => filter.iter().any(|s| s == source_id),
            None => true,
        }
    }

    pub fn admits(&self, candidate: &CandidateRecord) -> bool {
        if !self.includes_source(&candidate.source_id) {
            return false;
        }
        match self.since {
            Some(since) => candidate.published_at.unwrap_or(candidate.discovered_at) >= since,
            None => true,
        }
    }
}

/// An ingestion run created by a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: Uuid,
    pub trigger_kind: TriggerKind,
    #[serde(default)]
    pub request: JobRequest,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub stage: JobStage,
    pub status: JobStatus,
    #[serde(default)]
    pub sources: Vec<SourceReport>,
    #[serde(default)]
    pub outcomes: Vec<CandidateOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestionJob {
    pub fn new(trigger_kind: TriggerKind, request: JobRequest) -> Self {
        Self {
            job_id: crate::new_v7(),
            trigger_kind,
            request,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stage: JobStage::Queued,
            status: JobStatus::Pending,
            sources: Vec::new(),
            outcomes: Vec::new(),
            checkpoint_cursor: None,
            error: None,
        }
    }

    /// Whether discovery already ran (or was replaced by a retry list).
    pub fn discovery_done(&self) -> bool {
        !matches!(self.stage, JobStage::Queued | JobStage::Discovering)
    }

    /// Fold a checkpoint into the outcome list.
    pub fn apply_checkpoint(&mut self, checkpoint: &Checkpoint) {
        for outcome in &mut self.outcomes {
            if let Some(stage) = checkpoint.stage_progress.get(&outcome.paper_key) {
                outcome.stage = *stage;
            }
            outcome.stage = outcome.stage.resume_point();
        }
        self.checkpoint_cursor = checkpoint.last_completed_candidate_key.clone();
    }

    /// Final status from the per-candidate and per-source results.
    ///
    /// `Failed` requires every configured source to have failed discovery.
    /// Once discovery succeeded anywhere, the job completes only if every
    /// candidate reached `GraphWritten`, otherwise it is a partial success.
    pub fn resolve_status(&self) -> JobStatus {
        if !self.sources.is_empty() && self.sources.iter().all(|s| s.error.is_some()) {
            return JobStatus::Failed;
        }
        let all_written = self
            .outcomes
            .iter()
            .all(|o| o.stage == CandidateStage::GraphWritten);
        if all_written && self.sources.iter().all(|s| s.error.is_none()) {
            JobStatus::Completed
        } else {
            JobStatus::PartialSuccess
        }
    }

    /// Succeeded / failed-with-reason breakdown.
    pub fn summary(&self) -> JobSummary {
        let mut summary = JobSummary {
            total: self.outcomes.len(),
            ..JobSummary::default()
        };
        for outcome in &self.outcomes {
            if outcome.stage == CandidateStage::GraphWritten {
                summary.succeeded += 1;
            } else if outcome.stage.is_failed() {
                summary.failed.push(FailedCandidate {
                    paper_key: outcome.paper_key.clone(),
                    stage: outcome.stage,
                    reason: outcome.error.clone(),
                });
            } else {
                summary.pending += 1;
            }
        }
        summary
    }

    /// Candidates that did not reach `GraphWritten`.
    pub fn failed_candidates(&self) -> Vec<CandidateRecord> {
        self.outcomes
            .iter()
            .filter(|o| o.stage != CandidateStage::GraphWritten)
            .map(|o| o.candidate.clone())
            .collect()
    }
}

/// A candidate that ended in a failed sub-state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCandidate {
    pub paper_key: String,
    pub stage: CandidateStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

/// Per-candidate outcome summary reported by the status API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Candidates not yet in a terminal state.
    pub pending: usize,
    pub failed: Vec<FailedCandidate>,
}

/// Durable per-candidate progress of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_candidate_key: Option<String>,
    /// Last completed stage per paper key.
    #[serde(default)]
    pub stage_progress: BTreeMap<String, CandidateStage>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            last_completed_candidate_key: None,
            stage_progress: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Record that `paper_key` finished a stage.
    pub fn record(&mut self, paper_key: &str, stage: CandidateStage) {
        self.stage_progress.insert(paper_key.to_string(), stage);
        if stage.is_terminal() {
            self.last_completed_candidate_key = Some(paper_key.to_string());
        }
        self.updated_at = Utc::now();
    }
}
