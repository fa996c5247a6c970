//! Ingestion orchestrator.
//!
//! A trigger creates an [`IngestionJob`] and spawns it onto a task tracker.
//! The job first takes the per-source locks (sorted, so two jobs can never
//! deadlock), which serializes overlapping jobs for the same source. It then
//! runs discovery, and drives every candidate through
//! fetch → enrich → graph-write on three bounded stage pools.
//!
//! After each stage boundary the checkpoint and job record are persisted
//! before the candidate moves on, so a restarted process resumes from the
//! last boundary instead of redoing finished work. Cancellation stops
//! in-flight fetches and provider calls and prevents new starts, but a graph
//! write that has begun always runs to completion.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use paperscope_core::{
    build_mutation, defaults, ArtifactManifest, ArtifactRef, CandidateOutcome, CandidateRecord, CandidateStage,
    Checkpoint, EnrichmentResult, Error, FailureReason, GraphNode, GraphStore, IngestionJob, JobRequest,
    JobStage, JobStatus, JobStore, NodeKey, Result, SourceReport, StageStep, TriggerKind,
};
use paperscope_inference::{EnrichmentGateway, EnrichmentInput};

use crate::artifacts::ArtifactStore;
use crate::config::{IngestConfig, OverlapPolicy};
use crate::events::IngestEvent;
use crate::excerpt::ExcerptExtractor;
use crate::graph_writer::GraphWriter;
use crate::locks::KeyedLocks;
use crate::sources::{build_connector, discover_with_retry, SourceConnector};

/// Discovery-only result for one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourcePreview {
    pub source_id: String,
    pub candidates: Vec<CandidateRecord>,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bookkeeping for a queued or running job.
struct InFlight {
    sources: Vec<String>,
    cancel: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
}

/// Mutable state of a running job, shared by its candidate tasks.
struct RunState {
    job: IngestionJob,
    checkpoint: Checkpoint,
}

struct JobRun {
    job_id: Uuid,
    state: Mutex<RunState>,
    cancel: CancellationToken,
    deadline: Instant,
}

struct Inner {
    config: IngestConfig,
    connectors: BTreeMap<String, Arc<dyn SourceConnector>>,
    artifacts: ArtifactStore,
    excerpts: ExcerptExtractor,
    /// `None` when the provider settings are invalid; jobs then fail at trigger.
    gateway: Option<EnrichmentGateway>,
    graph: GraphWriter,
    jobs: Arc<dyn JobStore>,
    source_locks: KeyedLocks,
    in_flight: RwLock<HashMap<Uuid, InFlight>>,
    fetch_pool: Semaphore,
    enrich_pool: Semaphore,
    graph_pool: Semaphore,
    events: broadcast::Sender<IngestEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Builder for [`IngestOrchestrator`].
pub struct OrchestratorBuilder {
    config: IngestConfig,
    graph: Arc<dyn GraphStore>,
    jobs: Arc<dyn JobStore>,
    gateway: Option<EnrichmentGateway>,
    connectors: Vec<Arc<dyn SourceConnector>>,
    client: Option<reqwest::Client>,
}

impl OrchestratorBuilder {
    /// Use this gateway instead of building one from the provider settings.
    pub fn gateway(mut self, gateway: EnrichmentGateway) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Register a connector, replacing any configured source with the same id.
    pub fn connector(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Configuration errors in sources or provider settings do not fail the
    /// build; every job triggered with them is recorded as `Failed`.
    pub fn build(self) -> Result<IngestOrchestrator> {
        let config = self.config;
        let client = match self.client {
            Some(client) => client,
            None => crate::build_http_client()?,
        };

        let mut connectors: BTreeMap<String, Arc<dyn SourceConnector>> = BTreeMap::new();
        for source in config.enabled_sources() {
            match build_connector(source, &client) {
                Ok(connector) => {
                    connectors.insert(source.source_id.clone(), connector);
                }
                Err(Error::Config(msg)) => {
                    warn!(subsystem = "jobs", source_id = %source.source_id, error = %msg, "Source is misconfigured");
                }
                Err(e) => return Err(e),
            }
        }
        for connector in self.connectors {
            connectors.insert(connector.source_id().to_string(), connector);
        }

        let gateway = match self.gateway {
            Some(gateway) => Some(gateway),
            None => match EnrichmentGateway::from_settings(
                &config.provider,
                config.fallback_provider.as_ref(),
                config.enrich_retry.clone(),
                config.timeouts.enrich,
            ) {
                Ok(gateway) => Some(gateway),
                Err(Error::Config(msg)) => {
                    warn!(subsystem = "jobs", error = %msg, "Enrichment provider is misconfigured");
                    None
                }
                Err(e) => return Err(e),
            },
        };

        let artifacts = ArtifactStore::new(
            config.storage_root.clone(),
            client,
            config.fetch_retry.clone(),
            config.timeouts.fetch,
        );
        let excerpts = ExcerptExtractor::new(config.extract_excerpts, config.timeouts.excerpt);
        let graph = GraphWriter::new(self.graph, config.timeouts.graph);
        let (events, _) = broadcast::channel(defaults::EVENT_CHANNEL_CAPACITY);

        info!(
            subsystem = "jobs",
            component = "orchestrator",
            sources = connectors.len(),
            primary = gateway.as_ref().map(|g| g.primary_label()).as_deref().unwrap_or("unconfigured"),
            fallback = gateway.as_ref().and_then(|g| g.fallback_label()).as_deref().unwrap_or("none"),
            fetch_workers = config.pools.fetch,
            enrich_workers = config.pools.enrich,
            graph_workers = config.pools.graph,
            "Ingestion orchestrator ready"
        );

        Ok(IngestOrchestrator {
            inner: Arc::new(Inner {
                fetch_pool: Semaphore::new(config.pools.fetch.max(1)),
                enrich_pool: Semaphore::new(config.pools.enrich.max(1)),
                graph_pool: Semaphore::new(config.pools.graph.max(1)),
                config,
                connectors,
                artifacts,
                excerpts,
                gateway,
                graph,
                jobs: self.jobs,
                source_locks: KeyedLocks::new(),
                in_flight: RwLock::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }
}

/// Long-lived ingestion worker. Cheap to clone.
#[derive(Clone)]
pub struct IngestOrchestrator {
    inner: Arc<Inner>,
}

impl IngestOrchestrator {
    pub fn builder(
        config: IngestConfig,
        graph: Arc<dyn GraphStore>,
        jobs: Arc<dyn JobStore>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            graph,
            jobs,
            gateway: None,
            connectors: Vec::new(),
            client: None,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.inner.config
    }

    pub fn graph_store(&self) -> &Arc<dyn GraphStore> {
        self.inner.graph.store()
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.inner.artifacts
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.inner.connectors.keys().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.inner.events.subscribe()
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<IngestionJob>> {
        self.inner.jobs.get_job(job_id).await
    }

    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<IngestionJob>> {
        self.inner.jobs.list_jobs(limit).await
    }

    /// Whether the job is queued or running in this process.
    pub async fn is_in_flight(&self, job_id: Uuid) -> bool {
        self.inner.in_flight.read().await.contains_key(&job_id)
    }

    /// Create a job and start it in the background.
    ///
    /// Configuration errors are recorded as a `Failed` job without any
    /// candidate work. With [`OverlapPolicy::Reject`] a trigger that overlaps
    /// an in-flight job for the same source fails with `AlreadyRunning`.
    #[instrument(skip(self, request), fields(subsystem = "jobs", component = "orchestrator", op = "trigger", trigger_kind = kind.as_str()))]
    pub async fn trigger(&self, kind: TriggerKind, request: JobRequest) -> Result<Uuid> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Cancelled("orchestrator is shutting down".into()));
        }

        let mut job = IngestionJob::new(kind, request);
        let job_id = job.job_id;

        let sources = match self.inner.plan_sources(&job.request).await {
            Ok(sources) => sources,
            Err(Error::Config(msg)) => {
                warn!(%job_id, error = %msg, "Job rejected by configuration");
                job.status = JobStatus::Failed;
                job.stage = JobStage::Finished;
                job.error = Some(format!("configuration error: {msg}"));
                job.finished_at = Some(Utc::now());
                self.inner.jobs.insert_job(&job).await?;
                self.inner.emit(IngestEvent::JobFinished {
                    job_id,
                    status: JobStatus::Failed,
                });
                return Ok(job_id);
            }
            Err(e) => return Err(e),
        };

        // Reserve the sources first; the store write happens outside the lock.
        let flight = {
            let mut in_flight = self.inner.in_flight.write().await;
            if self.inner.config.overlap_policy == OverlapPolicy::Reject {
                let busy = sources
                    .iter()
                    .find(|s| in_flight.values().any(|f| f.sources.contains(s)));
                if let Some(source) = busy {
                    return Err(Error::AlreadyRunning(format!(
                        "a job for source '{source}' is already in flight"
                    )));
                }
            }
            let flight = FlightHandle::new(&self.inner.shutdown);
            in_flight.insert(job_id, flight.register(sources.clone()));
            flight
        };
        if let Err(e) = self.inner.jobs.insert_job(&job).await {
            self.inner.in_flight.write().await.remove(&job_id);
            return Err(e);
        }

        info!(%job_id, sources = ?sources, "Job queued");
        self.inner.emit(IngestEvent::JobQueued {
            job_id,
            trigger_kind: kind,
        });
        self.spawn(job, sources, flight);
        Ok(job_id)
    }

    /// Request cancellation. Returns `false` when the job already finished.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        if let Some(flight) = self.inner.in_flight.read().await.get(&job_id) {
            info!(subsystem = "jobs", component = "orchestrator", %job_id, "Cancellation requested");
            flight.cancel_requested.store(true, Ordering::SeqCst);
            flight.cancel.cancel();
            return Ok(true);
        }
        match self.inner.jobs.get_job(job_id).await? {
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("job {job_id}"))),
        }
    }

    /// Run discovery only, without fetching anything.
    pub async fn preview(&self, source_id: Option<&str>) -> Result<Vec<SourcePreview>> {
        let selected: Vec<(&String, &Arc<dyn SourceConnector>)> = match source_id {
            Some(id) => {
                let entry = self
                    .inner
                    .connectors
                    .get_key_value(id)
                    .ok_or_else(|| Error::NotFound(format!("source '{id}'")))?;
                vec![entry]
            }
            None => self.inner.connectors.iter().collect(),
        };

        let config = &self.inner.config;
        let previews = join_all(selected.into_iter().map(|(id, connector)| async move {
            match discover_with_retry(connector.as_ref(), &config.discovery_retry, config.timeouts.discovery).await {
                Ok(discovery) => SourcePreview {
                    source_id: id.clone(),
                    skipped: discovery.skipped,
                    candidates: discovery.candidates,
                    error: None,
                },
                Err(e) => SourcePreview {
                    source_id: id.clone(),
                    candidates: Vec::new(),
                    skipped: 0,
                    error: Some(e.to_string()),
                },
            }
        }))
        .await;
        Ok(previews)
    }

    /// Path of a merged paper's stored document.
    pub async fn paper_document(&self, paper_key: &str) -> Result<PathBuf> {
        let node = self
            .graph_store()
            .get_node(&NodeKey::paper(paper_key))
            .await?
            .ok_or_else(|| Error::NotFound(format!("paper {paper_key}")))?;
        let path = node
            .properties
            .get("storage_path")
            .and_then(|v| v.as_str())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| Error::NotFound(format!("no document stored for paper {paper_key}")))?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(Error::NotFound(format!("document for paper {paper_key} is missing")));
        }
        Ok(path)
    }

    /// Enrich a stored paper again and supersede its graph entry.
    ///
    /// Runs on the enrich and graph pools like a job candidate. Concepts and
    /// relations the new enrichment no longer asserts are pruned.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "orchestrator", op = "regenerate"))]
    pub async fn regenerate(&self, paper_key: &str) -> Result<GraphNode> {
        let inner = &self.inner;
        let document = self.paper_document(paper_key).await?;
        let manifest = inner
            .artifacts
            .manifest_beside(&document)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no manifest stored for paper {paper_key}")))?;
        if !inner.artifacts.verify(&manifest.artifact).await {
            return Err(Error::PermanentInput(format!(
                "stored document for paper {paper_key} does not match its checksum"
            )));
        }
        let gateway = inner
            .gateway
            .as_ref()
            .ok_or_else(|| Error::ProviderUnavailable("enrichment provider is not configured".into()))?;
        let ArtifactManifest { candidate, artifact, .. } = manifest;

        let enriched = {
            let _permit = inner
                .enrich_pool
                .acquire()
                .await
                .map_err(|_| Error::Cancelled("orchestrator is shutting down".into()))?;
            let excerpt = inner.excerpts.extract(&artifact.storage_path).await;
            let input = EnrichmentInput {
                candidate: &candidate,
                artifact: &artifact,
                excerpt: excerpt.as_deref(),
            };
            gateway.enrich(&input).await?
        };
        inner.artifacts.record_enrichment(&candidate, &artifact, &enriched).await?;

        let commit = {
            let _permit = inner
                .graph_pool
                .acquire()
                .await
                .map_err(|_| Error::Cancelled("orchestrator is shutting down".into()))?;
            inner.graph.write(&build_mutation(&candidate, &artifact, &enriched)).await?
        };
        info!(
            paper_key,
            provider = %enriched.provider,
            chapters = enriched.chapters.len(),
            edges_pruned = commit.edges_pruned,
            "Paper enrichment regenerated"
        );

        self.graph_store()
            .get_node(&NodeKey::paper(paper_key))
            .await?
            .ok_or_else(|| Error::NotFound(format!("paper {paper_key}")))
    }

    /// Reload pending and running jobs and continue them from their checkpoints.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "orchestrator", op = "resume"))]
    pub async fn resume_unfinished(&self) -> Result<usize> {
        let unfinished = self.inner.jobs.list_unfinished().await?;
        let mut resumed = 0;

        for mut job in unfinished {
            let job_id = job.job_id;
            if self.is_in_flight(job_id).await {
                continue;
            }

            match self.inner.jobs.load_checkpoint(job_id).await? {
                Some(checkpoint) => job.apply_checkpoint(&checkpoint),
                None => {
                    for outcome in &mut job.outcomes {
                        outcome.stage = outcome.stage.resume_point();
                    }
                }
            }

            let sources = if job.discovery_done() {
                let ids: BTreeSet<String> = job.outcomes.iter().map(|o| o.candidate.source_id.clone()).collect();
                ids.into_iter().collect()
            } else {
                match self.inner.plan_sources(&job.request).await {
                    Ok(sources) => sources,
                    Err(e) => {
                        warn!(%job_id, error = %e, "Cannot resume job");
                        job.status = JobStatus::Failed;
                        job.stage = JobStage::Finished;
                        job.error = Some(e.to_string());
                        job.finished_at = Some(Utc::now());
                        self.inner.persist(&job).await;
                        continue;
                    }
                }
            };

            let done = job.outcomes.iter().filter(|o| o.stage.is_terminal()).count();
            info!(%job_id, done, total = job.outcomes.len(), cursor = ?job.checkpoint_cursor, "Resuming job");

            let flight = FlightHandle::new(&self.inner.shutdown);
            self.inner
                .in_flight
                .write()
                .await
                .insert(job_id, flight.register(sources.clone()));
            self.spawn(job, sources, flight);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Stop all jobs, wait up to `grace` for in-flight work, and flush the job store.
    ///
    /// Interrupted jobs stay `Pending`/`Running` with their checkpoints so
    /// [`Self::resume_unfinished`] can continue them after a restart.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        info!(subsystem = "jobs", component = "orchestrator", "Shutting down orchestrator");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Jobs still running after shutdown grace period");
        }
        self.inner.jobs.flush().await
    }

    fn spawn(&self, job: IngestionJob, sources: Vec<String>, flight: FlightHandle) {
        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            inner.run_job(job, sources, flight).await;
        });
    }
}

/// Cancellation handles of one job.
struct FlightHandle {
    cancel: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
}

impl FlightHandle {
    fn new(shutdown: &CancellationToken) -> Self {
        Self {
            cancel: shutdown.child_token(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    fn register(&self, sources: Vec<String>) -> InFlight {
        InFlight {
            sources,
            cancel: self.cancel.clone(),
            cancel_requested: self.cancel_requested.clone(),
        }
    }

    fn user_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn emit(&self, event: IngestEvent) {
        let _ = self.events.send(event);
    }

    async fn persist(&self, job: &IngestionJob) {
        if let Err(e) = self.jobs.update_job(job).await {
            error!(job_id = %job.job_id, error = %e, "Failed to persist job record");
        }
    }

    /// Sources a job will lock, in lock order.
    async fn plan_sources(&self, request: &JobRequest) -> Result<Vec<String>> {
        self.config.validate()?;

        if let Some(prior_id) = request.retry_job {
            let prior = self
                .jobs
                .get_job(prior_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("job {prior_id}")))?;
            if !prior.status.is_terminal() {
                return Err(Error::AlreadyRunning(format!("job {prior_id} has not finished")));
            }
            let sources: BTreeSet<String> = prior
                .failed_candidates()
                .into_iter()
                .filter(|c| request.admits(c))
                .map(|c| c.source_id)
                .collect();
            return Ok(sources.into_iter().collect());
        }

        if let Some(filter) = &request.source_filter {
            if let Some(unknown) = filter.iter().find(|s| !self.connectors.contains_key(*s)) {
                return Err(Error::Config(format!("unknown source '{unknown}'")));
            }
        }
        let sources: Vec<String> = self
            .connectors
            .keys()
            .filter(|id| request.includes_source(id))
            .cloned()
            .collect();
        if sources.is_empty() {
            return Err(Error::Config("no sources selected".into()));
        }
        Ok(sources)
    }

    #[instrument(skip_all, fields(subsystem = "jobs", component = "orchestrator", op = "run_job", job_id = %job.job_id))]
    async fn run_job(self: &Arc<Self>, mut job: IngestionJob, sources: Vec<String>, flight: FlightHandle) {
        let job_id = job.job_id;

        // Held until the job is finalized.
        let mut _source_guards = Vec::with_capacity(sources.len());
        for source in &sources {
            tokio::select! {
                guard = self.source_locks.lock(source) => _source_guards.push(guard),
                _ = flight.cancel.cancelled() => {
                    self.finish_interrupted(job, &flight).await;
                    return;
                }
            }
        }

        let start = Instant::now();
        let deadline = start + self.config.timeouts.job;
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        }
        self.emit(IngestEvent::JobStarted { job_id });
        info!("Job started");

        let checkpoint = match self.jobs.load_checkpoint(job_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => Checkpoint::new(job_id),
            Err(e) => {
                warn!(error = %e, "Could not load checkpoint, starting a fresh one");
                Checkpoint::new(job_id)
            }
        };

        if !job.discovery_done() {
            job.stage = JobStage::Discovering;
            self.persist(&job).await;

            let discovered = tokio::select! {
                discovered = self.discover(&job, &sources) => Some(discovered),
                _ = flight.cancel.cancelled() => None,
            };
            let Some((reports, candidates)) = discovered else {
                self.finish_interrupted(job, &flight).await;
                return;
            };
            job.sources = reports;
            job.outcomes = candidates.into_iter().map(CandidateOutcome::discovered).collect();

            if job.resolve_status() == JobStatus::Failed {
                job.error = Some("discovery failed for every source".into());
                self.finalize(job, JobStatus::Failed).await;
                return;
            }
            job.stage = JobStage::Processing;
            self.persist(&job).await;
            if let Err(e) = self.jobs.save_checkpoint(&checkpoint).await {
                error!(error = %e, "Failed to save checkpoint");
            }
        }

        let run = Arc::new(JobRun {
            job_id,
            state: Mutex::new(RunState { job, checkpoint }),
            cancel: flight.cancel.clone(),
            deadline,
        });

        let pending: Vec<usize> = {
            let state = run.state.lock().await;
            state
                .job
                .outcomes
                .iter()
                .enumerate()
                .filter(|(_, o)| o.stage.next_step().is_some())
                .map(|(i, _)| i)
                .collect()
        };
        debug!(candidates = pending.len(), "Processing candidates");

        let mut tasks = JoinSet::new();
        for idx in pending {
            tasks.spawn(self.clone().process_candidate(run.clone(), idx));
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Candidate task panicked");
            }
        }

        let mut job = run.state.lock().await.job.clone();
        if flight.cancel.is_cancelled() {
            self.finish_interrupted(job, &flight).await;
            return;
        }

        let not_started = job.outcomes.iter().filter(|o| !o.stage.is_terminal()).count();
        if not_started > 0 {
            job.error = Some(format!(
                "job deadline of {}s reached; {not_started} candidates not started",
                self.config.timeouts.job.as_secs()
            ));
        }
        let status = job.resolve_status();
        info!(duration_ms = start.elapsed().as_millis() as u64, "Candidate processing finished");
        self.finalize(job, status).await;
    }

    /// Write the terminal record and release the job.
    async fn finalize(&self, mut job: IngestionJob, status: JobStatus) {
        let job_id = job.job_id;
        job.status = status;
        job.stage = JobStage::Finished;
        job.finished_at = Some(Utc::now());
        self.in_flight.write().await.remove(&job_id);
        self.persist(&job).await;

        let summary = job.summary();
        match status {
            JobStatus::Completed => info!(%job_id, succeeded = summary.succeeded, "Job completed"),
            _ => warn!(
                %job_id,
                status = status.as_str(),
                succeeded = summary.succeeded,
                failed = summary.failed.len(),
                pending = summary.pending,
                "Job finished"
            ),
        }
        self.emit(IngestEvent::JobFinished { job_id, status });
    }

    /// Either an explicit cancellation (terminal) or a shutdown (resumable).
    async fn finish_interrupted(&self, job: IngestionJob, flight: &FlightHandle) {
        let job_id = job.job_id;
        if flight.user_cancelled() {
            self.finalize(job, JobStatus::Cancelled).await;
            return;
        }
        self.in_flight.write().await.remove(&job_id);
        self.persist(&job).await;
        info!(%job_id, status = job.status.as_str(), "Job suspended for shutdown");
        self.emit(IngestEvent::JobSuspended { job_id });
    }

    /// Discovery for every source, or the failed candidates of an earlier job.
    async fn discover(&self, job: &IngestionJob, sources: &[String]) -> (Vec<SourceReport>, Vec<CandidateRecord>) {
        if let Some(prior_id) = job.request.retry_job {
            return self.retry_candidates(job, prior_id).await;
        }

        let results = join_all(sources.iter().map(|source_id| async move {
            let result = match self.connectors.get(source_id) {
                Some(connector) => {
                    discover_with_retry(
                        connector.as_ref(),
                        &self.config.discovery_retry,
                        self.config.timeouts.discovery,
                    )
                    .await
                }
                None => Err(Error::Config(format!("unknown source '{source_id}'"))),
            };
            (source_id, result)
        }))
        .await;

        let mut reports = Vec::with_capacity(results.len());
        let mut candidates = Vec::new();
        let mut seen = BTreeSet::new();
        for (source_id, result) in results {
            match result {
                Ok(discovery) => {
                    let skipped = discovery.skipped;
                    let mut kept = 0;
                    for candidate in discovery.into_iter_candidates() {
                        if job.request.admits(&candidate) && seen.insert(candidate.paper_key()) {
                            candidates.push(candidate);
                            kept += 1;
                        }
                    }
                    reports.push(SourceReport {
                        source_id: source_id.clone(),
                        discovered: kept,
                        skipped,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(source_id = %source_id, error = %e, "Source discovery failed");
                    reports.push(SourceReport {
                        source_id: source_id.clone(),
                        discovered: 0,
                        skipped: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        (reports, candidates)
    }

    async fn retry_candidates(&self, job: &IngestionJob, prior_id: Uuid) -> (Vec<SourceReport>, Vec<CandidateRecord>) {
        let prior = match self.jobs.get_job(prior_id).await {
            Ok(Some(prior)) => prior,
            Ok(None) => return (vec![retry_failure(prior_id, "job not found".into())], Vec::new()),
            Err(e) => return (vec![retry_failure(prior_id, e.to_string())], Vec::new()),
        };

        let candidates: Vec<CandidateRecord> = prior
            .failed_candidates()
            .into_iter()
            .filter(|c| job.request.admits(c))
            .collect();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for c in &candidates {
            *counts.entry(c.source_id.clone()).or_default() += 1;
        }
        info!(%prior_id, candidates = candidates.len(), "Retrying failed candidates");
        let reports = counts
            .into_iter()
            .map(|(source_id, discovered)| SourceReport {
                source_id,
                discovered,
                skipped: 0,
                error: None,
            })
            .collect();
        (reports, candidates)
    }

    /// Move a candidate to `next`, persisting the checkpoint on stage boundaries.
    async fn advance(
        &self,
        run: &JobRun,
        idx: usize,
        next: CandidateStage,
        apply: impl FnOnce(&mut CandidateOutcome) + Send,
    ) {
        let mut state = run.state.lock().await;
        let RunState { job, checkpoint } = &mut *state;
        let outcome = &mut job.outcomes[idx];
        if let Err(e) = outcome.advance(next) {
            error!(job_id = %run.job_id, error = %e, "Rejected candidate transition");
            return;
        }
        apply(outcome);
        let paper_key = outcome.paper_key.clone();

        if next.is_stage_boundary() {
            checkpoint.record(&paper_key, next);
            job.checkpoint_cursor = checkpoint.last_completed_candidate_key.clone();
            if let Err(e) = self.jobs.save_checkpoint(checkpoint).await {
                error!(job_id = %run.job_id, paper_key = %paper_key, error = %e, "Failed to save checkpoint");
            }
            if let Err(e) = self.jobs.update_job(job).await {
                error!(job_id = %run.job_id, error = %e, "Failed to persist job record");
            }
        }
        drop(state);

        self.emit(IngestEvent::CandidateStage {
            job_id: run.job_id,
            paper_key,
            stage: next,
        });
    }

    async fn fail(&self, run: &JobRun, idx: usize, next: CandidateStage, error: &Error) {
        let reason = FailureReason::from(error);
        warn!(job_id = %run.job_id, stage = next.as_str(), error = %error, "Candidate failed");
        self.advance(run, idx, next, move |o| o.error = Some(reason)).await;
    }

    /// Return a candidate to an earlier boundary (interrupted stage or missing artifact).
    async fn rewind(&self, run: &JobRun, idx: usize, stage: CandidateStage) {
        let mut state = run.state.lock().await;
        let RunState { job, checkpoint } = &mut *state;
        let outcome = &mut job.outcomes[idx];
        outcome.stage = stage;
        outcome.updated_at = Utc::now();
        checkpoint.record(&outcome.paper_key, stage);
        if let Err(e) = self.jobs.save_checkpoint(checkpoint).await {
            error!(job_id = %run.job_id, error = %e, "Failed to save checkpoint");
        }
    }

    /// Drive one candidate through its remaining stages.
    async fn process_candidate(self: Arc<Self>, run: Arc<JobRun>, idx: usize) {
        let (candidate, mut stage) = {
            let state = run.state.lock().await;
            let outcome = &state.job.outcomes[idx];
            (outcome.candidate.clone(), outcome.stage.resume_point())
        };
        let paper_key = candidate.paper_key();

        let mut artifact: Option<ArtifactRef> = None;
        let mut enrichment: Option<EnrichmentResult> = None;

        while let Some(step) = stage.next_step() {
            if run.cancel.is_cancelled() {
                break;
            }
            match step {
                StageStep::Fetch => {
                    let _permit = tokio::select! {
                        biased;
                        _ = run.cancel.cancelled() => break,
                        permit = self.fetch_pool.acquire() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    // Checked after the pool wait: a candidate starts when it fetches.
                    if Instant::now() >= run.deadline {
                        debug!(job_id = %run.job_id, paper_key = %paper_key, "Job deadline passed, not starting candidate");
                        break;
                    }
                    self.advance(&run, idx, CandidateStage::Fetching, |_| {}).await;

                    let result = tokio::select! {
                        result = self.artifacts.fetch(&candidate) => result,
                        _ = run.cancel.cancelled() => {
                            self.rewind(&run, idx, CandidateStage::Discovered).await;
                            break;
                        }
                    };
                    match result {
                        Ok(fetched) => {
                            let path = fetched.storage_path.clone();
                            self.advance(&run, idx, CandidateStage::Fetched, move |o| o.storage_path = Some(path))
                                .await;
                            artifact = Some(fetched);
                            stage = CandidateStage::Fetched;
                        }
                        Err(e) => {
                            self.fail(&run, idx, CandidateStage::FetchFailed, &e).await;
                            break;
                        }
                    }
                }
                StageStep::Enrich => {
                    let stored = match artifact.clone() {
                        Some(a) => Some(a),
                        None => self.stored_artifact(&candidate).await,
                    };
                    let Some(stored) = stored else {
                        self.rewind(&run, idx, CandidateStage::Discovered).await;
                        stage = CandidateStage::Discovered;
                        continue;
                    };

                    let _permit = tokio::select! {
                        biased;
                        _ = run.cancel.cancelled() => break,
                        permit = self.enrich_pool.acquire() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    self.advance(&run, idx, CandidateStage::Enriching, |_| {}).await;
                    let Some(gateway) = self.gateway.as_ref() else {
                        let e = Error::Config("enrichment provider is not configured".into());
                        self.fail(&run, idx, CandidateStage::EnrichFailed, &e).await;
                        break;
                    };

                    let excerpt = self.excerpts.extract(&stored.storage_path).await;
                    let input = EnrichmentInput {
                        candidate: &candidate,
                        artifact: &stored,
                        excerpt: excerpt.as_deref(),
                    };
                    let result = tokio::select! {
                        result = gateway.enrich(&input) => result,
                        _ = run.cancel.cancelled() => {
                            self.rewind(&run, idx, CandidateStage::Fetched).await;
                            break;
                        }
                    };
                    match result {
                        Ok(enriched) => {
                            if let Err(e) = self.artifacts.record_enrichment(&candidate, &stored, &enriched).await {
                                warn!(paper_key = %paper_key, error = %e, "Failed to write enrichment manifest");
                            }
                            let provider = enriched.provider.clone();
                            self.advance(&run, idx, CandidateStage::Enriched, move |o| o.provider = Some(provider))
                                .await;
                            artifact = Some(stored);
                            enrichment = Some(enriched);
                            stage = CandidateStage::Enriched;
                        }
                        Err(e) => {
                            self.fail(&run, idx, CandidateStage::EnrichFailed, &e).await;
                            break;
                        }
                    }
                }
                StageStep::GraphWrite => {
                    let (stored, enriched) = match (artifact.clone(), enrichment.clone()) {
                        (Some(a), Some(e)) => (a, e),
                        _ => match self.artifacts.load_manifest(&candidate).await {
                            Ok(Some(ArtifactManifest {
                                artifact,
                                enrichment: Some(enriched),
                                ..
                            })) => (artifact, enriched),
                            _ => {
                                debug!(paper_key = %paper_key, "Enrichment not found in manifest, enriching again");
                                self.rewind(&run, idx, CandidateStage::Fetched).await;
                                stage = CandidateStage::Fetched;
                                continue;
                            }
                        },
                    };

                    let _permit = tokio::select! {
                        biased;
                        _ = run.cancel.cancelled() => break,
                        permit = self.graph_pool.acquire() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    self.advance(&run, idx, CandidateStage::GraphWriting, |_| {}).await;

                    // Not raced against cancellation: a started write always finishes.
                    let mutation = build_mutation(&candidate, &stored, &enriched);
                    match self.graph.write(&mutation).await {
                        Ok(_) => {
                            self.advance(&run, idx, CandidateStage::GraphWritten, |_| {}).await;
                            stage = CandidateStage::GraphWritten;
                        }
                        Err(e) => {
                            self.fail(&run, idx, CandidateStage::GraphWriteFailed, &e).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn stored_artifact(&self, candidate: &CandidateRecord) -> Option<ArtifactRef> {
        match self.artifacts.cached(candidate).await {
            Ok(manifest) => manifest.map(|m| m.artifact),
            Err(e) => {
                warn!(paper_key = %candidate.paper_key(), error = %e, "Could not read stored artifact");
                None
            }
        }
    }
}

fn retry_failure(prior_id: Uuid, error: String) -> SourceReport {
    SourceReport {
        source_id: format!("retry:{prior_id}"),
        discovered: 0,
        skipped: 0,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceConfig, SourceKind, StagePools, StageTimeouts};
    use paperscope_core::RetryPolicy;
    use paperscope_db::{MemoryGraphStore, MemoryJobStore};
    use paperscope_inference::{MockFailure, MockProvider, ProviderSettings};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PDF: &[u8] = b"%PDF-1.4 test document";

    struct Harness {
        orchestrator: IngestOrchestrator,
        graph: Arc<MemoryGraphStore>,
        jobs: Arc<MemoryJobStore>,
        provider: Arc<MockProvider>,
        server: MockServer,
        dir: TempDir,
    }

    fn paper_id(n: usize) -> String {
        format!("2401.0000{n}")
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1)).with_jitter_ratio(0.0)
    }

    async fn mount_pdf(server: &MockServer, id: &str, delay: Duration, expected: Option<u64>) {
        let mock = Mock::given(method("GET"))
            .and(path(format!("/pdf/{id}.pdf")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PDF).set_delay(delay));
        let mock = match expected {
            Some(n) => mock.expect(n),
            None => mock,
        };
        mock.mount(server).await;
    }

    fn config_for(dir: &TempDir, list: &std::path::Path) -> IngestConfig {
        IngestConfig::default()
            .with_storage_root(dir.path().join("store"))
            .with_sources(vec![SourceConfig {
                source_id: "curated".into(),
                kind: SourceKind::StaticFile,
                endpoint: list.display().to_string(),
                limit: 10,
                enabled: true,
            }])
            .with_provider(ProviderSettings::Mock)
            .with_pools(StagePools {
                fetch: 2,
                enrich: 2,
                graph: 2,
            })
            .with_retry(quick_retry())
            .with_excerpts(false)
    }

    async fn harness_with(
        papers: usize,
        provider: MockProvider,
        tweak: impl FnOnce(IngestConfig) -> IngestConfig,
        graph: Arc<MemoryGraphStore>,
        jobs: Arc<MemoryJobStore>,
    ) -> Harness {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<serde_json::Value> = (1..=papers)
            .map(|n| {
                let id = paper_id(n);
                serde_json::json!({
                    "id": id,
                    "title": format!("Paper {id} on sparse attention"),
                    "authors": [{"name": "A. Smith"}],
                    "pdfUrl": format!("{}/pdf/{id}.pdf", server.uri()),
                })
            })
            .collect();
        let list = dir.path().join("papers.json");
        std::fs::write(&list, serde_json::json!({ "papers": entries }).to_string()).unwrap();

        let provider = Arc::new(provider);
        let gateway = EnrichmentGateway::new(provider.clone(), quick_retry(), Duration::from_secs(5));
        let orchestrator = IngestOrchestrator::builder(tweak(config_for(&dir, &list)), graph.clone(), jobs.clone())
            .gateway(gateway)
            .build()
            .unwrap();

        Harness {
            orchestrator,
            graph,
            jobs,
            provider,
            server,
            dir,
        }
    }

    async fn harness(papers: usize, provider: MockProvider) -> Harness {
        harness_with(
            papers,
            provider,
            |c| c,
            Arc::new(MemoryGraphStore::new()),
            Arc::new(MemoryJobStore::new()),
        )
        .await
    }

    async fn wait_terminal(orchestrator: &IngestOrchestrator, job_id: Uuid) -> IngestionJob {
        for _ in 0..500 {
            if let Some(job) = orchestrator.get_job(job_id).await.unwrap() {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} did not finish");
    }

    #[tokio::test]
    async fn test_job_completes_and_builds_graph() {
        let h = harness(3, MockProvider::new()).await;
        for n in 1..=3 {
            mount_pdf(&h.server, &paper_id(n), Duration::ZERO, Some(1)).await;
        }
        let mut events = h.orchestrator.subscribe();

        let job_id = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.stage, JobStage::Finished);
        assert_eq!(job.summary().succeeded, 3);
        assert_eq!(job.sources[0].discovered, 3);
        assert!(job.outcomes.iter().all(|o| o.provider.as_deref() == Some("mock:deterministic")));

        let stats = h.graph.stats().await.unwrap();
        assert_eq!(stats.nodes.get("Paper"), Some(&3));
        assert_eq!(stats.nodes.get("Author"), Some(&1));
        assert_eq!(h.graph.commits().await.len(), 3);

        let mut written = 0;
        while let Ok(event) = events.try_recv() {
            if let IngestEvent::CandidateStage { stage: CandidateStage::GraphWritten, .. } = event {
                written += 1;
            }
        }
        assert_eq!(written, 3);
    }

    #[tokio::test]
    async fn test_regenerate_reenriches_stored_paper() {
        let h = harness(1, MockProvider::new()).await;
        mount_pdf(&h.server, &paper_id(1), Duration::ZERO, Some(1)).await;
        let job_id = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        let key = job.outcomes[0].candidate.paper_key();

        let paper = h.orchestrator.regenerate(&key).await.unwrap();
        assert_eq!(paper.properties["chapters"][0]["title"], "Overview");
        assert_eq!(h.provider.calls(), 2);
        assert_eq!(h.graph.commits().await.len(), 2);
        assert_eq!(h.orchestrator.artifacts().network_fetches(), 1);

        let document = h.orchestrator.paper_document(&key).await.unwrap();
        std::fs::write(&document, b"tampered").unwrap();
        let err = h.orchestrator.regenerate(&key).await.unwrap_err();
        assert!(matches!(err, Error::PermanentInput(_)));
        assert!(matches!(
            h.orchestrator.regenerate("curated:missing").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_job_deadline_stops_candidates_waiting_for_fetch_pool() {
        let h = harness_with(
            3,
            MockProvider::new(),
            |c| {
                let timeouts = StageTimeouts {
                    job: Duration::from_millis(300),
                    ..c.timeouts
                };
                c.with_timeouts(timeouts).with_pools(StagePools {
                    fetch: 1,
                    enrich: 1,
                    graph: 1,
                })
            },
            Arc::new(MemoryGraphStore::new()),
            Arc::new(MemoryJobStore::new()),
        )
        .await;
        for n in 1..=3 {
            mount_pdf(&h.server, &paper_id(n), Duration::from_millis(400), None).await;
        }

        let job_id = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;

        assert_eq!(job.status, JobStatus::PartialSuccess);
        let summary = job.summary();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.pending, 2);
        assert!(summary.failed.is_empty());
        assert!(job.error.as_deref().unwrap().contains("2 candidates not started"));
        assert_eq!(h.server.received_requests().await.unwrap().len(), 1);
        assert_eq!(h.graph.commits().await.len(), 1);
    }

    #[tokio::test]
    async fn test_enrichment_failure_isolated_to_candidate() {
        let failing = format!("Paper {}", paper_id(2));
        let h = harness(3, MockProvider::new().fail_when(&failing, MockFailure::Permanent)).await;
        for n in 1..=3 {
            mount_pdf(&h.server, &paper_id(n), Duration::ZERO, None).await;
        }

        let job_id = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;

        assert_eq!(job.status, JobStatus::PartialSuccess);
        assert_eq!(job.outcomes[0].stage, CandidateStage::GraphWritten);
        assert_eq!(job.outcomes[1].stage, CandidateStage::EnrichFailed);
        assert_eq!(job.outcomes[2].stage, CandidateStage::GraphWritten);

        let summary = job.summary();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].reason.as_ref().unwrap().class, "permanent_input");

        // The fetched document stays available for a later retry.
        let failed = &job.outcomes[1].candidate;
        assert!(h.orchestrator.artifacts().document_path(failed).exists());
        assert!(!h.graph.commits().await.contains(&failed.paper_key()));
    }

    #[tokio::test]
    async fn test_missing_document_is_fetch_failed() {
        let h = harness(2, MockProvider::new()).await;
        mount_pdf(&h.server, &paper_id(1), Duration::ZERO, None).await;
        Mock::given(method("GET"))
            .and(path(format!("/pdf/{}.pdf", paper_id(2))))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&h.server)
            .await;

        let job_id = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;

        assert_eq!(job.status, JobStatus::PartialSuccess);
        assert_eq!(job.outcomes[1].stage, CandidateStage::FetchFailed);
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_resume_skips_written_candidates() {
        let h = harness(3, MockProvider::new()).await;
        mount_pdf(&h.server, &paper_id(1), Duration::ZERO, Some(0)).await;
        mount_pdf(&h.server, &paper_id(2), Duration::ZERO, Some(1)).await;
        mount_pdf(&h.server, &paper_id(3), Duration::ZERO, Some(1)).await;

        // A job interrupted after its first candidate reached the graph.
        let discovery = h.orchestrator.preview(Some("curated")).await.unwrap().remove(0);
        let mut job = IngestionJob::new(TriggerKind::Scheduled, JobRequest::default());
        job.status = JobStatus::Running;
        job.stage = JobStage::Processing;
        job.started_at = Some(Utc::now());
        job.sources = vec![SourceReport {
            source_id: "curated".into(),
            discovered: 3,
            skipped: 0,
            error: None,
        }];
        job.outcomes = discovery.candidates.into_iter().map(CandidateOutcome::discovered).collect();
        let done_key = job.outcomes[0].paper_key.clone();
        h.jobs.insert_job(&job).await.unwrap();

        let mut checkpoint = Checkpoint::new(job.job_id);
        checkpoint.record(&done_key, CandidateStage::GraphWritten);
        h.jobs.save_checkpoint(&checkpoint).await.unwrap();

        assert_eq!(h.orchestrator.resume_unfinished().await.unwrap(), 1);
        let resumed = wait_terminal(&h.orchestrator, job.job_id).await;

        assert_eq!(resumed.status, JobStatus::Completed);
        assert!(resumed.checkpoint_cursor.is_some());
        assert_eq!(h.provider.calls(), 2);
        let commits = h.graph.commits().await;
        assert_eq!(commits.len(), 2);
        assert!(!commits.contains(&done_key));
    }

    #[tokio::test]
    async fn test_same_source_jobs_run_one_after_another() {
        let h = harness(2, MockProvider::new()).await;
        for n in 1..=2 {
            mount_pdf(&h.server, &paper_id(n), Duration::from_millis(200), Some(1)).await;
        }

        let first = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        let second = h.orchestrator.trigger(TriggerKind::Scheduled, JobRequest::default()).await.unwrap();
        let first = wait_terminal(&h.orchestrator, first).await;
        let second = wait_terminal(&h.orchestrator, second).await;

        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!(second.status, JobStatus::Completed);
        assert!(second.started_at.unwrap() >= first.finished_at.unwrap());

        // The second job reuses stored documents and converges on the same graph.
        let stats = h.graph.stats().await.unwrap();
        assert_eq!(stats.nodes.get("Paper"), Some(&2));
        assert_eq!(stats.nodes.get("Author"), Some(&1));
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_overlapping_trigger() {
        let h = harness_with(
            1,
            MockProvider::new(),
            |c| c.with_overlap_policy(OverlapPolicy::Reject),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(MemoryJobStore::new()),
        )
        .await;
        mount_pdf(&h.server, &paper_id(1), Duration::from_millis(300), None).await;

        let first = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        let second = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await;
        assert!(matches!(second, Err(Error::AlreadyRunning(_))));

        assert_eq!(wait_terminal(&h.orchestrator, first).await.status, JobStatus::Completed);
        assert!(h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_all_sources_failing_fails_job() {
        let h = harness(1, MockProvider::new()).await;
        std::fs::remove_file(h.dir.path().join("papers.json")).unwrap();

        let job_id = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.outcomes.is_empty());
        assert!(job.sources[0].error.as_deref().unwrap().contains("papers.json"));
    }

    #[tokio::test]
    async fn test_unknown_source_records_failed_job() {
        let h = harness(1, MockProvider::new()).await;
        let request = JobRequest {
            source_filter: Some(vec!["nope".into()]),
            ..JobRequest::default()
        };

        let job_id = h.orchestrator.trigger(TriggerKind::Manual, request).await.unwrap();
        let job = h.orchestrator.get_job(job_id).await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("unknown source 'nope'"));
        assert!(!h.orchestrator.is_in_flight(job_id).await);
    }

    #[tokio::test]
    async fn test_misconfigured_provider_fails_jobs_not_build() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("papers.json");
        std::fs::write(&list, r#"{"papers": []}"#).unwrap();
        let config = config_for(&dir, &list).with_provider(ProviderSettings::OpenAi {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
        });

        let orchestrator = IngestOrchestrator::builder(
            config,
            Arc::new(MemoryGraphStore::new()),
            Arc::new(MemoryJobStore::new()),
        )
        .build()
        .unwrap();

        let job_id = orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        let job = orchestrator.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("OPENAI_API_KEY"));
    }

    /// Job store whose inserts stall, to show readers are not held up.
    struct SlowInsertJobStore {
        inner: MemoryJobStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl JobStore for SlowInsertJobStore {
        async fn insert_job(&self, job: &IngestionJob) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.insert_job(job).await
        }
        async fn update_job(&self, job: &IngestionJob) -> Result<()> {
            self.inner.update_job(job).await
        }
        async fn get_job(&self, job_id: Uuid) -> Result<Option<IngestionJob>> {
            self.inner.get_job(job_id).await
        }
        async fn list_jobs(&self, limit: i64) -> Result<Vec<IngestionJob>> {
            self.inner.list_jobs(limit).await
        }
        async fn list_unfinished(&self) -> Result<Vec<IngestionJob>> {
            self.inner.list_unfinished().await
        }
        async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
            self.inner.save_checkpoint(checkpoint).await
        }
        async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>> {
            self.inner.load_checkpoint(job_id).await
        }
    }

    #[tokio::test]
    async fn test_slow_job_insert_does_not_block_readers() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("papers.json");
        std::fs::write(&list, r#"{"papers": []}"#).unwrap();
        let jobs = Arc::new(SlowInsertJobStore {
            inner: MemoryJobStore::new(),
            delay: Duration::from_millis(500),
        });
        let orchestrator = IngestOrchestrator::builder(
            config_for(&dir, &list),
            Arc::new(MemoryGraphStore::new()),
            jobs,
        )
        .build()
        .unwrap();

        let trigger = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let other_job = Uuid::new_v4();
        let in_flight = tokio::time::timeout(Duration::from_millis(200), orchestrator.is_in_flight(other_job))
            .await
            .expect("in-flight lookup waited on the job store");
        assert!(!in_flight);

        let job_id = trigger.await.unwrap().unwrap();
        let job = wait_terminal(&orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_job() {
        let h = harness(2, MockProvider::new()).await;
        for n in 1..=2 {
            mount_pdf(&h.server, &paper_id(n), Duration::from_secs(5), None).await;
        }

        let job_id = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.orchestrator.cancel(job_id).await.unwrap());

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.outcomes.iter().all(|o| o.stage == CandidateStage::Discovered));
        assert!(!h.orchestrator.cancel(job_id).await.unwrap());
        assert!(matches!(h.orchestrator.cancel(Uuid::new_v4()).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_retry_job_reprocesses_failed_candidates_only() {
        let h = harness(2, MockProvider::new()).await;
        mount_pdf(&h.server, &paper_id(1), Duration::ZERO, Some(1)).await;
        Mock::given(method("GET"))
            .and(path(format!("/pdf/{}.pdf", paper_id(2))))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&h.server)
            .await;
        mount_pdf(&h.server, &paper_id(2), Duration::ZERO, Some(1)).await;

        let first = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        assert_eq!(wait_terminal(&h.orchestrator, first).await.status, JobStatus::PartialSuccess);

        let request = JobRequest {
            retry_job: Some(first),
            ..JobRequest::default()
        };
        let retry = h.orchestrator.trigger(TriggerKind::Manual, request).await.unwrap();
        let retry = wait_terminal(&h.orchestrator, retry).await;

        assert_eq!(retry.status, JobStatus::Completed);
        assert_eq!(retry.outcomes.len(), 1);
        assert_eq!(retry.outcomes[0].candidate.external_id, paper_id(2));
        assert_eq!(h.graph.commits().await.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_suspends_then_resume_completes() {
        let graph = Arc::new(MemoryGraphStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let h = harness_with(2, MockProvider::new(), |c| c, graph.clone(), jobs.clone()).await;
        for n in 1..=2 {
            mount_pdf(&h.server, &paper_id(n), Duration::from_millis(400), None).await;
        }

        let job_id = h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.orchestrator.shutdown(Duration::from_secs(5)).await.unwrap();

        let suspended = jobs.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(suspended.status, JobStatus::Running);
        assert!(matches!(
            h.orchestrator.trigger(TriggerKind::Manual, JobRequest::default()).await,
            Err(Error::Cancelled(_))
        ));

        let restarted = IngestOrchestrator::builder(h.orchestrator.config().clone(), graph.clone(), jobs.clone())
            .gateway(EnrichmentGateway::new(
                Arc::new(MockProvider::new()),
                quick_retry(),
                Duration::from_secs(5),
            ))
            .build()
            .unwrap();
        assert_eq!(restarted.resume_unfinished().await.unwrap(), 1);

        let job = wait_terminal(&restarted, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(graph.commits().await.len(), 2);
    }
}
