//! Route handlers.

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::info;
use uuid::Uuid;

use paperscope_core::{
    defaults, paper_key, GraphStore, IngestionJob, JobRequest, JobStage, JobStatus, JobSummary,
    TriggerKind,
};

use crate::error::ApiError;
use crate::AppState;

const MAX_PAGE_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

impl LimitQuery {
    fn resolve(&self) -> Result<i64, ApiError> {
        match self.limit {
            None => Ok(defaults::PAGE_LIMIT),
            Some(n) if n < 1 => Err(ApiError::BadRequest("limit must be >= 1".into())),
            Some(n) => Ok(n.min(MAX_PAGE_LIMIT)),
        }
    }

    /// Like [`Self::resolve`], but values above `max` are rejected.
    fn resolve_strict(&self, max: i64) -> Result<i64, ApiError> {
        match self.limit {
            Some(n) if n > max => Err(ApiError::BadRequest(format!("limit must be <= {max}"))),
            _ => self.resolve(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub source: Option<String>,
}

/// Row of the job list.
#[derive(Debug, Serialize)]
pub struct JobListItem {
    pub job_id: Uuid,
    pub trigger_kind: TriggerKind,
    pub status: JobStatus,
    pub stage: JobStage,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: JobSummary,
}

impl From<&IngestionJob> for JobListItem {
    fn from(job: &IngestionJob) -> Self {
        Self {
            job_id: job.job_id,
            trigger_kind: job.trigger_kind,
            status: job.status,
            stage: job.stage,
            created_at: job.created_at,
            finished_at: job.finished_at,
            summary: job.summary(),
        }
    }
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sources": state.orchestrator.source_ids(),
    }))
}

/// `POST /ingest/run`. An empty body runs every enabled source.
pub async fn run_ingest(State(state): State<AppState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let request: JobRequest = if body.iter().all(u8::is_ascii_whitespace) {
        JobRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?
    };

    let job_id = state.orchestrator.trigger(TriggerKind::Manual, request).await?;
    let status = state
        .orchestrator
        .get_job(job_id)
        .await?
        .map(|job| job.status)
        .unwrap_or(JobStatus::Pending);
    info!(subsystem = "api", %job_id, status = status.as_str(), "Manual ingestion triggered");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id, "status": status })),
    ))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state.orchestrator.list_jobs(query.resolve()?).await?;
    let items: Vec<JobListItem> = jobs.iter().map(JobListItem::from).collect();
    Ok(Json(json!({ "jobs": items })))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .orchestrator
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {job_id} not found")))?;
    let summary = job.summary();
    Ok(Json(json!({ "job": job, "summary": summary })))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = state.orchestrator.cancel(job_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id, "cancelled": cancelled })),
    ))
}

pub async fn preview(
    State(state): State<AppState>,
    Query(query): Query<PreviewQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let sources = state.orchestrator.preview(query.source.as_deref()).await?;
    Ok(Json(json!({ "sources": sources })))
}

pub async fn recent_papers(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let papers = state.orchestrator.graph_store().recent_papers(query.resolve()?).await?;
    Ok(Json(json!({ "papers": papers })))
}

pub async fn paper_graph(
    State(state): State<AppState>,
    Path((source, external_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = paper_key(&source, &external_id);
    let neighborhood = state
        .orchestrator
        .graph_store()
        .paper_neighborhood(&key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Paper {key} not found")))?;
    Ok(Json(neighborhood))
}

/// `GET /papers/:source/:external_id/pdf`. Streams the stored document.
pub async fn paper_pdf(
    State(state): State<AppState>,
    Path((source, external_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let key = paper_key(&source, &external_id);
    let path = state.orchestrator.paper_document(&key).await?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(paperscope_core::Error::from)?;
    let body = Body::from_stream(ReaderStream::new(file));
    Ok(([(header::CONTENT_TYPE, "application/pdf")], body).into_response())
}

/// `POST /papers/:source/:external_id/chapters/regenerate`.
pub async fn regenerate_chapters(
    State(state): State<AppState>,
    Path((source, external_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = paper_key(&source, &external_id);
    let paper = state.orchestrator.regenerate(&key).await?;
    info!(subsystem = "api", paper_key = %key, "Chapters regenerated");
    Ok(Json(json!({ "paper": paper })))
}

/// `GET /graphs/network`. Recent papers linked by the concepts they share.
pub async fn paper_network(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.resolve_strict(defaults::NETWORK_MAX_LIMIT)?;
    let network = state.orchestrator.graph_store().paper_network(limit).await?;
    Ok(Json(network))
}

pub async fn graph_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.orchestrator.graph_store().stats().await?;
    Ok(Json(json!({
        "node_count": stats.node_count(),
        "edge_count": stats.edge_count(),
        "nodes": stats.nodes,
        "edges": stats.edges,
    })))
}
