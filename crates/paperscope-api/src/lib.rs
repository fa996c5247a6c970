//! # paperscope-api
//!
//! HTTP surface of the ingestion pipeline: manual triggers, job status and
//! cancellation, discovery previews, and read-only knowledge graph queries.

pub mod error;
pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use paperscope_core::defaults;
use paperscope_jobs::IngestOrchestrator;

pub use error::ApiError;

/// Time-ordered UUIDv7 request ids, so ids sort with the log timeline.
#[derive(Clone, Default)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: IngestOrchestrator,
}

impl AppState {
    pub fn new(orchestrator: IngestOrchestrator) -> Self {
        Self { orchestrator }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ingest/health", get(handlers::health))
        .route("/ingest/run", post(handlers::run_ingest))
        .route("/ingest/jobs", get(handlers::list_jobs))
        .route("/ingest/jobs/:job_id", get(handlers::get_job))
        .route("/ingest/jobs/:job_id/cancel", post(handlers::cancel_job))
        .route("/ingest/preview", get(handlers::preview))
        .route("/papers", get(handlers::recent_papers))
        .route("/papers/:source/:external_id/graph", get(handlers::paper_graph))
        .route("/papers/:source/:external_id/pdf", get(handlers::paper_pdf))
        .route(
            "/papers/:source/:external_id/chapters/regenerate",
            post(handlers::regenerate_chapters),
        )
        .route("/graphs/network", get(handlers::paper_network))
        .route("/graph/stats", get(handlers::graph_stats))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(RequestBodyLimitLayer::new(defaults::MAX_BODY_BYTES))
        .with_state(state)
}
