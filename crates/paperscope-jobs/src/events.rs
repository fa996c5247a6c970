//! Events broadcast by the orchestrator.

use serde::Serialize;
use uuid::Uuid;

use paperscope_core::{CandidateStage, JobStatus, TriggerKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    /// A trigger was accepted.
    JobQueued { job_id: Uuid, trigger_kind: TriggerKind },
    /// The job acquired its sources and began discovery.
    JobStarted { job_id: Uuid },
    /// A candidate entered a new pipeline state.
    CandidateStage {
        job_id: Uuid,
        paper_key: String,
        stage: CandidateStage,
    },
    /// The job reached a terminal status.
    JobFinished { job_id: Uuid, status: JobStatus },
    /// The job stopped because the process is shutting down; it resumes on restart.
    JobSuspended { job_id: Uuid },
}

impl IngestEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            IngestEvent::JobQueued { job_id, .. }
            | IngestEvent::JobStarted { job_id }
            | IngestEvent::CandidateStage { job_id, .. }
            | IngestEvent::JobFinished { job_id, .. }
            | IngestEvent::JobSuspended { job_id } => *job_id,
        }
    }
}
