//! Ingestion job and checkpoint repository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use paperscope_core::{Checkpoint, Error, IngestionJob, JobStage, JobStore, Result};

/// PostgreSQL implementation of JobStore.
///
/// The full job (outcomes included) is stored as JSONB; status, stage, and
/// timestamps are mirrored into columns for filtering.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn stage_to_str(stage: JobStage) -> &'static str {
        match stage {
            JobStage::Queued => "queued",
            JobStage::Discovering => "discovering",
            JobStage::Processing => "processing",
            JobStage::Finished => "finished",
        }
    }

    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<IngestionJob> {
        let record: serde_json::Value = row.get("record");
        Ok(serde_json::from_value(record)?)
    }
}

#[async_trait]
impl JobStore for PgJobRepository {
    async fn insert_job(&self, job: &IngestionJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_job
                (job_id, trigger_kind, status, stage, record, created_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.job_id)
        .bind(job.trigger_kind.as_str())
        .bind(job.status.as_str())
        .bind(Self::stage_to_str(job.stage))
        .bind(serde_json::to_value(job)?)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &IngestionJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_job
            SET status = $2, stage = $3, record = $4, started_at = $5, finished_at = $6,
                updated_at = $7
            WHERE job_id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(job.job_id)
        .bind(job.status.as_str())
        .bind(Self::stage_to_str(job.stage))
        .bind(serde_json::to_value(job)?)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_job(job.job_id).await? {
                Some(existing) => Err(Error::Internal(format!(
                    "job {} is {} and can no longer change",
                    job.job_id,
                    existing.status.as_str()
                ))),
                None => Err(Error::NotFound(format!("job {}", job.job_id))),
            };
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<IngestionJob>> {
        let row = sqlx::query("SELECT record FROM ingestion_job WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::parse_job_row).transpose()
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<IngestionJob>> {
        let rows = sqlx::query("SELECT record FROM ingestion_job ORDER BY created_at DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn list_unfinished(&self) -> Result<Vec<IngestionJob>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM ingestion_job
            WHERE status IN ('pending', 'running')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_checkpoint (job_id, last_completed_candidate_key, stage_progress, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id) DO UPDATE
                SET last_completed_candidate_key = EXCLUDED.last_completed_candidate_key,
                    stage_progress = EXCLUDED.stage_progress,
                    updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(checkpoint.job_id)
        .bind(&checkpoint.last_completed_candidate_key)
        .bind(serde_json::to_value(&checkpoint.stage_progress)?)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        debug!(
            subsystem = "db",
            component = "jobs",
            op = "save_checkpoint",
            job_id = %checkpoint.job_id,
            candidates = checkpoint.stage_progress.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, last_completed_candidate_key, stage_progress, updated_at
            FROM ingestion_checkpoint WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Checkpoint> {
            let progress: serde_json::Value = row.get("stage_progress");
            Ok(Checkpoint {
                job_id: row.get("job_id"),
                last_completed_candidate_key: row.get("last_completed_candidate_key"),
                stage_progress: serde_json::from_value(progress)?,
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }
}
