//! Cron trigger for scheduled ingestion runs.

use std::str::FromStr;

use chrono_tz::Tz;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use paperscope_core::{Error, JobRequest, Result, TriggerKind};

use crate::config::SchedulerConfig;
use crate::orchestrator::IngestOrchestrator;

/// Accept standard 5-field cron by prepending a seconds field.
pub fn normalize_cron(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(Error::Config(format!(
            "cron expression '{expr}' has {n} fields, expected 5 to 7"
        ))),
    }
}

/// IANA timezone name such as `Europe/Berlin`; empty or `Z` means UTC.
pub fn parse_timezone(raw: &str) -> Result<Tz> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "Z" {
        return Ok(Tz::UTC);
    }
    Tz::from_str(raw).map_err(|_| {
        Error::Config(format!(
            "unknown timezone '{raw}', expected an IANA name such as UTC or Europe/Berlin"
        ))
    })
}

/// Running cron scheduler. Each tick triggers a scheduled job; overlap with
/// a job still in flight follows the orchestrator's overlap policy.
pub struct IngestScheduler {
    scheduler: JobScheduler,
}

impl IngestScheduler {
    /// Start the scheduler, or return `None` when scheduling is disabled.
    pub async fn start(orchestrator: IngestOrchestrator, config: &SchedulerConfig) -> Result<Option<Self>> {
        if !config.enabled {
            info!(subsystem = "jobs", component = "scheduler", "Scheduled ingestion disabled");
            return Ok(None);
        }

        let cron = normalize_cron(&config.cron)?;
        let timezone = parse_timezone(&config.timezone)?;

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| Error::Internal(format!("creating scheduler: {e}")))?;

        let job = Job::new_async_tz(cron.as_str(), timezone, move |_uuid, _scheduler| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                match orchestrator.trigger(TriggerKind::Scheduled, JobRequest::default()).await {
                    Ok(job_id) => info!(subsystem = "jobs", component = "scheduler", %job_id, "Scheduled ingestion triggered"),
                    Err(e) => warn!(subsystem = "jobs", component = "scheduler", error = %e, "Scheduled ingestion skipped"),
                }
            })
        })
        .map_err(|e| Error::Config(format!("invalid cron expression '{}': {e}", config.cron)))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| Error::Internal(format!("adding scheduler job: {e}")))?;
        scheduler
            .start()
            .await
            .map_err(|e| Error::Internal(format!("starting scheduler: {e}")))?;

        info!(
            subsystem = "jobs",
            component = "scheduler",
            cron = %cron,
            timezone = %timezone,
            "Scheduled ingestion enabled"
        );
        Ok(Some(Self { scheduler }))
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| Error::Internal(format!("stopping scheduler: {e}")))
    }
}
