//! paperscope API server.
//!
//! Startup loads `.env`, initializes logging, opens the graph and job
//! stores, resumes jobs left unfinished by the previous process, starts the
//! cron scheduler and serves HTTP. On SIGINT/SIGTERM the server stops
//! accepting requests, the scheduler stops, and in-flight jobs are suspended
//! at their last checkpoint before the job store is flushed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paperscope_core::{defaults, GraphStore, JobStore};
use paperscope_db::{Database, MemoryGraphStore, MemoryJobStore, PoolConfig};
use paperscope_jobs::{IngestConfig, IngestOrchestrator, IngestScheduler};

const SHUTDOWN_GRACE_SECS: u64 = 30;

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // LOG_FORMAT - "text" (default) or "json"
    // LOG_FILE   - path to log file (optional, daily rotation)
    // RUST_LOG   - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "paperscope=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let dir = path.parent().unwrap_or(std::path::Path::new("."));
        let name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("paperscope.log");
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));

        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        } else {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

async fn open_stores() -> anyhow::Result<(Arc<dyn GraphStore>, Arc<dyn JobStore>)> {
    let store = std::env::var("PAPERSCOPE_STORE").unwrap_or_else(|_| "postgres".to_string());
    match store.as_str() {
        "memory" => {
            warn!("Using in-memory stores; graph and job records are lost on exit");
            Ok((Arc::new(MemoryGraphStore::new()), Arc::new(MemoryJobStore::new())))
        }
        "postgres" => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL is required when PAPERSCOPE_STORE=postgres")?;
            let db = Database::connect(&url, PoolConfig::from_env()).await?;
            db.migrate().await.context("running migrations")?;
            info!("Database connected and migrated");
            Ok((Arc::new(db.graph.clone()), Arc::new(db.jobs.clone())))
        }
        other => anyhow::bail!("unknown PAPERSCOPE_STORE '{other}', expected postgres or memory"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();

    let config = IngestConfig::from_env()?;
    if let Err(e) = config.validate() {
        // Jobs started with this configuration will be recorded as failed.
        warn!(error = %e, "Ingestion configuration is invalid");
    }

    let (graph, jobs) = open_stores().await?;
    let orchestrator = IngestOrchestrator::builder(config.clone(), graph, jobs).build()?;

    let resumed = orchestrator.resume_unfinished().await?;
    if resumed > 0 {
        info!(resumed, "Resumed unfinished ingestion jobs");
    }

    let scheduler = IngestScheduler::start(orchestrator.clone(), &config.scheduler).await?;

    let host = std::env::var("HOST").unwrap_or_else(|_| defaults::SERVER_HOST.to_string());
    let port: u16 = match std::env::var("PORT") {
        Ok(raw) => raw.parse().with_context(|| format!("invalid PORT '{raw}'"))?,
        Err(_) => defaults::SERVER_PORT,
    };
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    let app = paperscope_api::router(paperscope_api::AppState::new(orchestrator.clone()));
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(scheduler) = scheduler {
        if let Err(e) = scheduler.shutdown().await {
            warn!(error = %e, "Scheduler did not stop cleanly");
        }
    }
    orchestrator
        .shutdown(Duration::from_secs(SHUTDOWN_GRACE_SECS))
        .await?;
    info!("Shutdown complete");
    Ok(())
}
