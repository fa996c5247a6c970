//! # paperscope-db
//!
//! Storage layer for paperscope: the PostgreSQL knowledge graph, ingestion
//! job and checkpoint records, and in-memory equivalents of both.

pub mod graph;
pub mod jobs;
pub mod memory;
pub mod pool;

pub use graph::PgGraphRepository;
pub use jobs::PgJobRepository;
pub use memory::{MemoryGraphStore, MemoryJobStore};
pub use pool::{create_pool, PoolConfig};

use paperscope_core::{Error, Result};

/// Database handle bundling the PostgreSQL repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Knowledge graph repository.
    pub graph: PgGraphRepository,
    /// Ingestion jobs and checkpoints.
    pub jobs: PgJobRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            graph: PgGraphRepository::new(pool.clone()),
            jobs: PgJobRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect using the given URL and pool settings.
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self> {
        Ok(Self::new(create_pool(database_url, config).await?))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Cheap liveness probe.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}
