use forager_core::AppError;
use forager_core::job::QueueConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::job_repository::PgJobQueue;
use crate::kv_store::PgKvStore;

/// Central database facade — owns the connection pool, runs migrations,
/// and vends the shared store and job queue.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get a [`PgKvStore`] backed by this pool.
    pub fn kv_store(&self) -> PgKvStore {
        PgKvStore::new(self.pool.clone())
    }

    /// Get a [`PgJobQueue`] backed by this pool.
    pub fn job_queue(&self, config: QueueConfig) -> PgJobQueue {
        PgJobQueue::new(self.pool.clone(), config)
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
