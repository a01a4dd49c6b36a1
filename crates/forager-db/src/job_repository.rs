//! PostgreSQL-backed job queue using `SELECT FOR UPDATE SKIP LOCKED` for
//! claiming and a partial unique index on the dedupe key for idempotent
//! submission.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use forager_core::AppError;
use forager_core::job::{
    Job, JobCounts, JobPriority, JobState, NewJob, QueueConfig, SubmitOutcome,
};
use forager_core::job_queue::JobQueue;

/// PostgreSQL [`JobQueue`] implementation.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: Pool<Postgres>,
    config: QueueConfig,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    target_url: String,
    source: String,
    domain: String,
    dedupe_key: String,
    payload: serde_json::Value,
    priority: i16,
    state: String,
    attempt_count: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    scheduled_at: Option<DateTime<Utc>>,
    lock_expires_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    worker_id: Option<String>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            target_url: row.target_url,
            source: row.source,
            domain: row.domain,
            dedupe_key: row.dedupe_key,
            payload: row.payload,
            priority: JobPriority::from_weight(row.priority),
            state: row.state.parse().unwrap_or(JobState::Waiting),
            attempt_count: row.attempt_count.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            scheduled_at: row.scheduled_at,
            lock_expires_at: row.lock_expires_at,
            finished_at: row.finished_at,
            last_error: row.last_error,
            worker_id: row.worker_id,
        }
    }
}

impl JobQueue for PgJobQueue {
    async fn submit(&self, job: NewJob) -> Result<SubmitOutcome, AppError> {
        let domain = job.domain()?;
        let dedupe_key = job.dedupe_key()?;
        let max_attempts = job.max_attempts.unwrap_or(self.config.default_max_attempts);

        // Check-and-insert races with concurrent submitters and with jobs
        // reaching a terminal state; a couple of rounds settles it.
        for _ in 0..3 {
            let inserted = sqlx::query_as::<_, JobRow>(
                r#"
                INSERT INTO scrape_jobs
                    (target_url, source, domain, dedupe_key, payload, priority, max_attempts)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (dedupe_key) WHERE state IN ('waiting', 'active', 'delayed')
                DO NOTHING
                RETURNING *
                "#,
            )
            .bind(&job.target_url)
            .bind(&job.source)
            .bind(&domain)
            .bind(&dedupe_key)
            .bind(&job.payload)
            .bind(job.priority.weight())
            .bind(max_attempts as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

            if let Some(row) = inserted {
                return Ok(SubmitOutcome {
                    job: row.into(),
                    deduplicated: false,
                });
            }

            let existing = sqlx::query_as::<_, JobRow>(
                r#"
                SELECT * FROM scrape_jobs
                WHERE dedupe_key = $1 AND state IN ('waiting', 'active', 'delayed')
                LIMIT 1
                "#,
            )
            .bind(&dedupe_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

            if let Some(row) = existing {
                return Ok(SubmitOutcome {
                    job: row.into(),
                    deduplicated: true,
                });
            }
        }

        Err(AppError::Database(format!(
            "submission race on dedupe key '{dedupe_key}' did not settle"
        )))
    }

    async fn submit_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<SubmitOutcome>, AppError> {
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            outcomes.push(self.submit(job).await?);
        }
        Ok(outcomes)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE scrape_jobs
            SET state = 'active', worker_id = $1,
                lock_expires_at = NOW() + make_interval(secs => $2),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM scrape_jobs
                WHERE (state = 'waiting'
                       OR (state = 'delayed' AND (scheduled_at IS NULL OR scheduled_at <= NOW())))
                  AND attempt_count < max_attempts
                ORDER BY priority ASC, COALESCE(scheduled_at, created_at) ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(self.config.lock_duration.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn renew_lock(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET lock_expires_at = NOW() + make_interval(secs => $3), updated_at = NOW()
            WHERE id = $1 AND worker_id = $2 AND state = 'active'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(self.config.lock_duration.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET state = 'completed', finished_at = NOW(), updated_at = NOW(),
                last_error = NULL, worker_id = NULL, lock_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        // Consumes an attempt. With retry_at and attempts remaining the job
        // is delayed; otherwise it is terminally failed.
        sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET attempt_count = attempt_count + 1,
                last_error = $2,
                worker_id = NULL,
                lock_expires_at = NULL,
                updated_at = NOW(),
                state = CASE
                    WHEN $3::timestamptz IS NOT NULL AND attempt_count + 1 < max_attempts
                    THEN 'delayed' ELSE 'failed'
                END,
                scheduled_at = CASE
                    WHEN $3::timestamptz IS NOT NULL AND attempt_count + 1 < max_attempts
                    THEN $3 ELSE scheduled_at
                END,
                finished_at = CASE
                    WHEN $3::timestamptz IS NOT NULL AND attempt_count + 1 < max_attempts
                    THEN finished_at ELSE NOW()
                END
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }

    async fn reschedule(&self, job_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET state = 'delayed', scheduled_at = $2, updated_at = NOW(),
                worker_id = NULL, lock_expires_at = NULL
            WHERE id = $1 AND state NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(job_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET state = 'cancelled', finished_at = NOW(), updated_at = NOW(),
                worker_id = NULL, lock_expires_at = NULL
            WHERE id = $1 AND state NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(r#"SELECT * FROM scrape_jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, AppError> {
        let rows = if let Some(state) = state {
            sqlx::query_as::<_, JobRow>(
                r#"
                SELECT * FROM scrape_jobs
                WHERE state = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(state.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, JobRow>(
                r#"
                SELECT * FROM scrape_jobs
                ORDER BY created_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn reclaim_stalled(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET attempt_count = attempt_count + 1,
                state = CASE
                    WHEN attempt_count + 1 >= max_attempts THEN 'failed' ELSE 'waiting'
                END,
                last_error = CASE
                    WHEN attempt_count + 1 >= max_attempts
                    THEN 'processing lock expired' ELSE last_error
                END,
                finished_at = CASE
                    WHEN attempt_count + 1 >= max_attempts THEN NOW() ELSE finished_at
                END,
                scheduled_at = CASE
                    WHEN attempt_count + 1 >= max_attempts THEN scheduled_at ELSE NULL
                END,
                worker_id = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            WHERE state = 'active' AND lock_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM scrape_jobs
            WHERE (state = 'completed'
                   AND finished_at < NOW() - make_interval(secs => $1))
               OR (state IN ('failed', 'cancelled')
                   AND finished_at < NOW() - make_interval(secs => $2))
            "#,
        )
        .bind(self.config.completed_retention.as_secs_f64())
        .bind(self.config.failed_retention.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn counts(&self) -> Result<JobCounts, AppError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as(r#"SELECT state, COUNT(*) FROM scrape_jobs GROUP BY state"#)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AppError::Database(e.to_string()))?;

        let mut counts = JobCounts::default();
        for (state, count) in rows {
            match state.parse() {
                Ok(JobState::Waiting) => counts.waiting = count,
                Ok(JobState::Active) => counts.active = count,
                Ok(JobState::Delayed) => counts.delayed = count,
                Ok(JobState::Completed) => counts.completed = count,
                Ok(JobState::Failed) => counts.failed = count,
                Ok(JobState::Cancelled) => counts.cancelled = count,
                Err(_) => tracing::warn!(%state, "Unknown job state in counts"),
            }
        }
        Ok(counts)
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET state = 'waiting', worker_id = NULL, lock_expires_at = NULL, updated_at = NOW()
            WHERE worker_id = $1 AND state = 'active'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
