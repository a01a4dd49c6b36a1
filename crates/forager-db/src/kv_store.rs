//! PostgreSQL implementation of the shared atomic key-value store.
//!
//! Every operation is a single SQL statement, so atomicity comes from the
//! database: `put_if_absent` and `incr` are conditional upserts, and
//! `compare_and_delete` is a predicated delete. Expiry is a timestamp
//! column checked on read and overwritten by the conditional upserts —
//! expired rows behave as absent without a background reaper.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use forager_core::AppError;
use forager_core::store::KvStore;

/// PostgreSQL-backed [`KvStore`].
#[derive(Clone)]
pub struct PgKvStore {
    pool: Pool<Postgres>,
}

impl PgKvStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.map(|d| Utc::now() + chrono::TimeDelta::from_std(d).unwrap_or_default())
}

impl KvStore for PgKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT value FROM kv_entries
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(row.map(|(value,)| value))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError> {
        // The conditional upsert only overwrites an expired row; a live row
        // makes the statement affect zero rows.
        let result = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(Some(ttl)))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM kv_entries
            WHERE key = $1 AND value = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, AppError> {
        // An expired counter restarts at 1; otherwise the stored integer is
        // bumped. A ttl refreshes the expiry on every increment.
        let (value,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, '1', $2)
            ON CONFLICT (key) DO UPDATE
            SET value = CASE
                    WHEN kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= NOW()
                    THEN '1'
                    ELSE (kv_entries.value::bigint + 1)::text
                END,
                expires_at = COALESCE($2, kv_entries.expires_at)
            RETURNING value::bigint
            "#,
        )
        .bind(key)
        .bind(expiry(ttl))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        sqlx::query(r#"DELETE FROM kv_entries WHERE key = $1"#)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(())
    }
}
