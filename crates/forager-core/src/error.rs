use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Application-wide error taxonomy for Forager.
///
/// One closed variant per failure class. The retry orchestrator and the
/// worker match these exhaustively — there is no runtime property probing
/// to decide how an error should be handled.
#[derive(Error, Debug)]
pub enum AppError {
    /// Network-level or 5xx failure. Retried inline with backoff and,
    /// once retries are exhausted, counted against the circuit breaker.
    #[error("transient error: {0}")]
    Transient(String),

    /// Target site is in a maintenance window. Carries the padded
    /// estimate of when it comes back; the job is rescheduled, not retried.
    #[error("site maintenance, available again around {resume_at}")]
    Maintenance {
        resume_at: DateTime<Utc>,
        delay: Duration,
    },

    /// Target site is blocking us (403-class). Carries the escalating
    /// resume time computed from the consecutive-block counter.
    #[error("blocked by {domain} ({consecutive} consecutive), resume at {resume_at}")]
    Blocked {
        domain: String,
        consecutive: u32,
        resume_at: DateTime<Utc>,
    },

    /// The resource does not exist upstream or the request is malformed.
    /// Never retried; terminal job failure.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Circuit breaker for the source is open; no request was made.
    #[error("circuit '{source_name}' open, retry after {}s", .retry_after.as_secs())]
    CircuitOpen {
        source_name: String,
        retry_after: Duration,
    },

    /// Could not get exclusive access to a resource. Distinct from the
    /// protected operation failing.
    #[error("could not acquire lock on '{resource}' within {}ms", .waited.as_millis())]
    LockUnavailable { resource: String, waited: Duration },

    /// Shared coordination store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Invalid configuration or environment.
    #[error("config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// True if the orchestrator should retry this error inline with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Transient(_) | AppError::Store(_) | AppError::Database(_) => true,
            AppError::Maintenance { .. }
            | AppError::Blocked { .. }
            | AppError::Permanent(_)
            | AppError::CircuitOpen { .. }
            | AppError::LockUnavailable { .. }
            | AppError::Config(_)
            | AppError::Serialization(_) => false,
        }
    }

    /// True if this error should count against the circuit breaker.
    ///
    /// Maintenance windows and policy blocks are scheduling signals, not
    /// broken operations — conflating them with failures would open
    /// circuits that should simply wait out the downtime.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::Transient(_) | AppError::Store(_) | AppError::Database(_) => true,
            AppError::Maintenance { .. }
            | AppError::Blocked { .. }
            | AppError::Permanent(_)
            | AppError::CircuitOpen { .. }
            | AppError::LockUnavailable { .. }
            | AppError::Config(_)
            | AppError::Serialization(_) => false,
        }
    }

    /// The wall-clock time this error asks the job to be rescheduled for,
    /// if it carries one.
    pub fn reschedule_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AppError::Maintenance { resume_at, .. } | AppError::Blocked { resume_at, .. } => {
                Some(*resume_at)
            }
            AppError::CircuitOpen { retry_after, .. } => {
                Some(Utc::now() + chrono::TimeDelta::from_std(*retry_after).unwrap_or_default())
            }
            _ => None,
        }
    }
}
