//! Shared atomic key-value store abstraction.
//!
//! Every coordination primitive (rate limiter, circuit breaker, block
//! tracker, distributed lock) reads and writes through [`KvStore`], so all
//! worker processes observe one truth. The production implementation lives
//! in `forager-db` (PostgreSQL); [`MemoryStore`] serves single-process
//! deployments and tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Atomic key-value operations required for cross-process coordination.
///
/// Implementations must make `put_if_absent`, `compare_and_delete`, and
/// `incr` atomic with respect to concurrent callers — these three are the
/// primitives that locking, circuit accounting, and block counting are
/// built on.
pub trait KvStore: Send + Sync + Clone {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    /// Set a key, overwriting any existing value. `ttl = None` means the
    /// entry does not expire.
    fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Set a key only if it is absent (or expired). Returns `true` if the
    /// write happened. The basis of lock acquisition and probe claiming.
    fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Delete a key only if its current value equals `expected`. Returns
    /// `true` if the key was deleted.
    fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Atomically increment an integer counter, creating it at 1 if absent
    /// or expired. When `ttl` is given, the expiry is refreshed on every
    /// increment. Returns the post-increment value.
    fn incr(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), AppError>> + Send;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process [`KvStore`] backed by a `HashMap`.
///
/// Atomicity comes from the single mutex, which is held only for the
/// duration of each operation — never across an await point.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(e) if e.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(e) => Ok(Some(e.value.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let mut entries = self.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut entries = self.lock();
        if entries.get(key).is_some_and(|e| !e.is_expired()) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, AppError> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(e) if !e.is_expired() && e.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, AppError> {
        let mut entries = self.lock();
        let current = match entries.get(key) {
            Some(e) if !e.is_expired() => e.value.parse::<i64>().map_err(|_| {
                AppError::Store(format!("key '{key}' holds non-integer value '{}'", e.value))
            })?,
            _ => 0,
        };
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.lock().remove(key);
        Ok(())
    }
}
