//! Distributed mutual exclusion over the shared store.
//!
//! Acquisition is an atomic "create key if absent, with expiry" in a
//! polling loop; release is a compare-and-delete on the owner token, so a
//! holder whose lock expired and was re-acquired elsewhere cannot steal it
//! back. If the store is unreachable the manager degrades to a logged
//! allow-through instead of blocking every operation — availability is
//! preferred over strict exclusion in that mode, and the policy is
//! explicit configuration, not a swallowed exception.

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AppError;
use crate::store::KvStore;

/// Configuration for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Interval between acquisition attempts while the lock is held.
    pub poll_interval: Duration,

    /// Default acquisition timeout for [`LockManager::with_lock`].
    pub default_timeout: Duration,

    /// Default lock expiry for [`LockManager::with_lock`].
    pub default_expiry: Duration,

    /// Degrade to a no-op allow-through when the store is unreachable.
    pub fail_open: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            default_timeout: Duration::from_secs(10),
            default_expiry: Duration::from_secs(60),
            fail_open: true,
        }
    }
}

impl LockConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_defaults(mut self, timeout: Duration, expiry: Duration) -> Self {
        self.default_timeout = timeout;
        self.default_expiry = expiry;
        self
    }

    pub fn strict(mut self) -> Self {
        self.fail_open = false;
        self
    }
}

/// Proof of lock ownership. Only the holder of the matching token can
/// release the underlying entry.
#[derive(Debug, Clone)]
pub struct LockGuard {
    resource: String,
    token: String,
    degraded: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The random owner token; never empty.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// True if this guard was handed out in store-unreachable degraded
    /// mode and protects nothing.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// Distributed lock manager.
#[derive(Clone)]
pub struct LockManager<S: KvStore> {
    store: S,
    config: LockConfig,
}

impl<S: KvStore> LockManager<S> {
    pub fn new(store: S, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Try to acquire the lock on `resource`, polling until `timeout`
    /// elapses. Returns `None` if the lock could not be acquired in time.
    pub async fn acquire(
        &self,
        resource: &str,
        timeout: Duration,
        expiry: Duration,
    ) -> Result<Option<LockGuard>, AppError> {
        let key = lock_key(resource);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;

        loop {
            match self.store.put_if_absent(&key, &token, expiry).await {
                Ok(true) => {
                    tracing::debug!(resource = %resource, "Lock acquired");
                    return Ok(Some(LockGuard {
                        resource: resource.to_string(),
                        token,
                        degraded: false,
                    }));
                }
                Ok(false) => {
                    if Instant::now() + self.config.poll_interval > deadline {
                        return Ok(None);
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) if self.config.fail_open => {
                    tracing::warn!(
                        resource = %resource,
                        error = %e,
                        "Lock store unreachable, proceeding without mutual exclusion"
                    );
                    return Ok(Some(LockGuard {
                        resource: resource.to_string(),
                        token,
                        degraded: true,
                    }));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release a held lock. A no-op (returns `false`) if the entry has
    /// expired and been re-acquired by someone else, or if the guard is
    /// degraded.
    pub async fn release(&self, guard: &LockGuard) -> Result<bool, AppError> {
        if guard.degraded {
            return Ok(false);
        }
        match self
            .store
            .compare_and_delete(&lock_key(&guard.resource), &guard.token)
            .await
        {
            Ok(released) => {
                if !released {
                    tracing::warn!(
                        resource = %guard.resource,
                        "Lock token no longer current at release, leaving entry alone"
                    );
                }
                Ok(released)
            }
            Err(e) if self.config.fail_open => {
                tracing::warn!(resource = %guard.resource, error = %e, "Lock release failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Run `op` while holding the lock on `resource`, using the configured
    /// default timeout and expiry. The lock is always released, including
    /// when `op` errors. Fails with [`AppError::LockUnavailable`] if the
    /// lock cannot be acquired.
    pub async fn with_lock<T, F, Fut>(&self, resource: &str, op: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let timeout = self.config.default_timeout;
        let guard = self
            .acquire(resource, timeout, self.config.default_expiry)
            .await?
            .ok_or_else(|| AppError::LockUnavailable {
                resource: resource.to_string(),
                waited: timeout,
            })?;

        let result = op().await;
        if let Err(e) = self.release(&guard).await {
            // The operation's outcome matters more than a failed release;
            // the entry expires on its own.
            tracing::warn!(resource = %resource, error = %e, "Lock release failed");
        }
        result
    }
}

fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::FailingStore;

    fn manager() -> LockManager<MemoryStore> {
        LockManager::new(
            MemoryStore::new(),
            LockConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn acquire_and_release_roundtrip() {
        let locks = manager();
        let guard = locks
            .acquire("listing:42", Duration::from_millis(100), Duration::from_secs(30))
            .await
            .unwrap()
            .expect("lock should be free");

        assert!(!guard.token().is_empty());
        assert!(locks.release(&guard).await.unwrap());

        // Released lock can be re-acquired immediately.
        let again = locks
            .acquire("listing:42", Duration::from_millis(100), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let locks = manager();
        let _guard = locks
            .acquire("listing:42", Duration::from_millis(100), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let contender = locks
            .acquire("listing:42", Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(contender.is_none());
    }

    #[tokio::test]
    async fn concurrent_acquires_exactly_one_wins() {
        let locks = manager();
        let (a, b) = tokio::join!(
            locks.acquire("listing:42", Duration::from_millis(50), Duration::from_secs(30)),
            locks.acquire("listing:42", Duration::from_millis(50), Duration::from_secs(30)),
        );
        let winners = [a.unwrap(), b.unwrap()]
            .into_iter()
            .flatten()
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn stale_release_does_not_steal_reacquired_lock() {
        let locks = manager();
        let stale = locks
            .acquire("listing:42", Duration::from_millis(50), Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();

        // Let the entry expire, then let another owner take it.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let current = locks
            .acquire("listing:42", Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        // The stale holder's release must be a no-op.
        assert!(!locks.release(&stale).await.unwrap());
        assert!(locks.release(&current).await.unwrap());
    }

    #[tokio::test]
    async fn different_resources_do_not_contend() {
        let locks = manager();
        let a = locks
            .acquire("listing:1", Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap();
        let b = locks
            .acquire("listing:2", Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn with_lock_runs_op_and_releases() {
        let locks = manager();
        let out = locks
            .with_lock("sweep", || async { Ok::<_, AppError>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);

        // Lock is free again.
        let guard = locks
            .acquire("sweep", Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(guard.is_some());
    }

    #[tokio::test]
    async fn with_lock_releases_even_when_op_fails() {
        let locks = manager();
        let err = locks
            .with_lock("sweep", || async {
                Err::<(), _>(AppError::Transient("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Transient(_)));

        let guard = locks
            .acquire("sweep", Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(guard.is_some());
    }

    #[tokio::test]
    async fn with_lock_reports_contention_distinctly() {
        let locks = LockManager::new(
            MemoryStore::new(),
            LockConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_defaults(Duration::from_millis(40), Duration::from_secs(30)),
        );
        let _held = locks
            .acquire("sweep", Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let err = locks
            .with_lock("sweep", || async { Ok::<_, AppError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LockUnavailable { .. }));
    }

    #[tokio::test]
    async fn store_failure_degrades_to_allow_through() {
        let locks = LockManager::new(FailingStore, LockConfig::default());
        let guard = locks
            .acquire("sweep", Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap()
            .expect("degraded mode hands out a pass-through guard");
        assert!(guard.is_degraded());
        assert!(!locks.release(&guard).await.unwrap());

        // with_lock still runs the operation in degraded mode.
        let out = locks
            .with_lock("sweep", || async { Ok::<_, AppError>(1) })
            .await
            .unwrap();
        assert_eq!(out, 1);
    }

    #[tokio::test]
    async fn strict_mode_propagates_store_error() {
        let locks = LockManager::new(FailingStore, LockConfig::default().strict());
        let err = locks
            .acquire("sweep", Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
    }
}
