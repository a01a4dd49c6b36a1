//! Progressive backoff for site blocks.
//!
//! A 403-class response means the site is refusing us by policy — an IP
//! block, a bot-detection trip, a WAF rule. Retrying soon makes it worse,
//! and counting it against the circuit breaker conflates "they are blocking
//! us" with "the operation is broken". Instead, each consecutive block
//! escalates a per-domain resume delay; the counter lives in the shared
//! store so every worker process backs off together, and it expires after a
//! quiet period.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::store::KvStore;

/// Escalation schedule for consecutive blocks.
#[derive(Debug, Clone)]
pub struct BlockPolicy {
    /// Resume delays indexed by `min(count, len) - 1`.
    pub delays: Vec<Duration>,

    /// How long the consecutive-block counter survives without a new
    /// block. Refreshed on every block.
    pub counter_ttl: Duration,
}

impl Default for BlockPolicy {
    /// 1st block → 1 hour, 2nd → 6 hours, 3rd and beyond → 24 hours;
    /// counter resets after 48 hours without a block.
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(3600),
                Duration::from_secs(6 * 3600),
                Duration::from_secs(24 * 3600),
            ],
            counter_ttl: Duration::from_secs(48 * 3600),
        }
    }
}

impl BlockPolicy {
    pub fn with_delays(mut self, delays: Vec<Duration>) -> Self {
        self.delays = delays;
        self
    }

    pub fn with_counter_ttl(mut self, ttl: Duration) -> Self {
        self.counter_ttl = ttl;
        self
    }

    /// Delay for the given consecutive-block count (1-indexed, clamped).
    fn delay_for(&self, count: u32) -> Duration {
        let idx = (count.max(1) as usize).min(self.delays.len()) - 1;
        self.delays.get(idx).copied().unwrap_or(Duration::ZERO)
    }

    /// Maximum count the schedule distinguishes.
    fn max_tracked(&self) -> u32 {
        self.delays.len() as u32
    }
}

/// Outcome of recording a block: the escalation state for this domain.
#[derive(Debug, Clone)]
pub struct BlockBackoff {
    pub domain: String,
    /// Consecutive blocks within the TTL window, clamped at the schedule
    /// length.
    pub consecutive: u32,
    pub delay: Duration,
    pub resume_at: DateTime<Utc>,
}

impl BlockBackoff {
    /// Convert into the error the orchestrator propagates.
    pub fn into_error(self) -> AppError {
        AppError::Blocked {
            domain: self.domain,
            consecutive: self.consecutive,
            resume_at: self.resume_at,
        }
    }
}

/// Per-domain consecutive-block counter over the shared store.
#[derive(Clone)]
pub struct BlockEscalationTracker<S: KvStore> {
    store: S,
    policy: BlockPolicy,
}

impl<S: KvStore> BlockEscalationTracker<S> {
    pub fn new(store: S, policy: BlockPolicy) -> Self {
        Self { store, policy }
    }

    /// Record a detected block and compute the escalating resume delay.
    ///
    /// If the store is unreachable the block signal must still reschedule
    /// the job, so this degrades to the first-tier delay with a warning.
    pub async fn record_block(&self, domain: &str) -> BlockBackoff {
        let count = match self
            .store
            .incr(&counter_key(domain), Some(self.policy.counter_ttl))
            .await
        {
            Ok(n) => (n.max(1) as u32).min(self.policy.max_tracked()),
            Err(e) => {
                tracing::warn!(
                    domain = %domain,
                    error = %e,
                    "Block tracker store unreachable, assuming first block"
                );
                1
            }
        };

        let delay = self.policy.delay_for(count);
        let resume_at = Utc::now() + chrono::TimeDelta::from_std(delay).unwrap_or_default();

        tracing::warn!(
            domain = %domain,
            consecutive = count,
            delay_secs = delay.as_secs(),
            %resume_at,
            "Site block recorded, backing off"
        );

        BlockBackoff {
            domain: domain.to_string(),
            consecutive: count,
            delay,
            resume_at,
        }
    }

    /// Current consecutive-block count for a domain (0 if none tracked).
    pub async fn consecutive_blocks(&self, domain: &str) -> Result<u32, AppError> {
        Ok(self
            .store
            .get(&counter_key(domain))
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .map(|n| n.max(0) as u32)
            .unwrap_or(0))
    }

    /// Forget a domain's block history (e.g., after a manual unblock).
    pub async fn clear(&self, domain: &str) -> Result<(), AppError> {
        self.store.delete(&counter_key(domain)).await
    }
}

fn counter_key(domain: &str) -> String {
    format!("blocks:{domain}")
}
