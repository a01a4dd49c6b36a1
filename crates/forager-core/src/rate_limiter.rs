//! Per-domain request pacing for polite fetching.
//!
//! Enforces two independent constraints before every outbound request:
//! a randomized minimum spacing since the domain's last request (jitter
//! defeats fixed-interval fingerprinting), and a rolling request cap over
//! the trailing window. State lives in the shared [`KvStore`], so the
//! constraints hold across every worker process, not just within one.

use std::time::Duration;

use chrono::Utc;

use crate::error::AppError;
use crate::store::KvStore;

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum delay since the domain's last request.
    pub min_delay: Duration,

    /// Maximum delay; the effective spacing is uniformly sampled from
    /// `[min_delay, max_delay]` per wait.
    pub max_delay: Duration,

    /// Maximum requests per domain within the rolling `cap_window`.
    pub cap: u32,

    /// Length of the rolling cap window.
    pub cap_window: Duration,

    /// When the shared store is unreachable, allow the request through
    /// with a warning instead of failing. Availability over strict pacing.
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    /// 10–30s randomized spacing, 15 requests per rolling hour.
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            cap: 15,
            cap_window: Duration::from_secs(3600),
            fail_open: true,
        }
    }
}

impl RateLimitConfig {
    pub fn with_delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max;
        self
    }

    pub fn with_cap(mut self, cap: u32, window: Duration) -> Self {
        self.cap = cap;
        self.cap_window = window;
        self
    }

    pub fn strict(mut self) -> Self {
        self.fail_open = false;
        self
    }

    /// Sample the effective spacing for a single wait.
    fn effective_spacing(&self) -> Duration {
        let span = self.max_delay.saturating_sub(self.min_delay);
        if span.is_zero() {
            return self.min_delay;
        }
        let jitter_ms = rand_jitter_ms(span.as_millis() as u64 + 1);
        self.min_delay + Duration::from_millis(jitter_ms)
    }
}

/// Cross-process rate limiter over the shared store.
#[derive(Clone)]
pub struct RateLimiter<S: KvStore> {
    store: S,
    config: RateLimitConfig,
}

impl<S: KvStore> RateLimiter<S> {
    pub fn new(store: S, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Suspend until it is safe to issue the next request to `domain`,
    /// then record the request in the shared ledger.
    ///
    /// Worst case is an unbounded wait if misconfigured — callers needing
    /// a hard deadline wrap this in an outer timeout.
    pub async fn wait_for_next_request(&self, domain: &str) -> Result<(), AppError> {
        loop {
            let wait = match self.required_wait(domain).await {
                Ok(wait) => wait,
                Err(e) if self.config.fail_open => {
                    tracing::warn!(
                        domain = %domain,
                        error = %e,
                        "Rate limiter store unreachable, allowing request through"
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match wait {
                None => return Ok(()),
                Some(wait) => {
                    tracing::debug!(
                        domain = %domain,
                        wait_ms = %wait.as_millis(),
                        "Pacing request"
                    );
                    tokio::time::sleep(wait).await;
                    // Re-check: another process may have advanced the
                    // domain's ledger while we slept.
                }
            }
        }
    }

    /// Compute the wait still required, or record the request and return
    /// `None` if a slot is free now.
    async fn required_wait(&self, domain: &str) -> Result<Option<Duration>, AppError> {
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = self.config.cap_window.as_millis() as i64;

        let last_key = last_key(domain);
        let window_key = window_key(domain);

        let last: Option<i64> = self
            .store
            .get(&last_key)
            .await?
            .and_then(|v| v.parse().ok());

        let mut ledger: Vec<i64> = match self.store.get(&window_key).await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => Vec::new(),
        };
        ledger.retain(|&t| t > now_ms - window_ms);

        let spacing_wait = last
            .map(|l| l + self.config.effective_spacing().as_millis() as i64 - now_ms)
            .filter(|&w| w > 0);

        let cap_wait = if ledger.len() >= self.config.cap as usize {
            ledger
                .iter()
                .min()
                .map(|&oldest| oldest + window_ms - now_ms)
                .filter(|&w| w > 0)
        } else {
            None
        };

        match spacing_wait.into_iter().chain(cap_wait).max() {
            Some(wait_ms) => Ok(Some(Duration::from_millis(wait_ms as u64))),
            None => {
                ledger.push(now_ms);
                let ttl = Some(self.config.cap_window);
                self.store
                    .put(&window_key, &serde_json::to_string(&ledger)?, ttl)
                    .await?;
                self.store.put(&last_key, &now_ms.to_string(), ttl).await?;
                Ok(None)
            }
        }
    }
}

fn last_key(domain: &str) -> String {
    format!("ratelimit:{domain}:last")
}

fn window_key(domain: &str) -> String {
    format!("ratelimit:{domain}:window")
}

// ---------------------------------------------------------------------------
// Deterministic jitter based on std — avoids pulling in the `rand` crate.
// Uses a simple xorshift seeded from the current time.
// ---------------------------------------------------------------------------

fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
