//! Bounded-retry orchestration with resilience-aware classification.
//!
//! [`RetryOrchestrator::run`] is the single path every outbound operation
//! goes through: circuit admission first (no network call against an open
//! circuit), rate-limiter pacing before each attempt, exponential backoff
//! between transient failures, and immediate propagation of scheduling
//! signals (maintenance windows, site blocks) and permanent failures.
//! Exactly one net circuit failure is recorded per exhausted run — not one
//! per attempt.

use std::time::Duration;

use crate::block_tracker::BlockEscalationTracker;
use crate::circuit_breaker::{CircuitBreaker, CircuitDecision};
use crate::error::AppError;
use crate::maintenance::MaintenanceDetector;
use crate::rate_limiter::RateLimiter;
use crate::store::KvStore;
use crate::traits::{FetchClient, FetchRequest, FetchResponse};

/// Exponential backoff policy for inline retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per run (the first attempt counts).
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self.multiplier = multiplier;
        self
    }

    /// Backoff before the retry following `attempt` (1-indexed):
    /// `min(initial × multiplier^(attempt−1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exp as i32);
        Duration::from_millis(ms as u64).min(self.max_backoff)
    }
}

/// Classification context for one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Circuit breaker granularity: the logical scraping target.
    pub source: String,
    /// Rate limiting and block escalation granularity: the network host.
    pub domain: String,
    /// Skip the rate limiter (e.g., replaying a cached fixture).
    pub skip_rate_limit: bool,
}

impl RunContext {
    pub fn new(source: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            domain: domain.into(),
            skip_rate_limit: false,
        }
    }

    pub fn skip_rate_limit(mut self) -> Self {
        self.skip_rate_limit = true;
        self
    }
}

/// The generic "attempt an operation safely" engine.
///
/// Holds handles to every coordination primitive; construct once at
/// process start and hand to workers.
#[derive(Clone)]
pub struct RetryOrchestrator<S: KvStore> {
    rate_limiter: RateLimiter<S>,
    circuit: CircuitBreaker<S>,
    maintenance: MaintenanceDetector,
    blocks: BlockEscalationTracker<S>,
    policy: RetryPolicy,
}

impl<S: KvStore> RetryOrchestrator<S> {
    pub fn new(
        rate_limiter: RateLimiter<S>,
        circuit: CircuitBreaker<S>,
        maintenance: MaintenanceDetector,
        blocks: BlockEscalationTracker<S>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            rate_limiter,
            circuit,
            maintenance,
            blocks,
            policy,
        }
    }

    pub fn circuit(&self) -> &CircuitBreaker<S> {
        &self.circuit
    }

    /// Execute `op` with bounded retries under the full resilience stack.
    ///
    /// `op` receives the 1-indexed attempt number. Scheduling signals
    /// ([`AppError::Maintenance`], [`AppError::Blocked`]) and
    /// [`AppError::Permanent`] are re-raised immediately without touching
    /// the circuit breaker. Transient failures retry with exponential
    /// backoff; when the last attempt fails, one circuit failure is
    /// recorded and the error re-raised.
    pub async fn run<T, F, Fut>(&self, ctx: &RunContext, mut op: F) -> Result<T, AppError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max_attempts = match self.circuit.check(&ctx.source).await? {
            CircuitDecision::Reject { retry_after } => {
                return Err(AppError::CircuitOpen {
                    source_name: ctx.source.clone(),
                    retry_after,
                });
            }
            // The half-open trial is a single request by definition.
            CircuitDecision::AllowProbe => 1,
            CircuitDecision::Allow => self.policy.max_retries.max(1),
        };

        let mut attempt = 1;
        loop {
            if !ctx.skip_rate_limit {
                self.rate_limiter.wait_for_next_request(&ctx.domain).await?;
            }

            match op(attempt).await {
                Ok(value) => {
                    self.circuit.record_success(&ctx.source).await;
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt >= max_attempts {
                        if e.should_trip_circuit() {
                            self.circuit.record_failure(&ctx.source).await;
                        }
                        return Err(e);
                    }
                    let backoff = self.policy.backoff(attempt);
                    tracing::warn!(
                        source = %ctx.source,
                        domain = %ctx.domain,
                        attempt,
                        max_attempts,
                        backoff_ms = %backoff.as_millis(),
                        error = %e,
                        "Transient failure, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Classify a raw fetch outcome into the error taxonomy.
    ///
    /// Maintenance markers win over status codes — maintenance pages are
    /// routinely served as 403 or 503, and "come back in N minutes" is the
    /// more specific signal.
    pub async fn classify(
        &self,
        domain: &str,
        response: FetchResponse,
    ) -> Result<FetchResponse, AppError> {
        self.maintenance.check(&response.body)?;

        match response.status {
            200..=299 => Ok(response),
            403 | 429 => Err(self.blocks.record_block(domain).await.into_error()),
            404 | 410 => Err(AppError::Permanent(format!(
                "resource gone upstream (HTTP {})",
                response.status
            ))),
            status if status >= 500 => Err(AppError::Transient(format!("HTTP {status}"))),
            status => Err(AppError::Permanent(format!("HTTP {status}"))),
        }
    }

    /// Fetch `request` through the full stack: admission, pacing, fetch,
    /// classification, retries.
    pub async fn run_fetch<F: FetchClient>(
        &self,
        ctx: &RunContext,
        client: &F,
        request: &FetchRequest,
    ) -> Result<FetchResponse, AppError> {
        self.run(ctx, |attempt| {
            let client = client.clone();
            let request = request.clone();
            async move {
                tracing::debug!(url = %request.url, attempt, "Fetching");
                let response = client.fetch(&request).await?;
                self.classify(&ctx.domain, response).await
            }
        })
        .await
    }
}
