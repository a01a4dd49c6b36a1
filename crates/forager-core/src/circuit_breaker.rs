//! Circuit breaker for scraping-source resilience.
//!
//! Protects against hammering a source that is failing, and coordinates
//! that protection across worker processes through the shared store.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[success]----------------------------+
//! ```
//!
//! The failure counter uses the store's atomic increment, so concurrent
//! workers never corrupt it — the worst race is the breaker opening one
//! observation late. The Open→HalfOpen transition is claimed with a
//! compare-and-delete plus put-if-absent, so exactly one process wins the
//! single trial request.

use std::time::Duration;

use chrono::Utc;

use crate::error::AppError;
use crate::store::KvStore;

/// Current state of a source's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - a single trial request is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Time to wait before an open circuit permits a trial request.
    pub open_timeout: Duration,

    /// When the shared store is unreachable, allow requests through with a
    /// warning instead of failing the run.
    pub fail_open: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(600),
            fail_open: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

/// What the breaker decided for an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Circuit closed, proceed normally.
    Allow,
    /// This caller won the half-open trial; exactly one attempt permitted.
    AllowProbe,
    /// Circuit open (or a trial is already in flight); do not call.
    Reject { retry_after: Duration },
}

/// Snapshot of a source's circuit for observability.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub source: String,
    pub state: CircuitState,
    pub consecutive_failures: i64,
    pub time_until_half_open: Option<Duration>,
}

// State marker stored under `circuit:{source}:state`.
enum Marker {
    Open { opened_at_ms: i64 },
    Probe { started_at_ms: i64 },
}

impl Marker {
    fn parse(raw: &str) -> Option<Self> {
        let (kind, ms) = raw.split_once(':')?;
        let ms = ms.parse().ok()?;
        match kind {
            "open" => Some(Marker::Open { opened_at_ms: ms }),
            "probe" => Some(Marker::Probe { started_at_ms: ms }),
            _ => None,
        }
    }
}

/// Shared-store circuit breaker, keyed by source name.
///
/// One handle serves every source: state lives under per-source keys and is
/// created lazily on first use. Construct once at process start and pass
/// explicitly to workers.
#[derive(Clone)]
pub struct CircuitBreaker<S: KvStore> {
    store: S,
    config: CircuitBreakerConfig,
}

impl<S: KvStore> CircuitBreaker<S> {
    pub fn new(store: S, config: CircuitBreakerConfig) -> Self {
        Self { store, config }
    }

    /// Admission check, handling the lazy Open → HalfOpen transition.
    ///
    /// Store errors degrade to [`CircuitDecision::Allow`] with a warning
    /// when `fail_open` is set.
    pub async fn check(&self, source: &str) -> Result<CircuitDecision, AppError> {
        match self.check_inner(source).await {
            Ok(decision) => Ok(decision),
            Err(e) if self.config.fail_open => {
                tracing::warn!(
                    circuit = %source,
                    error = %e,
                    "Circuit breaker store unreachable, allowing request through"
                );
                Ok(CircuitDecision::Allow)
            }
            Err(e) => Err(e),
        }
    }

    async fn check_inner(&self, source: &str) -> Result<CircuitDecision, AppError> {
        let state_key = state_key(source);
        let raw = match self.store.get(&state_key).await? {
            Some(raw) => raw,
            None => return Ok(CircuitDecision::Allow),
        };

        let timeout_ms = self.config.open_timeout.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();

        let stamp_ms = match Marker::parse(&raw) {
            Some(Marker::Open { opened_at_ms }) => opened_at_ms,
            Some(Marker::Probe { started_at_ms }) => started_at_ms,
            // Unrecognized marker: treat as closed rather than wedge the source.
            None => return Ok(CircuitDecision::Allow),
        };

        let elapsed_ms = now_ms - stamp_ms;
        if elapsed_ms < timeout_ms {
            return Ok(CircuitDecision::Reject {
                retry_after: Duration::from_millis((timeout_ms - elapsed_ms) as u64),
            });
        }

        // Timed out (an expired open marker, or a probe whose holder never
        // reported back): claim the single trial. The CAS pair means only
        // one process wins; losers keep rejecting until the trial resolves.
        if self.store.compare_and_delete(&state_key, &raw).await?
            && self
                .store
                .put_if_absent(
                    &state_key,
                    &format!("probe:{now_ms}"),
                    self.config.open_timeout * 2,
                )
                .await?
        {
            tracing::info!(
                circuit = %source,
                "Circuit breaker transitioning to half-open, trial permitted"
            );
            return Ok(CircuitDecision::AllowProbe);
        }

        Ok(CircuitDecision::Reject {
            retry_after: self.config.open_timeout,
        })
    }

    /// True only while the circuit is strictly Open and the open-timeout
    /// has not yet elapsed. Read-only: never claims the trial.
    pub async fn is_open(&self, source: &str) -> Result<bool, AppError> {
        Ok(self.state(source).await? == CircuitState::Open)
    }

    /// Current state as an observer would report it.
    pub async fn state(&self, source: &str) -> Result<CircuitState, AppError> {
        let raw = self.store.get(&state_key(source)).await?;
        let timeout_ms = self.config.open_timeout.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();

        Ok(match raw.as_deref().and_then(Marker::parse) {
            None => CircuitState::Closed,
            Some(Marker::Open { opened_at_ms }) if now_ms - opened_at_ms < timeout_ms => {
                CircuitState::Open
            }
            Some(Marker::Open { .. }) | Some(Marker::Probe { .. }) => CircuitState::HalfOpen,
        })
    }

    /// Record a successful request: counter reset, circuit closed.
    pub async fn record_success(&self, source: &str) {
        let result: Result<(), AppError> = async {
            self.store.delete(&failures_key(source)).await?;
            self.store.delete(&state_key(source)).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(circuit = %source, error = %e, "Failed to record circuit success");
        }
    }

    /// Record a failed request; may open the circuit.
    pub async fn record_failure(&self, source: &str) {
        if let Err(e) = self.record_failure_inner(source).await {
            tracing::warn!(circuit = %source, error = %e, "Failed to record circuit failure");
        }
    }

    async fn record_failure_inner(&self, source: &str) -> Result<(), AppError> {
        let failures = self.store.incr(&failures_key(source), None).await?;
        let state_key = state_key(source);
        let now_ms = Utc::now().timestamp_millis();

        match self
            .store
            .get(&state_key)
            .await?
            .as_deref()
            .and_then(Marker::parse)
        {
            Some(Marker::Probe { .. }) => {
                tracing::warn!(
                    circuit = %source,
                    "Circuit breaker trial failed, returning to open state"
                );
                self.store
                    .put(&state_key, &format!("open:{now_ms}"), None)
                    .await?;
            }
            Some(Marker::Open { .. }) => {}
            None => {
                if failures >= i64::from(self.config.failure_threshold) {
                    tracing::warn!(
                        circuit = %source,
                        failures,
                        "Circuit breaker opening after {} consecutive failures",
                        failures
                    );
                    self.store
                        .put(&state_key, &format!("open:{now_ms}"), None)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Manually close the circuit and clear its counter.
    pub async fn reset(&self, source: &str) -> Result<(), AppError> {
        tracing::info!(circuit = %source, "Circuit breaker manually reset");
        self.store.delete(&failures_key(source)).await?;
        self.store.delete(&state_key(source)).await?;
        Ok(())
    }

    pub async fn stats(&self, source: &str) -> Result<CircuitBreakerStats, AppError> {
        let state = self.state(source).await?;
        let consecutive_failures = self
            .store
            .get(&failures_key(source))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let time_until_half_open = if state == CircuitState::Open {
            let now_ms = Utc::now().timestamp_millis();
            self.store
                .get(&state_key(source))
                .await?
                .as_deref()
                .and_then(Marker::parse)
                .and_then(|m| match m {
                    Marker::Open { opened_at_ms } => {
                        let remaining =
                            self.config.open_timeout.as_millis() as i64 - (now_ms - opened_at_ms);
                        (remaining > 0).then(|| Duration::from_millis(remaining as u64))
                    }
                    Marker::Probe { .. } => None,
                })
        } else {
            None
        };

        Ok(CircuitBreakerStats {
            source: source.to_string(),
            state,
            consecutive_failures,
            time_until_half_open,
        })
    }
}

fn failures_key(source: &str) -> String {
    format!("circuit:{source}:failures")
}

fn state_key(source: &str) -> String {
    format!("circuit:{source}:state")
}
