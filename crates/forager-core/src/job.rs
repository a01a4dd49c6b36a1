use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::AppError;
use crate::retry::RetryPolicy;

/// Scheduling priority of a scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    Medium,
    Low,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Medium => "medium",
            JobPriority::Low => "low",
        }
    }

    /// Ordering weight: lower claims first.
    pub fn weight(&self) -> i16 {
        match self {
            JobPriority::High => 0,
            JobPriority::Medium => 1,
            JobPriority::Low => 2,
        }
    }

    /// Inverse of [`weight`](Self::weight); unknown weights read as `Low`.
    pub fn from_weight(weight: i16) -> Self {
        match weight {
            0 => JobPriority::High,
            1 => JobPriority::Medium,
            _ => JobPriority::Low,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(JobPriority::High),
            "medium" => Ok(JobPriority::Medium),
            "low" => Ok(JobPriority::Low),
            _ => Err(format!("Unknown job priority: {}", s)),
        }
    }
}

/// State of a scrape job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Claimed by a worker, processing lock held.
    Active,
    /// Scheduled for a later time (retry backoff, maintenance window,
    /// block backoff).
    Delayed,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// A scrape job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub target_url: String,
    /// Circuit breaker granularity (a marketplace may span many URLs).
    pub source: String,
    /// Rate limiting and block escalation granularity.
    pub domain: String,
    /// `domain:external_id` — unique among non-terminal jobs.
    pub dedupe_key: String,
    /// Per-site parameters, opaque to the core.
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub state: JobState,
    /// Runs consumed so far. Incremented when a run fails or a stalled
    /// claim is reclaimed; never by maintenance/block reschedules.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time a delayed job becomes claimable.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Processing-lock deadline; a worker renews this while the job runs.
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Set when the job reaches a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub worker_id: Option<String>,
}

impl Job {
    /// True if a further run remains after the current one fails.
    pub fn can_retry(&self) -> bool {
        self.attempt_count + 1 < self.max_attempts
    }

    /// Wall-clock time for the next run, using job-level backoff indexed
    /// by the attempt about to be recorded.
    pub fn next_retry_at(&self, policy: &RetryPolicy) -> DateTime<Utc> {
        let delay = policy.backoff(self.attempt_count + 1);
        Utc::now() + chrono::TimeDelta::from_std(delay).unwrap_or_default()
    }
}

/// Request to enqueue a new scrape job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub target_url: String,
    pub source: String,
    /// Upstream item identifier; combined with the domain into the
    /// dedupe key.
    pub external_id: String,
    /// Override for the domain; derived from `target_url` when absent.
    pub domain: Option<String>,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(
        target_url: impl Into<String>,
        source: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            target_url: target_url.into(),
            source: source.into(),
            external_id: external_id.into(),
            domain: None,
            priority: JobPriority::Medium,
            payload: serde_json::Value::Null,
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// The network host this job targets.
    pub fn domain(&self) -> Result<String, AppError> {
        if let Some(domain) = &self.domain {
            return Ok(domain.clone());
        }
        let url = Url::parse(&self.target_url)
            .map_err(|e| AppError::Config(format!("invalid target URL '{}': {e}", self.target_url)))?;
        url.host_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::Config(format!("target URL '{}' has no host", self.target_url)))
    }

    /// Dedupe key: `domain:external_id`.
    pub fn dedupe_key(&self) -> Result<String, AppError> {
        Ok(format!("{}:{}", self.domain()?, self.external_id))
    }
}

/// Outcome of a submission: the job handle plus whether an equivalent
/// non-terminal job already existed.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job: Job,
    pub deduplicated: bool,
}

/// Queue totals for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: i64,
    pub active: i64,
    pub delayed: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

/// Durable-queue parameters shared by queue implementations.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Processing-lock duration stamped at claim time.
    pub lock_duration: Duration,

    /// How long completed jobs are retained before purging.
    pub completed_retention: Duration,

    /// How long failed jobs are retained before purging.
    pub failed_retention: Duration,

    pub default_max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(300),
            completed_retention: Duration::from_secs(24 * 3600),
            failed_retention: Duration::from_secs(7 * 24 * 3600),
            default_max_attempts: 3,
        }
    }
}

impl QueueConfig {
    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    pub fn with_retention(mut self, completed: Duration, failed: Duration) -> Self {
        self.completed_retention = completed;
        self.failed_retention = failed;
        self
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,

    /// In-flight jobs per process.
    pub concurrency: usize,

    /// Idle wait between claim attempts when the queue is empty.
    pub poll_interval: Duration,

    /// Processing-lock renewal cadence while a job runs.
    pub lock_renew_interval: Duration,

    /// Cadence of the stalled-reclaim / retention-purge sweep.
    pub stalled_check_interval: Duration,

    /// When set, each job runs under a distributed lock on its source, so
    /// only one worker anywhere touches a source's session at a time.
    pub serialize_per_source: bool,

    /// Job-level backoff between failed runs.
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            concurrency: 3,
            poll_interval: Duration::from_secs(5),
            lock_renew_interval: Duration::from_secs(30),
            stalled_check_interval: Duration::from_secs(30),
            serialize_per_source: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn serialize_per_source(mut self) -> Self {
        self.serialize_per_source = true;
        self
    }
}
