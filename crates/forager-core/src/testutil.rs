//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks use
//! `Arc<Mutex<_>>` for interior mutability, allowing test assertions on
//! recorded calls. [`MemoryJobQueue`] is a complete in-memory [`JobQueue`]
//! with the real dedupe/priority/stall semantics, suitable for worker
//! tests and single-process deployments alike.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobCounts, JobPriority, JobState, NewJob, QueueConfig, SubmitOutcome};
use crate::job_queue::JobQueue;
use crate::store::KvStore;
use crate::traits::{CompletionSink, FetchClient, FetchRequest, FetchResponse};

// ---------------------------------------------------------------------------
// FailingStore
// ---------------------------------------------------------------------------

/// A [`KvStore`] whose every operation fails, for degraded-mode tests.
#[derive(Debug, Clone, Copy)]
pub struct FailingStore;

impl KvStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, AppError> {
        Err(AppError::Store("store unreachable".into()))
    }

    async fn put(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), AppError> {
        Err(AppError::Store("store unreachable".into()))
    }

    async fn put_if_absent(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<bool, AppError> {
        Err(AppError::Store("store unreachable".into()))
    }

    async fn compare_and_delete(&self, _key: &str, _expected: &str) -> Result<bool, AppError> {
        Err(AppError::Store("store unreachable".into()))
    }

    async fn incr(&self, _key: &str, _ttl: Option<Duration>) -> Result<i64, AppError> {
        Err(AppError::Store("store unreachable".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), AppError> {
        Err(AppError::Store("store unreachable".into()))
    }
}

// ---------------------------------------------------------------------------
// MockFetchClient
// ---------------------------------------------------------------------------

/// Mock fetch client that returns a configurable queue of responses.
///
/// Each call pops the first element; when the queue is empty, a 200 with a
/// default body is returned.
#[derive(Clone)]
pub struct MockFetchClient {
    responses: Arc<Mutex<Vec<Result<FetchResponse, AppError>>>>,
    calls: Arc<AtomicU32>,
}

impl MockFetchClient {
    pub fn new(status: u16, body: &str) -> Self {
        Self::with_responses(vec![Ok(FetchResponse::new(status, body))])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<FetchResponse, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Number of fetches performed so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FetchClient for MockFetchClient {
    async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(FetchResponse::new(200, "<html><body>default</body></html>"))
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Completion sink that records every delivery.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub successes: Arc<Mutex<Vec<(Uuid, u16)>>>,
    pub permanent_failures: Arc<Mutex<Vec<(Uuid, String)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompletionSink for RecordingSink {
    async fn on_success(&self, job: &Job, response: &FetchResponse) -> Result<(), AppError> {
        self.successes
            .lock()
            .unwrap()
            .push((job.id, response.status));
        Ok(())
    }

    async fn on_permanent_failure(&self, job: &Job, error: &AppError) -> Result<(), AppError> {
        self.permanent_failures
            .lock()
            .unwrap()
            .push((job.id, error.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryJobQueue
// ---------------------------------------------------------------------------

/// In-memory [`JobQueue`] with full dedupe, priority, and stall semantics.
#[derive(Clone)]
pub struct MemoryJobQueue {
    jobs: Arc<Mutex<Vec<Job>>>,
    config: QueueConfig,
}

impl MemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(Vec::new())),
            config,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl JobQueue for MemoryJobQueue {
    async fn submit(&self, job: NewJob) -> Result<SubmitOutcome, AppError> {
        let domain = job.domain()?;
        let dedupe_key = job.dedupe_key()?;
        let mut jobs = self.lock();

        if let Some(existing) = jobs
            .iter()
            .find(|j| j.dedupe_key == dedupe_key && !j.state.is_terminal())
        {
            return Ok(SubmitOutcome {
                job: existing.clone(),
                deduplicated: true,
            });
        }

        let now = Utc::now();
        let created = Job {
            id: Uuid::new_v4(),
            target_url: job.target_url,
            source: job.source,
            domain,
            dedupe_key,
            payload: job.payload,
            priority: job.priority,
            state: JobState::Waiting,
            attempt_count: 0,
            max_attempts: job.max_attempts.unwrap_or(self.config.default_max_attempts),
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            lock_expires_at: None,
            finished_at: None,
            last_error: None,
            worker_id: None,
        };
        jobs.push(created.clone());
        Ok(SubmitOutcome {
            job: created,
            deduplicated: false,
        })
    }

    async fn submit_bulk(&self, new_jobs: Vec<NewJob>) -> Result<Vec<SubmitOutcome>, AppError> {
        let mut outcomes = Vec::with_capacity(new_jobs.len());
        for job in new_jobs {
            outcomes.push(self.submit(job).await?);
        }
        Ok(outcomes)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, AppError> {
        let now = Utc::now();
        let mut jobs = self.lock();

        let pos = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| {
                j.attempt_count < j.max_attempts
                    && match j.state {
                        JobState::Waiting => true,
                        JobState::Delayed => j.scheduled_at.is_none_or(|at| at <= now),
                        _ => false,
                    }
            })
            .min_by_key(|(_, j)| {
                (
                    j.priority.weight(),
                    j.scheduled_at.unwrap_or(j.created_at),
                    j.created_at,
                )
            })
            .map(|(i, _)| i);

        Ok(pos.map(|i| {
            let job = &mut jobs[i];
            job.state = JobState::Active;
            job.worker_id = Some(worker_id.to_string());
            job.lock_expires_at = Some(
                now + chrono::TimeDelta::from_std(self.config.lock_duration).unwrap_or_default(),
            );
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn renew_lock(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let now = Utc::now();
        let mut jobs = self.lock();
        match jobs.iter_mut().find(|j| {
            j.id == job_id
                && j.state == JobState::Active
                && j.worker_id.as_deref() == Some(worker_id)
        }) {
            Some(job) => {
                job.lock_expires_at = Some(
                    now + chrono::TimeDelta::from_std(self.config.lock_duration)
                        .unwrap_or_default(),
                );
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), AppError> {
        let now = Utc::now();
        let mut jobs = self.lock();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            job.state = JobState::Completed;
            job.finished_at = Some(now);
            job.updated_at = now;
            job.worker_id = None;
            job.lock_expires_at = None;
            job.last_error = None;
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let mut jobs = self.lock();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            job.attempt_count += 1;
            job.last_error = Some(error.to_string());
            job.worker_id = None;
            job.lock_expires_at = None;
            job.updated_at = now;
            match retry_at {
                Some(at) if job.attempt_count < job.max_attempts => {
                    job.state = JobState::Delayed;
                    job.scheduled_at = Some(at);
                }
                _ => {
                    job.state = JobState::Failed;
                    job.finished_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn reschedule(&self, job_id: Uuid, at: chrono::DateTime<Utc>) -> Result<(), AppError> {
        let now = Utc::now();
        let mut jobs = self.lock();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id && !j.state.is_terminal()) {
            job.state = JobState::Delayed;
            job.scheduled_at = Some(at);
            job.worker_id = None;
            job.lock_expires_at = None;
            job.updated_at = now;
        }
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<(), AppError> {
        let now = Utc::now();
        let mut jobs = self.lock();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id && !j.state.is_terminal()) {
            job.state = JobState::Cancelled;
            job.finished_at = Some(now);
            job.updated_at = now;
            job.worker_id = None;
            job.lock_expires_at = None;
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        Ok(self.lock().iter().find(|j| j.id == job_id).cloned())
    }

    async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, AppError> {
        Ok(self
            .lock()
            .iter()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reclaim_stalled(&self) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut count = 0u64;
        let mut jobs = self.lock();
        for job in jobs.iter_mut() {
            if job.state == JobState::Active && job.lock_expires_at.is_some_and(|at| at < now) {
                job.attempt_count += 1;
                job.worker_id = None;
                job.lock_expires_at = None;
                job.updated_at = now;
                if job.attempt_count >= job.max_attempts {
                    job.state = JobState::Failed;
                    job.finished_at = Some(now);
                    job.last_error = Some("processing lock expired".to_string());
                } else {
                    job.state = JobState::Waiting;
                    job.scheduled_at = None;
                }
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        let now = Utc::now();
        let completed_cutoff =
            now - chrono::TimeDelta::from_std(self.config.completed_retention).unwrap_or_default();
        let failed_cutoff =
            now - chrono::TimeDelta::from_std(self.config.failed_retention).unwrap_or_default();

        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|j| match j.state {
            JobState::Completed => j.finished_at.is_none_or(|at| at >= completed_cutoff),
            JobState::Failed | JobState::Cancelled => {
                j.finished_at.is_none_or(|at| at >= failed_cutoff)
            }
            _ => true,
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn counts(&self) -> Result<JobCounts, AppError> {
        let jobs = self.lock();
        let mut counts = JobCounts::default();
        for job in jobs.iter() {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut count = 0u64;
        let mut jobs = self.lock();
        for job in jobs.iter_mut() {
            if job.state == JobState::Active && job.worker_id.as_deref() == Some(worker_id) {
                job.state = JobState::Waiting;
                job.worker_id = None;
                job.lock_expires_at = None;
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Create a dummy waiting Job for testing.
pub fn make_test_job() -> Job {
    Job {
        id: Uuid::new_v4(),
        target_url: "https://mart.example/item/42".to_string(),
        source: "bricks".to_string(),
        domain: "mart.example".to_string(),
        dedupe_key: "mart.example:42".to_string(),
        payload: serde_json::Value::Null,
        priority: JobPriority::Medium,
        state: JobState::Waiting,
        attempt_count: 0,
        max_attempts: 3,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        scheduled_at: None,
        lock_expires_at: None,
        finished_at: None,
        last_error: None,
        worker_id: None,
    }
}
