use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobCounts, JobState, NewJob, SubmitOutcome};

/// Durable, priority-ordered, deduplicating queue of scrape jobs.
///
/// Implementations must make `submit` an atomic check-and-insert on the
/// dedupe key (unique among non-terminal jobs) and `claim` an atomic
/// take — `SELECT FOR UPDATE SKIP LOCKED` or equivalent — so two workers
/// never hold the same job.
pub trait JobQueue: Send + Sync + Clone {
    /// Enqueue a job, or return the existing non-terminal job with the
    /// same dedupe key. Submission is idempotent while an equivalent job
    /// is waiting, active, or delayed.
    fn submit(&self, job: NewJob) -> impl Future<Output = Result<SubmitOutcome, AppError>> + Send;

    /// Enqueue a batch, applying the dedupe rule across the batch and
    /// against already-queued jobs.
    fn submit_bulk(
        &self,
        jobs: Vec<NewJob>,
    ) -> impl Future<Output = Result<Vec<SubmitOutcome>, AppError>> + Send;

    /// Atomically claim the highest-priority ready job: waiting, or
    /// delayed with a due schedule, with attempts remaining. Stamps the
    /// processing-lock deadline. Returns `None` if nothing is ready.
    fn claim(&self, worker_id: &str) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Extend the processing lock of a job this worker holds. Returns
    /// `false` if the job is no longer active under this worker (e.g.,
    /// reclaimed as stalled).
    fn renew_lock(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn complete(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Record a failed run, consuming an attempt. With `retry_at` and
    /// attempts remaining the job is delayed for another run; otherwise it
    /// is terminally failed.
    fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Push a job to `at` without consuming an attempt — the scheduling
    /// path for maintenance windows, block backoff, and open circuits.
    fn reschedule(
        &self,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn cancel(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(&self, job_id: Uuid) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    fn list(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;

    /// Requeue active jobs whose processing lock expired without renewal,
    /// consuming an attempt; jobs out of attempts are terminally failed.
    /// Returns the number of jobs touched.
    fn reclaim_stalled(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Delete terminal jobs past their retention window. Returns the
    /// number purged.
    fn purge_expired(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn counts(&self) -> impl Future<Output = Result<JobCounts, AppError>> + Send;

    /// Release all jobs held by a specific worker (for graceful shutdown).
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}
