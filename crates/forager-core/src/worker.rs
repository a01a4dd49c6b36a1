//! Worker pool: claims jobs and executes them through the orchestrator.
//!
//! Each process runs a bounded pool of claim-process loops plus one sweep
//! loop (stalled-job reclaim and retention purge) guarded by a distributed
//! lock so only one process sweeps at a time. A job holds a renewable
//! processing lock while it runs; the renewal ticker lives alongside the
//! fetch so long-running jobs are not mistaken for stalled ones.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, WorkerConfig};
use crate::job_queue::JobQueue;
use crate::lock::LockManager;
use crate::retry::{RetryOrchestrator, RunContext};
use crate::store::KvStore;
use crate::traits::{CompletionSink, FetchClient, FetchRequest, FetchResponse};

/// Resource key guarding the cross-process queue sweep.
const SWEEP_LOCK: &str = "queue:sweep";

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling,
    JobClaimed {
        job: &'a Job,
    },
    JobStarted {
        job_id: Uuid,
        url: &'a str,
    },
    JobCompleted {
        job_id: Uuid,
    },
    /// A scheduling signal pushed the job to a later time without
    /// consuming an attempt.
    JobRescheduled {
        job_id: Uuid,
        resume_at: DateTime<Utc>,
        reason: &'a str,
    },
    JobFailed {
        job_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    SweepCompleted {
        reclaimed: u64,
        purged: u64,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::debug!("Polling for jobs");
            }
            WorkerEvent::JobClaimed { job } => {
                tracing::info!(job_id = %job.id, url = %job.target_url, priority = %job.priority, "Job claimed");
            }
            WorkerEvent::JobStarted { job_id, url } => {
                tracing::info!(%job_id, %url, "Processing job");
            }
            WorkerEvent::JobCompleted { job_id } => {
                tracing::info!(%job_id, "Job completed");
            }
            WorkerEvent::JobRescheduled {
                job_id,
                resume_at,
                reason,
            } => {
                tracing::info!(%job_id, %resume_at, %reason, "Job rescheduled");
            }
            WorkerEvent::JobFailed {
                job_id,
                error,
                will_retry,
            } => {
                tracing::warn!(%job_id, %error, %will_retry, "Job failed");
            }
            WorkerEvent::SweepCompleted { reclaimed, purged } => {
                tracing::info!(%reclaimed, %purged, "Queue sweep completed");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Single claim-process loop. [`WorkerPool`] runs several of these.
#[derive(Clone)]
pub struct WorkerService<Q, F, P, S>
where
    Q: JobQueue,
    F: FetchClient,
    P: CompletionSink,
    S: KvStore,
{
    queue: Q,
    fetcher: F,
    sink: P,
    orchestrator: RetryOrchestrator<S>,
    locks: LockManager<S>,
    config: WorkerConfig,
}

impl<Q, F, P, S> WorkerService<Q, F, P, S>
where
    Q: JobQueue,
    F: FetchClient,
    P: CompletionSink,
    S: KvStore,
{
    pub fn new(
        queue: Q,
        fetcher: F,
        sink: P,
        orchestrator: RetryOrchestrator<S>,
        locks: LockManager<S>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            fetcher,
            sink,
            orchestrator,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the claim-process loop until cancellation.
    pub async fn run<R: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &R,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling);

            match self.queue.claim(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    reporter.report(WorkerEvent::JobClaimed { job: &job });
                    self.process_job(&job, reporter).await;
                }
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        // Graceful shutdown: release all claimed jobs
        let released = self
            .queue
            .release_worker_jobs(&self.config.worker_id)
            .await
            .unwrap_or(0);

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            jobs_released: released,
        });
        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    /// Run the stalled-reclaim / retention-purge sweep until cancellation.
    ///
    /// The sweep runs under a distributed lock so that with many worker
    /// processes, only one sweeps per interval.
    pub async fn run_sweeper<R: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &R,
    ) -> Result<(), AppError> {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.stalled_check_interval) => {}
                () = cancel_token.cancelled() => return Ok(()),
            }

            let sweep = self
                .locks
                .with_lock(SWEEP_LOCK, || async {
                    let reclaimed = self.queue.reclaim_stalled().await?;
                    let purged = self.queue.purge_expired().await?;
                    Ok((reclaimed, purged))
                })
                .await;

            match sweep {
                Ok((reclaimed, purged)) => {
                    if reclaimed > 0 || purged > 0 {
                        reporter.report(WorkerEvent::SweepCompleted { reclaimed, purged });
                    }
                }
                Err(AppError::LockUnavailable { .. }) => {
                    tracing::debug!("Another process holds the sweep lock, skipping");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Queue sweep failed");
                }
            }
        }
    }

    async fn process_job<R: WorkerReporter>(&self, job: &Job, reporter: &R) {
        reporter.report(WorkerEvent::JobStarted {
            job_id: job.id,
            url: &job.target_url,
        });

        let outcome = self.execute(job).await;
        self.settle(job, outcome, reporter).await;
    }

    /// Execute the job's fetch through the orchestrator, renewing the
    /// queue's processing lock while it runs.
    async fn execute(&self, job: &Job) -> Result<FetchResponse, AppError> {
        let ctx = RunContext::new(&job.source, &job.domain);
        let request = FetchRequest::new(&job.target_url).with_payload(job.payload.clone());

        let run = async {
            if self.config.serialize_per_source {
                self.locks
                    .with_lock(&format!("source-session:{}", job.source), || async {
                        self.orchestrator
                            .run_fetch(&ctx, &self.fetcher, &request)
                            .await
                    })
                    .await
            } else {
                self.orchestrator
                    .run_fetch(&ctx, &self.fetcher, &request)
                    .await
            }
        };

        let renewal = async {
            let mut interval = tokio::time::interval(self.config.lock_renew_interval);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                match self.queue.renew_lock(job.id, &self.config.worker_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(job_id = %job.id, "Processing lock no longer held");
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Lock renewal failed");
                    }
                }
            }
        };

        tokio::select! {
            result = run => result,
            _ = renewal => unreachable!("renewal loop never completes"),
        }
    }

    /// Map the run outcome onto the queue, exhaustively over the taxonomy.
    async fn settle<R: WorkerReporter>(
        &self,
        job: &Job,
        outcome: Result<FetchResponse, AppError>,
        reporter: &R,
    ) {
        let error = match outcome {
            Ok(response) => match self.sink.on_success(job, &response).await {
                Ok(()) => {
                    reporter.report(WorkerEvent::JobCompleted { job_id: job.id });
                    if let Err(e) = self.queue.complete(job.id).await {
                        tracing::error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                    }
                    return;
                }
                // A failing sink is a failing run: the fetch result was
                // never delivered, so the job must run again.
                Err(e) => e,
            },
            Err(e) => e,
        };

        match &error {
            AppError::Maintenance { .. } | AppError::Blocked { .. } | AppError::CircuitOpen { .. } => {
                let resume_at = error.reschedule_at().unwrap_or_else(Utc::now);
                reporter.report(WorkerEvent::JobRescheduled {
                    job_id: job.id,
                    resume_at,
                    reason: reschedule_reason(&error),
                });
                if let Err(e) = self.queue.reschedule(job.id, resume_at).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to reschedule job");
                }
            }
            AppError::LockUnavailable { .. } => {
                // Source session contention: try again shortly.
                let resume_at = Utc::now()
                    + chrono::TimeDelta::from_std(self.config.poll_interval).unwrap_or_default();
                reporter.report(WorkerEvent::JobRescheduled {
                    job_id: job.id,
                    resume_at,
                    reason: "lock-contention",
                });
                if let Err(e) = self.queue.reschedule(job.id, resume_at).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to reschedule job");
                }
            }
            AppError::Permanent(_) | AppError::Config(_) | AppError::Serialization(_) => {
                self.fail_terminally(job, &error, reporter).await;
            }
            AppError::Transient(_) | AppError::Store(_) | AppError::Database(_) => {
                if job.can_retry() {
                    let error_msg = error.to_string();
                    reporter.report(WorkerEvent::JobFailed {
                        job_id: job.id,
                        error: &error_msg,
                        will_retry: true,
                    });
                    let retry_at = job.next_retry_at(&self.config.retry);
                    if let Err(e) = self.queue.fail(job.id, &error_msg, Some(retry_at)).await {
                        tracing::error!(job_id = %job.id, error = %e, "Failed to mark job for retry");
                    }
                } else {
                    self.fail_terminally(job, &error, reporter).await;
                }
            }
        }
    }

    async fn fail_terminally<R: WorkerReporter>(&self, job: &Job, error: &AppError, reporter: &R) {
        let error_msg = error.to_string();
        reporter.report(WorkerEvent::JobFailed {
            job_id: job.id,
            error: &error_msg,
            will_retry: false,
        });
        if let Err(e) = self.sink.on_permanent_failure(job, error).await {
            tracing::error!(job_id = %job.id, error = %e, "Permanent-failure sink errored");
        }
        if let Err(e) = self.queue.fail(job.id, &error_msg, None).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
        }
    }
}

fn reschedule_reason(error: &AppError) -> &'static str {
    match error {
        AppError::Maintenance { .. } => "maintenance",
        AppError::Blocked { .. } => "blocked",
        AppError::CircuitOpen { .. } => "circuit-open",
        _ => "rescheduled",
    }
}

/// Bounded pool of worker loops plus the guarded sweep loop.
pub struct WorkerPool<Q, F, P, S>
where
    Q: JobQueue + 'static,
    F: FetchClient + 'static,
    P: CompletionSink + 'static,
    S: KvStore + 'static,
{
    service: WorkerService<Q, F, P, S>,
}

impl<Q, F, P, S> WorkerPool<Q, F, P, S>
where
    Q: JobQueue + 'static,
    F: FetchClient + 'static,
    P: CompletionSink + 'static,
    S: KvStore + 'static,
{
    pub fn new(service: WorkerService<Q, F, P, S>) -> Self {
        Self { service }
    }

    /// Run `concurrency` claim-process loops and one sweep loop until the
    /// token is cancelled, then wait for all of them to drain.
    pub async fn run<R: WorkerReporter + 'static>(
        &self,
        cancel_token: CancellationToken,
        reporter: Arc<R>,
    ) -> Result<(), AppError> {
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..self.service.config.concurrency.max(1) {
            let service = self.service.clone();
            let cancel = cancel_token.clone();
            let reporter = Arc::clone(&reporter);
            tasks.spawn(async move { service.run(cancel, reporter.as_ref()).await });
        }

        {
            let service = self.service.clone();
            let cancel = cancel_token.clone();
            let reporter = Arc::clone(&reporter);
            tasks.spawn(async move { service.run_sweeper(cancel, reporter.as_ref()).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Worker loop exited with error"),
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::block_tracker::{BlockEscalationTracker, BlockPolicy};
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::job::{JobCounts, JobState, NewJob, QueueConfig};
    use crate::lock::LockConfig;
    use crate::maintenance::{MaintenanceConfig, MaintenanceDetector};
    use crate::rate_limiter::{RateLimitConfig, RateLimiter};
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use crate::testutil::{MemoryJobQueue, MockFetchClient, RecordingSink};

    type TestService = WorkerService<MemoryJobQueue, MockFetchClient, RecordingSink, MemoryStore>;

    fn service(
        store: MemoryStore,
        queue: MemoryJobQueue,
        fetcher: MockFetchClient,
        sink: RecordingSink,
    ) -> TestService {
        let orchestrator = RetryOrchestrator::new(
            RateLimiter::new(
                store.clone(),
                RateLimitConfig::default()
                    .with_delays(Duration::ZERO, Duration::ZERO)
                    .with_cap(100_000, Duration::from_secs(3600)),
            ),
            CircuitBreaker::new(store.clone(), CircuitBreakerConfig::default()),
            MaintenanceDetector::new(MaintenanceConfig::default()),
            BlockEscalationTracker::new(store.clone(), BlockPolicy::default()),
            RetryPolicy::default().with_backoff(
                Duration::from_millis(1),
                Duration::from_millis(4),
                2.0,
            ),
        );
        let locks = LockManager::new(
            store,
            LockConfig::default().with_poll_interval(Duration::from_millis(5)),
        );
        let mut config = WorkerConfig::default()
            .with_worker_id("test-worker")
            .with_poll_interval(Duration::from_millis(10));
        config.retry = RetryPolicy::default().with_backoff(
            Duration::from_millis(1),
            Duration::from_millis(4),
            2.0,
        );
        WorkerService::new(queue, fetcher, sink, orchestrator, locks, config)
    }

    /// Run the worker until `done(counts)` holds or the deadline passes.
    async fn drive(service: &TestService, done: impl Fn(&JobCounts) -> bool) {
        let cancel = CancellationToken::new();
        let svc = service.clone();
        let token = cancel.clone();
        let handle =
            tokio::spawn(async move { svc.run(token, &TracingWorkerReporter).await });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let counts = service.queue.counts().await.unwrap();
            if done(&counts) || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    fn new_job(external_id: &str) -> NewJob {
        NewJob::new(
            format!("https://mart.example/item/{external_id}"),
            "bricks",
            external_id,
        )
    }

    #[tokio::test]
    async fn successful_job_completes_and_notifies_sink() {
        let queue = MemoryJobQueue::default();
        let sink = RecordingSink::new();
        let svc = service(
            MemoryStore::new(),
            queue.clone(),
            MockFetchClient::new(200, "<html>listing</html>"),
            sink.clone(),
        );

        let submitted = queue.submit(new_job("42")).await.unwrap();
        drive(&svc, |c| c.completed == 1).await;

        let job = queue.get(submitted.job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(sink.successes.lock().unwrap().as_slice(), &[(job.id, 200)]);
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal_after_one_run() {
        let queue = MemoryJobQueue::default();
        let sink = RecordingSink::new();
        let fetcher = MockFetchClient::with_responses(vec![Ok(FetchResponse::new(404, "gone"))]);
        let svc = service(MemoryStore::new(), queue.clone(), fetcher.clone(), sink.clone());

        let submitted = queue.submit(new_job("42")).await.unwrap();
        drive(&svc, |c| c.failed == 1).await;

        let job = queue.get(submitted.job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(sink.permanent_failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn always_transient_job_exhausts_attempts_then_fails() {
        let queue = MemoryJobQueue::default();
        let sink = RecordingSink::new();
        // Every fetch returns 503; the queue retries the run until
        // max_attempts is spent.
        let fetcher = MockFetchClient::with_responses(
            std::iter::repeat_with(|| Ok(FetchResponse::new(503, "oops")))
                .take(64)
                .collect(),
        );
        let svc = service(MemoryStore::new(), queue.clone(), fetcher, sink.clone());

        let submitted = queue.submit(new_job("42")).await.unwrap();
        drive(&svc, |c| c.failed == 1).await;

        let job = queue.get(submitted.job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt_count, job.max_attempts);
        assert_eq!(sink.permanent_failures.lock().unwrap().len(), 1);
        assert!(sink.successes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn maintenance_page_reschedules_without_consuming_attempts() {
        let queue = MemoryJobQueue::default();
        let fetcher = MockFetchClient::new(
            503,
            "Scheduled maintenance. Available again in 10 minutes.",
        );
        let svc = service(
            MemoryStore::new(),
            queue.clone(),
            fetcher,
            RecordingSink::new(),
        );

        let submitted = queue.submit(new_job("42")).await.unwrap();
        drive(&svc, |c| c.delayed == 1).await;

        let job = queue.get(submitted.job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempt_count, 0);
        // 600s × 1.5 + 60s of padding, minus a little test slack.
        let resume = job.scheduled_at.unwrap();
        assert!(resume > Utc::now() + chrono::TimeDelta::seconds(900));
    }

    #[tokio::test]
    async fn block_response_reschedules_with_escalating_delay() {
        let queue = MemoryJobQueue::default();
        let fetcher = MockFetchClient::new(403, "forbidden");
        let svc = service(
            MemoryStore::new(),
            queue.clone(),
            fetcher,
            RecordingSink::new(),
        );

        let submitted = queue.submit(new_job("42")).await.unwrap();
        drive(&svc, |c| c.delayed == 1).await;

        let job = queue.get(submitted.job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempt_count, 0);
        // First block: one hour out.
        let resume = job.scheduled_at.unwrap();
        assert!(resume > Utc::now() + chrono::TimeDelta::minutes(55));
        assert!(resume < Utc::now() + chrono::TimeDelta::minutes(65));
    }

    #[tokio::test]
    async fn open_circuit_defers_job_without_fetching() {
        let store = MemoryStore::new();
        let queue = MemoryJobQueue::default();
        let fetcher = MockFetchClient::new(200, "unused");
        let svc = service(store.clone(), queue.clone(), fetcher.clone(), RecordingSink::new());

        // Trip the source's circuit before the worker sees the job.
        for _ in 0..5 {
            svc.orchestrator.circuit().record_failure("bricks").await;
        }

        let submitted = queue.submit(new_job("42")).await.unwrap();
        drive(&svc, |c| c.delayed == 1).await;

        let job = queue.get(submitted.job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn serialized_source_still_completes() {
        let queue = MemoryJobQueue::default();
        let sink = RecordingSink::new();
        let mut svc = service(
            MemoryStore::new(),
            queue.clone(),
            MockFetchClient::new(200, "<html>ok</html>"),
            sink.clone(),
        );
        svc.config.serialize_per_source = true;

        queue.submit(new_job("42")).await.unwrap();
        drive(&svc, |c| c.completed == 1).await;

        assert_eq!(sink.successes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pool_processes_jobs_concurrently_and_sweeps() {
        let store = MemoryStore::new();
        let queue = MemoryJobQueue::new(QueueConfig::default());
        let sink = RecordingSink::new();
        let mut svc = service(
            store,
            queue.clone(),
            MockFetchClient::with_responses(vec![]),
            sink.clone(),
        );
        svc.config.concurrency = 3;
        svc.config.stalled_check_interval = Duration::from_millis(20);

        for i in 0..6 {
            queue.submit(new_job(&i.to_string())).await.unwrap();
        }

        let pool = WorkerPool::new(svc);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            pool.run(token, Arc::new(TracingWorkerReporter)).await
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.counts().await.unwrap().completed < 6
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(queue.counts().await.unwrap().completed, 6);
        assert_eq!(sink.successes.lock().unwrap().len(), 6);
    }
}
