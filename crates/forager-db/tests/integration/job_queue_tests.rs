use std::time::Duration;

use chrono::Utc;
use forager_core::job::{JobPriority, JobState, NewJob, QueueConfig};
use forager_core::job_queue::JobQueue;
use forager_db::PgJobQueue;

use crate::common::setup_test_db;

fn test_job(external_id: &str) -> NewJob {
    NewJob::new(
        format!("https://mart.example/item/{external_id}"),
        "bricks",
        external_id,
    )
}

#[tokio::test]
async fn submit_and_verify_fields() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    let outcome = queue.submit(test_job("42")).await.unwrap();

    assert!(!outcome.deduplicated);
    let job = outcome.job;
    assert_eq!(job.target_url, "https://mart.example/item/42");
    assert_eq!(job.source, "bricks");
    assert_eq!(job.domain, "mart.example");
    assert_eq!(job.dedupe_key, "mart.example:42");
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.priority, JobPriority::Medium);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(job.max_attempts, 3);
    assert!(job.worker_id.is_none());
}

#[tokio::test]
async fn duplicate_submit_returns_existing_job() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    let first = queue.submit(test_job("42")).await.unwrap();
    let second = queue.submit(test_job("42")).await.unwrap();

    assert!(second.deduplicated);
    assert_eq!(first.job.id, second.job.id);
    assert_eq!(queue.counts().await.unwrap().waiting, 1);
}

#[tokio::test]
async fn dedupe_releases_after_completion() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    let first = queue.submit(test_job("42")).await.unwrap();
    queue.claim("w1").await.unwrap().unwrap();
    queue.complete(first.job.id).await.unwrap();

    let second = queue.submit(test_job("42")).await.unwrap();
    assert!(!second.deduplicated);
    assert_ne!(first.job.id, second.job.id);
}

#[tokio::test]
async fn submit_bulk_dedupes_within_batch() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    let outcomes = queue
        .submit_bulk(vec![test_job("1"), test_job("2"), test_job("1")])
        .await
        .unwrap();

    assert!(!outcomes[0].deduplicated);
    assert!(!outcomes[1].deduplicated);
    assert!(outcomes[2].deduplicated);
    assert_eq!(outcomes[0].job.id, outcomes[2].job.id);
}

#[tokio::test]
async fn claim_takes_highest_priority_first() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    queue
        .submit(test_job("low").with_priority(JobPriority::Low))
        .await
        .unwrap();
    queue
        .submit(test_job("high").with_priority(JobPriority::High))
        .await
        .unwrap();
    queue
        .submit(test_job("medium").with_priority(JobPriority::Medium))
        .await
        .unwrap();

    let first = queue.claim("w1").await.unwrap().unwrap();
    let second = queue.claim("w1").await.unwrap().unwrap();
    let third = queue.claim("w1").await.unwrap().unwrap();

    assert_eq!(first.priority, JobPriority::High);
    assert_eq!(second.priority, JobPriority::Medium);
    assert_eq!(third.priority, JobPriority::Low);
}

#[tokio::test]
async fn claim_sets_processing_lock() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    queue.submit(test_job("42")).await.unwrap();
    let claimed = queue.claim("w1").await.unwrap().unwrap();

    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
    assert!(claimed.lock_expires_at.unwrap() > Utc::now());

    // No second claim while the only job is active.
    assert!(queue.claim("w2").await.unwrap().is_none());
}

#[tokio::test]
async fn claim_returns_none_when_empty() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    assert!(queue.claim("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn delayed_job_not_claimable_until_due() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    let submitted = queue.submit(test_job("42")).await.unwrap();
    queue
        .reschedule(submitted.job.id, Utc::now() + chrono::TimeDelta::hours(1))
        .await
        .unwrap();
    assert!(queue.claim("w1").await.unwrap().is_none());

    queue
        .reschedule(submitted.job.id, Utc::now() - chrono::TimeDelta::seconds(1))
        .await
        .unwrap();
    assert!(queue.claim("w1").await.unwrap().is_some());
}

#[tokio::test]
async fn fail_with_retry_delays_job_and_counts_attempt() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    let submitted = queue.submit(test_job("42")).await.unwrap();
    queue.claim("w1").await.unwrap().unwrap();

    let retry_at = Utc::now() + chrono::TimeDelta::minutes(5);
    queue
        .fail(submitted.job.id, "HTTP 503", Some(retry_at))
        .await
        .unwrap();

    let job = queue.get(submitted.job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.last_error.as_deref(), Some("HTTP 503"));
    assert!(job.worker_id.is_none());
}

#[tokio::test]
async fn fail_without_retry_is_terminal() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    let submitted = queue.submit(test_job("42")).await.unwrap();
    queue.claim("w1").await.unwrap().unwrap();
    queue.fail(submitted.job.id, "HTTP 404", None).await.unwrap();

    let job = queue.get(submitted.job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 1);
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn fail_exhausting_attempts_ignores_retry_at() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    let submitted = queue
        .submit(test_job("42").with_max_attempts(1))
        .await
        .unwrap();
    queue.claim("w1").await.unwrap().unwrap();

    queue
        .fail(
            submitted.job.id,
            "HTTP 503",
            Some(Utc::now() + chrono::TimeDelta::minutes(5)),
        )
        .await
        .unwrap();

    let job = queue.get(submitted.job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 1);
}

#[tokio::test]
async fn reschedule_preserves_attempt_count() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    let submitted = queue.submit(test_job("42")).await.unwrap();
    queue.claim("w1").await.unwrap().unwrap();
    queue
        .reschedule(submitted.job.id, Utc::now() + chrono::TimeDelta::hours(6))
        .await
        .unwrap();

    let job = queue.get(submitted.job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.attempt_count, 0);
}

#[tokio::test]
async fn renew_lock_extends_deadline_for_owner_only() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    let submitted = queue.submit(test_job("42")).await.unwrap();
    let claimed = queue.claim("w1").await.unwrap().unwrap();

    assert!(queue.renew_lock(submitted.job.id, "w1").await.unwrap());
    assert!(!queue.renew_lock(submitted.job.id, "w2").await.unwrap());

    let job = queue.get(submitted.job.id).await.unwrap().unwrap();
    assert!(job.lock_expires_at.unwrap() >= claimed.lock_expires_at.unwrap());
}

#[tokio::test]
async fn stalled_jobs_are_reclaimed() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(
        pool,
        QueueConfig::default().with_lock_duration(Duration::from_millis(50)),
    );

    let submitted = queue.submit(test_job("42")).await.unwrap();
    queue.claim("w1").await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.reclaim_stalled().await.unwrap(), 1);

    let job = queue.get(submitted.job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.attempt_count, 1);
    assert!(job.worker_id.is_none());
}

#[tokio::test]
async fn stalled_job_out_of_attempts_moves_to_failed() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(
        pool,
        QueueConfig::default().with_lock_duration(Duration::from_millis(50)),
    );

    let submitted = queue
        .submit(test_job("42").with_max_attempts(1))
        .await
        .unwrap();
    queue.claim("w1").await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.reclaim_stalled().await.unwrap(), 1);

    let job = queue.get(submitted.job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.as_deref(), Some("processing lock expired"));
}

#[tokio::test]
async fn purge_removes_expired_terminal_jobs_only() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(
        pool,
        QueueConfig::default()
            .with_retention(Duration::from_millis(50), Duration::from_secs(600)),
    );

    let done = queue.submit(test_job("done")).await.unwrap();
    let failed = queue.submit(test_job("failed")).await.unwrap();
    let waiting = queue.submit(test_job("waiting")).await.unwrap();
    queue.complete(done.job.id).await.unwrap();
    queue.fail(failed.job.id, "nope", None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.purge_expired().await.unwrap(), 1);

    assert!(queue.get(done.job.id).await.unwrap().is_none());
    assert!(queue.get(failed.job.id).await.unwrap().is_some());
    assert!(queue.get(waiting.job.id).await.unwrap().is_some());
}

#[tokio::test]
async fn counts_reports_all_states() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    queue.submit(test_job("1")).await.unwrap();
    queue.submit(test_job("2")).await.unwrap();
    queue.submit(test_job("3")).await.unwrap();

    let claimed = queue.claim("w1").await.unwrap().unwrap();
    queue.complete(claimed.id).await.unwrap();
    queue.claim("w1").await.unwrap().unwrap();

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.active, 1);
    assert_eq!(counts.completed, 1);
}

#[tokio::test]
async fn release_worker_jobs_requeues_running_claims() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    queue.submit(test_job("1")).await.unwrap();
    queue.submit(test_job("2")).await.unwrap();
    queue.claim("w1").await.unwrap().unwrap();
    queue.claim("w2").await.unwrap().unwrap();

    assert_eq!(queue.release_worker_jobs("w1").await.unwrap(), 1);

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.active, 1);
}

#[tokio::test]
async fn concurrent_submits_of_same_key_yield_one_job() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, QueueConfig::default());

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let queue = queue.clone();
        tasks.spawn(async move { queue.submit(test_job("contested")).await.unwrap() });
    }

    let mut fresh = 0;
    while let Some(outcome) = tasks.join_next().await {
        if !outcome.unwrap().deduplicated {
            fresh += 1;
        }
    }

    assert_eq!(fresh, 1);
    assert_eq!(queue.counts().await.unwrap().waiting, 1);
}
