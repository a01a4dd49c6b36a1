use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use forager_client::{HttpClientConfig, HttpFetchClient};
use forager_core::block_tracker::{BlockEscalationTracker, BlockPolicy};
use forager_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use forager_core::error::AppError;
use forager_core::job::{JobPriority, NewJob, QueueConfig, WorkerConfig};
use forager_core::job_queue::JobQueue;
use forager_core::lock::{LockConfig, LockManager};
use forager_core::maintenance::MaintenanceDetector;
use forager_core::rate_limiter::{RateLimitConfig, RateLimiter};
use forager_core::retry::{RetryOrchestrator, RetryPolicy};
use forager_core::traits::{CompletionSink, FetchResponse};
use forager_core::worker::{TracingWorkerReporter, WorkerPool, WorkerService};
use forager_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "forager", version, about = "Polite, resilient scrape orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a scrape job
    Submit {
        /// Target URL to scrape
        #[arg(short, long)]
        url: String,

        /// Logical scraping source (circuit breaker granularity)
        #[arg(short, long)]
        source: String,

        /// Upstream item id; combined with the domain into the dedupe key
        #[arg(short, long)]
        external_id: String,

        /// Job priority: high, medium, or low
        #[arg(short, long, default_value = "medium")]
        priority: JobPriority,

        /// Per-site parameters as inline JSON
        #[arg(long)]
        payload: Option<String>,

        /// Maximum runs before the job fails terminally
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Run a worker pool until interrupted
    Worker {
        /// In-flight jobs for this process
        #[arg(short, long, env = "FORAGER_CONCURRENCY", default_value_t = 3)]
        concurrency: usize,

        /// Stable worker id (defaults to a random one)
        #[arg(long, env = "FORAGER_WORKER_ID")]
        worker_id: Option<String>,

        /// Serialize jobs per source via the distributed lock
        #[arg(long)]
        serialize_per_source: bool,

        /// Minimum per-domain request spacing in seconds
        #[arg(long, env = "FORAGER_MIN_DELAY_SECS", default_value_t = 10)]
        min_delay_secs: u64,

        /// Maximum per-domain request spacing in seconds
        #[arg(long, env = "FORAGER_MAX_DELAY_SECS", default_value_t = 30)]
        max_delay_secs: u64,

        /// Per-domain request cap over the trailing hour
        #[arg(long, env = "FORAGER_HOURLY_CAP", default_value_t = 15)]
        hourly_cap: u32,
    },

    /// Show queue counts, and a source's circuit state if given
    Status {
        /// Source to show circuit breaker stats for
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Delete terminal jobs past their retention window
    Purge,

    /// Cancel a queued job
    Cancel {
        #[arg(short, long)]
        job_id: Uuid,
    },

    /// Manually close a source's circuit breaker
    ResetCircuit {
        #[arg(short, long)]
        source: String,
    },
}

/// Completion sink that logs outcomes. Deployments wanting durable
/// extraction results inject their own sink into [`WorkerService`].
#[derive(Clone, Copy)]
struct LoggingSink;

impl CompletionSink for LoggingSink {
    async fn on_success(
        &self,
        job: &forager_core::Job,
        response: &FetchResponse,
    ) -> Result<(), AppError> {
        tracing::info!(
            job_id = %job.id,
            url = %job.target_url,
            bytes = response.body.len(),
            "Fetched page delivered"
        );
        Ok(())
    }

    async fn on_permanent_failure(
        &self,
        job: &forager_core::Job,
        error: &AppError,
    ) -> Result<(), AppError> {
        tracing::error!(job_id = %job.id, url = %job.target_url, %error, "Job failed permanently");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("forager=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            url,
            source,
            external_id,
            priority,
            payload,
            max_attempts,
        } => {
            let db = connect_db().await?;
            cmd_submit(&db, url, source, external_id, priority, payload, max_attempts).await?;
        }
        Commands::Worker {
            concurrency,
            worker_id,
            serialize_per_source,
            min_delay_secs,
            max_delay_secs,
            hourly_cap,
        } => {
            let db = connect_db().await?;
            cmd_worker(
                &db,
                concurrency,
                worker_id,
                serialize_per_source,
                Duration::from_secs(min_delay_secs),
                Duration::from_secs(max_delay_secs),
                hourly_cap,
            )
            .await?;
        }
        Commands::Status { source } => {
            let db = connect_db().await?;
            cmd_status(&db, source).await?;
        }
        Commands::Purge => {
            let db = connect_db().await?;
            let purged = db
                .job_queue(QueueConfig::default())
                .purge_expired()
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("Purged {purged} expired jobs");
        }
        Commands::Cancel { job_id } => {
            let db = connect_db().await?;
            db.job_queue(QueueConfig::default())
                .cancel(job_id)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("Cancelled job {job_id}");
        }
        Commands::ResetCircuit { source } => {
            let db = connect_db().await?;
            CircuitBreaker::new(db.kv_store(), CircuitBreakerConfig::default())
                .reset(&source)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("Circuit for '{source}' reset to closed");
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and run migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db)
}

async fn cmd_submit(
    db: &Database,
    url: String,
    source: String,
    external_id: String,
    priority: JobPriority,
    payload: Option<String>,
    max_attempts: Option<u32>,
) -> Result<()> {
    let mut job = NewJob::new(url, source, external_id).with_priority(priority);
    if let Some(raw) = payload {
        let value: serde_json::Value =
            serde_json::from_str(&raw).context("Invalid JSON in --payload")?;
        job = job.with_payload(value);
    }
    if let Some(max) = max_attempts {
        job = job.with_max_attempts(max);
    }

    let outcome = db
        .job_queue(QueueConfig::default())
        .submit(job)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if outcome.deduplicated {
        println!(
            "Equivalent job already queued: {} ({})",
            outcome.job.id, outcome.job.state
        );
    } else {
        println!("Submitted job {}", outcome.job.id);
    }
    Ok(())
}

async fn cmd_worker(
    db: &Database,
    concurrency: usize,
    worker_id: Option<String>,
    serialize_per_source: bool,
    min_delay: Duration,
    max_delay: Duration,
    hourly_cap: u32,
) -> Result<()> {
    let store = db.kv_store();
    let queue = db.job_queue(QueueConfig::default());

    let orchestrator = RetryOrchestrator::new(
        RateLimiter::new(
            store.clone(),
            RateLimitConfig::default()
                .with_delays(min_delay, max_delay)
                .with_cap(hourly_cap, Duration::from_secs(3600)),
        ),
        CircuitBreaker::new(store.clone(), CircuitBreakerConfig::default()),
        MaintenanceDetector::default(),
        BlockEscalationTracker::new(store.clone(), BlockPolicy::default()),
        RetryPolicy::default(),
    );
    let locks = LockManager::new(store, LockConfig::default());
    let fetcher =
        HttpFetchClient::new(HttpClientConfig::default()).map_err(|e| anyhow::anyhow!(e))?;

    let mut config = WorkerConfig::default().with_concurrency(concurrency);
    if let Some(id) = worker_id {
        config = config.with_worker_id(id);
    }
    if serialize_per_source {
        config = config.serialize_per_source();
    }

    let service = WorkerService::new(queue, fetcher, LoggingSink, orchestrator, locks, config);
    let pool = WorkerPool::new(service);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    pool.run(cancel, Arc::new(TracingWorkerReporter))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

async fn cmd_status(db: &Database, source: Option<String>) -> Result<()> {
    let counts = db
        .job_queue(QueueConfig::default())
        .counts()
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    println!("Queue:");
    println!("  waiting    {}", counts.waiting);
    println!("  active     {}", counts.active);
    println!("  delayed    {}", counts.delayed);
    println!("  completed  {}", counts.completed);
    println!("  failed     {}", counts.failed);
    println!("  cancelled  {}", counts.cancelled);

    if let Some(source) = source {
        let stats = CircuitBreaker::new(db.kv_store(), CircuitBreakerConfig::default())
            .stats(&source)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        println!("\nCircuit '{}':", stats.source);
        println!("  state                 {}", stats.state);
        println!("  consecutive failures  {}", stats.consecutive_failures);
        if let Some(remaining) = stats.time_until_half_open {
            println!("  trial permitted in    {}s", remaining.as_secs());
        }
    }

    Ok(())
}
