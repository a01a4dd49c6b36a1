use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// SQL migration statements, executed one at a time.
const MIGRATIONS: &[&str] = &[
    // 0001_kv_entries.sql
    r#"CREATE TABLE IF NOT EXISTS kv_entries (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at TIMESTAMPTZ
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_kv_entries_expires
        ON kv_entries(expires_at) WHERE expires_at IS NOT NULL"#,
    // 0002_scrape_jobs.sql
    r#"CREATE TABLE IF NOT EXISTS scrape_jobs (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        target_url VARCHAR NOT NULL,
        source VARCHAR(100) NOT NULL,
        domain VARCHAR(255) NOT NULL,
        dedupe_key VARCHAR(512) NOT NULL,
        payload JSONB NOT NULL DEFAULT 'null'::jsonb,
        priority SMALLINT NOT NULL DEFAULT 1,
        state VARCHAR(20) NOT NULL DEFAULT 'waiting',
        attempt_count INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        scheduled_at TIMESTAMPTZ,
        lock_expires_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        last_error TEXT,
        worker_id VARCHAR(255),
        CONSTRAINT chk_scrape_jobs_state CHECK (
            state IN ('waiting', 'active', 'delayed', 'completed', 'failed', 'cancelled')
        )
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_scrape_jobs_dedupe
        ON scrape_jobs(dedupe_key) WHERE state IN ('waiting', 'active', 'delayed')"#,
    r#"CREATE INDEX IF NOT EXISTS idx_scrape_jobs_ready
        ON scrape_jobs(priority, scheduled_at, created_at)
        WHERE state IN ('waiting', 'delayed')"#,
    r#"CREATE INDEX IF NOT EXISTS idx_scrape_jobs_active_lock
        ON scrape_jobs(lock_expires_at) WHERE state = 'active'"#,
    r#"CREATE INDEX IF NOT EXISTS idx_scrape_jobs_state
        ON scrape_jobs(state, created_at DESC)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_scrape_jobs_worker
        ON scrape_jobs(worker_id) WHERE state = 'active'"#,
];

/// Spins up a PostgreSQL container and returns a connected pool.
///
/// The `ContainerAsync` must be kept in scope for the test duration —
/// dropping it will stop the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "forager_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/forager_test");

    // Retry connection until container is fully ready
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    // Run migrations one statement at a time
    for migration in MIGRATIONS {
        sqlx::query(migration)
            .execute(&pool)
            .await
            .expect("Failed to run migration");
    }

    (pool, container)
}
