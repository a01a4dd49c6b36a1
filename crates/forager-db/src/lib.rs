pub mod config;
pub mod database;
pub mod job_repository;
pub mod kv_store;

pub use config::DatabaseConfig;
pub use database::Database;
pub use job_repository::PgJobQueue;
pub use kv_store::PgKvStore;
