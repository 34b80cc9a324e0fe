//! Persistence for training sessions, error logs and performance data.
//!
//! - [`repositories`]: unit-struct repos with raw SQL against Postgres.
//! - [`store`]: the object-safe store traits the orchestrator depends on,
//!   plus [`PgStore`] which backs them with the repositories.
//! - [`memory`]: [`MemoryStore`], an in-process implementation used when
//!   no database is configured and in tests.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

pub use memory::MemoryStore;
pub use store::{ErrorLogStore, MetricsStore, PgStore, StoreError, TrainingStore};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to verify connectivity.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations from `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
