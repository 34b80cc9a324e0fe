//! Repository for `worker_error_logs` and `system_error_logs`.

use kiln_core::types::Timestamp;
use sqlx::PgPool;

use crate::models::worker_error::{CreateWorkerErrorLog, SystemErrorLog, WorkerErrorLog};

const WORKER_COLUMNS: &str = "id, worker_id, message, status, recovery_attempts, occurred_at";

const SYSTEM_COLUMNS: &str = "id, component, message, occurred_at";

pub struct ErrorLogRepo;

impl ErrorLogRepo {
    pub async fn insert_worker_error(
        pool: &PgPool,
        input: &CreateWorkerErrorLog,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO worker_error_logs (worker_id, message, status, recovery_attempts, occurred_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(input.worker_id)
        .bind(&input.message)
        .bind(&input.status)
        .bind(input.recovery_attempts)
        .bind(input.occurred_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn insert_system_error(
        pool: &PgPool,
        component: &str,
        message: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO system_error_logs (component, message) VALUES ($1, $2)")
            .bind(component)
            .bind(message)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn list_worker_errors_since(
        pool: &PgPool,
        since: Timestamp,
    ) -> Result<Vec<WorkerErrorLog>, sqlx::Error> {
        let query = format!(
            "SELECT {WORKER_COLUMNS} FROM worker_error_logs \
             WHERE occurred_at >= $1 ORDER BY occurred_at DESC"
        );
        sqlx::query_as::<_, WorkerErrorLog>(&query)
            .bind(since)
            .fetch_all(pool)
            .await
    }

    pub async fn list_system_errors_since(
        pool: &PgPool,
        since: Timestamp,
    ) -> Result<Vec<SystemErrorLog>, sqlx::Error> {
        let query = format!(
            "SELECT {SYSTEM_COLUMNS} FROM system_error_logs \
             WHERE occurred_at >= $1 ORDER BY occurred_at DESC"
        );
        sqlx::query_as::<_, SystemErrorLog>(&query)
            .bind(since)
            .fetch_all(pool)
            .await
    }

    /// Delete both worker and system error rows older than `cutoff`.
    pub async fn delete_older_than(pool: &PgPool, cutoff: Timestamp) -> Result<u64, sqlx::Error> {
        let workers = sqlx::query("DELETE FROM worker_error_logs WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        let system = sqlx::query("DELETE FROM system_error_logs WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(workers.rows_affected() + system.rows_affected())
    }
}
