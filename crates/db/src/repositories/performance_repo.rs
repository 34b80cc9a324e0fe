//! Repository for `performance_samples` and `performance_alerts`.

use kiln_core::types::Timestamp;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::performance::{PerformanceAlertRow, PerformanceSample};

const SAMPLE_COLUMNS: &str = "id, metrics, recorded_at";

const ALERT_COLUMNS: &str = "\
    id, alert_type, severity, threshold, current_value, resolved, raised_at";

pub struct PerformanceRepo;

impl PerformanceRepo {
    pub async fn insert_sample(
        pool: &PgPool,
        metrics: &serde_json::Value,
        recorded_at: Timestamp,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO performance_samples (metrics, recorded_at) VALUES ($1, $2)")
            .bind(metrics)
            .bind(recorded_at)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn list_samples_since(
        pool: &PgPool,
        since: Timestamp,
    ) -> Result<Vec<PerformanceSample>, sqlx::Error> {
        let query = format!(
            "SELECT {SAMPLE_COLUMNS} FROM performance_samples \
             WHERE recorded_at >= $1 ORDER BY recorded_at ASC"
        );
        sqlx::query_as::<_, PerformanceSample>(&query)
            .bind(since)
            .fetch_all(pool)
            .await
    }

    pub async fn insert_alert(pool: &PgPool, alert: &PerformanceAlertRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO performance_alerts \
             (id, alert_type, severity, threshold, current_value, resolved, raised_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(alert.id)
        .bind(&alert.alert_type)
        .bind(&alert.severity)
        .bind(alert.threshold)
        .bind(alert.current_value)
        .bind(alert.resolved)
        .bind(alert.raised_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn list_unresolved_alerts(
        pool: &PgPool,
    ) -> Result<Vec<PerformanceAlertRow>, sqlx::Error> {
        let query = format!(
            "SELECT {ALERT_COLUMNS} FROM performance_alerts \
             WHERE resolved = FALSE ORDER BY raised_at DESC"
        );
        sqlx::query_as::<_, PerformanceAlertRow>(&query)
            .fetch_all(pool)
            .await
    }

    /// Returns `false` if the alert does not exist or was already resolved.
    pub async fn resolve_alert(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE performance_alerts SET resolved = TRUE WHERE id = $1 AND resolved = FALSE",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete samples and resolved alerts older than `cutoff`.
    pub async fn delete_older_than(pool: &PgPool, cutoff: Timestamp) -> Result<u64, sqlx::Error> {
        let samples = sqlx::query("DELETE FROM performance_samples WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        let alerts = sqlx::query(
            "DELETE FROM performance_alerts WHERE raised_at < $1 AND resolved = TRUE",
        )
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(samples.rows_affected() + alerts.rows_affected())
    }
}
