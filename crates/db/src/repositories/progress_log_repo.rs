//! Repository for the `training_progress_logs` table (append-only).

use kiln_core::training::EpochMetrics;
use kiln_core::types::DbId;
use sqlx::PgPool;

use crate::models::session::ProgressLog;

const COLUMNS: &str = "\
    id, session_id, epoch, loss, accuracy, \
    validation_loss, validation_accuracy, recorded_at";

pub struct ProgressLogRepo;

impl ProgressLogRepo {
    pub async fn insert(
        pool: &PgPool,
        session_id: DbId,
        metrics: &EpochMetrics,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO training_progress_logs \
             (session_id, epoch, loss, accuracy, validation_loss, validation_accuracy, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(session_id)
        .bind(i32::try_from(metrics.epoch).map_err(|e| sqlx::Error::Encode(Box::new(e)))?)
        .bind(metrics.loss)
        .bind(metrics.accuracy)
        .bind(metrics.validation_loss)
        .bind(metrics.validation_accuracy)
        .bind(metrics.timestamp)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn list_for_session(
        pool: &PgPool,
        session_id: DbId,
    ) -> Result<Vec<ProgressLog>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM training_progress_logs \
             WHERE session_id = $1 ORDER BY epoch ASC, id ASC"
        );
        sqlx::query_as::<_, ProgressLog>(&query)
            .bind(session_id)
            .fetch_all(pool)
            .await
    }
}
