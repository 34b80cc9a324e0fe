//! Repository for the `training_sessions` table.

use kiln_core::training::{EpochMetrics, SessionStatus};
use kiln_core::types::DbId;
use sqlx::PgPool;

use crate::models::session::{CreateSession, TrainingSession};

/// Column list for `training_sessions` queries.
const COLUMNS: &str = "\
    id, model_id, dataset_id, user_id, config, status, \
    current_epoch, last_loss, last_accuracy, error_message, \
    started_at, completed_at, updated_at";

pub struct SessionRepo;

impl SessionRepo {
    /// Insert a new running session.
    ///
    /// The partial unique index on running `model_id` makes a concurrent
    /// second insert fail with a unique violation.
    pub async fn create(
        pool: &PgPool,
        input: &CreateSession,
        config: &serde_json::Value,
    ) -> Result<TrainingSession, sqlx::Error> {
        let query = format!(
            "INSERT INTO training_sessions (model_id, dataset_id, user_id, config, status) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, TrainingSession>(&query)
            .bind(input.model_id)
            .bind(input.dataset_id)
            .bind(input.user_id)
            .bind(config)
            .bind(SessionStatus::Running.as_str())
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: DbId,
    ) -> Result<Option<TrainingSession>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM training_sessions WHERE id = $1");
        sqlx::query_as::<_, TrainingSession>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_running(
        pool: &PgPool,
        model_id: DbId,
    ) -> Result<Option<TrainingSession>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM training_sessions \
             WHERE model_id = $1 AND status = $2"
        );
        sqlx::query_as::<_, TrainingSession>(&query)
            .bind(model_id)
            .bind(SessionStatus::Running.as_str())
            .fetch_optional(pool)
            .await
    }

    /// Most recently started session for a model, in any status.
    pub async fn find_latest(
        pool: &PgPool,
        model_id: DbId,
    ) -> Result<Option<TrainingSession>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM training_sessions \
             WHERE model_id = $1 \
             ORDER BY started_at DESC, id DESC \
             LIMIT 1"
        );
        sqlx::query_as::<_, TrainingSession>(&query)
            .bind(model_id)
            .fetch_optional(pool)
            .await
    }

    /// Mirror the latest epoch into the denormalized columns.
    pub async fn update_metrics(
        pool: &PgPool,
        id: DbId,
        metrics: &EpochMetrics,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE training_sessions \
             SET current_epoch = $2, last_loss = $3, last_accuracy = $4, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(i32::try_from(metrics.epoch).map_err(|e| sqlx::Error::Encode(Box::new(e)))?)
        .bind(metrics.loss)
        .bind(metrics.accuracy)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Move a running session to a terminal status.
    ///
    /// Guarded on `status = 'running'`; returns `false` if the session was
    /// already terminal, which makes duplicate signals a no-op.
    pub async fn finish(
        pool: &PgPool,
        id: DbId,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE training_sessions \
             SET status = $2, error_message = $3, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(SessionStatus::Running.as_str())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark every running session as failed. Used at startup to clear rows
    /// left behind by a previous process.
    pub async fn fail_orphaned(pool: &PgPool, message: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE training_sessions \
             SET status = $1, error_message = $2, completed_at = NOW(), updated_at = NOW() \
             WHERE status = $3",
        )
        .bind(SessionStatus::Failed.as_str())
        .bind(message)
        .bind(SessionStatus::Running.as_str())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
