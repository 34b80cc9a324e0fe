//! Training session and progress log rows.

use kiln_core::error::CoreError;
use kiln_core::training::{EpochMetrics, SessionStatus, TrainingConfig};
use kiln_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use crate::store::StoreError;

/// A row from the `training_sessions` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TrainingSession {
    pub id: DbId,
    pub model_id: DbId,
    pub dataset_id: DbId,
    pub user_id: DbId,
    pub config: serde_json::Value,
    pub status: String,
    pub current_epoch: i32,
    pub last_loss: Option<f64>,
    pub last_accuracy: Option<f64>,
    pub error_message: Option<String>,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl TrainingSession {
    pub fn status(&self) -> Result<SessionStatus, CoreError> {
        SessionStatus::parse(&self.status)
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running.as_str()
    }

    /// Mirror one epoch into the denormalized columns. Leaves the row
    /// untouched if the epoch does not fit.
    pub fn apply_epoch(&mut self, metrics: &EpochMetrics) -> Result<(), StoreError> {
        self.current_epoch = epoch_column(metrics.epoch)?;
        self.last_loss = Some(metrics.loss);
        self.last_accuracy = Some(metrics.accuracy);
        self.updated_at = metrics.timestamp;
        Ok(())
    }
}

/// Epoch as stored in the `INTEGER` epoch columns.
pub fn epoch_column(epoch: u32) -> Result<i32, StoreError> {
    i32::try_from(epoch).map_err(|_| StoreError::OutOfRange {
        field: "epoch",
        value: u64::from(epoch),
    })
}

/// Insert DTO for a new running session.
#[derive(Debug, Clone)]
pub struct CreateSession {
    pub model_id: DbId,
    pub dataset_id: DbId,
    pub user_id: DbId,
    pub config: TrainingConfig,
}

/// A row from the `training_progress_logs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProgressLog {
    pub id: DbId,
    pub session_id: DbId,
    pub epoch: i32,
    pub loss: f64,
    pub accuracy: f64,
    pub validation_loss: Option<f64>,
    pub validation_accuracy: Option<f64>,
    pub recorded_at: Timestamp,
}
