//! Worker fault and orchestration failure log rows.

use kiln_core::recovery::WorkerErrorRecord;
use kiln_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `worker_error_logs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkerErrorLog {
    pub id: DbId,
    pub worker_id: i64,
    pub message: String,
    pub status: String,
    pub recovery_attempts: i32,
    pub occurred_at: Timestamp,
}

/// Insert DTO, a snapshot of a [`WorkerErrorRecord`] at write time.
#[derive(Debug, Clone)]
pub struct CreateWorkerErrorLog {
    pub worker_id: i64,
    pub message: String,
    pub status: String,
    pub recovery_attempts: i32,
    pub occurred_at: Timestamp,
}

impl From<&WorkerErrorRecord> for CreateWorkerErrorLog {
    fn from(r: &WorkerErrorRecord) -> Self {
        Self {
            worker_id: i64::from(r.worker_id),
            message: r.message.clone(),
            status: r.status.as_str().to_string(),
            recovery_attempts: i32::try_from(r.recovery_attempts).unwrap_or(i32::MAX),
            occurred_at: r.occurred_at,
        }
    }
}

/// A row from the `system_error_logs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SystemErrorLog {
    pub id: DbId,
    pub component: String,
    pub message: String,
    pub occurred_at: Timestamp,
}
