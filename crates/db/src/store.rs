//! Store traits consumed by the orchestrator and their Postgres backing.
//!
//! The orchestrator only sees `Arc<dyn TrainingStore>`, `Arc<dyn ErrorLogStore>`
//! and `Arc<dyn MetricsStore>`, so a [`PgStore`] and a
//! [`MemoryStore`](crate::MemoryStore) are interchangeable.

use async_trait::async_trait;
use kiln_core::alert::PerformanceAlert;
use kiln_core::training::{EpochMetrics, SessionStatus};
use kiln_core::types::{DbId, Timestamp};
use uuid::Uuid;

use crate::models::performance::PerformanceAlertRow;
use crate::models::session::{CreateSession, ProgressLog, TrainingSession};
use crate::models::worker_error::CreateWorkerErrorLog;
use crate::repositories::{ErrorLogRepo, PerformanceRepo, ProgressLogRepo, SessionRepo};
use crate::DbPool;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: DbId },

    /// A uniqueness rule was violated (e.g. second running session).
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A value does not fit the column it is stored in.
    #[error("{field} {value} is out of range")]
    OutOfRange { field: &'static str, value: u64 },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Database(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Session lifecycle rows and per-epoch progress logs.
#[async_trait]
pub trait TrainingStore: Send + Sync {
    /// Insert a running session. Fails with [`StoreError::Conflict`] if the
    /// model already has one.
    async fn create_session(&self, input: &CreateSession) -> Result<TrainingSession, StoreError>;

    async fn find_session(&self, session_id: DbId) -> Result<Option<TrainingSession>, StoreError>;

    async fn find_running_session(
        &self,
        model_id: DbId,
    ) -> Result<Option<TrainingSession>, StoreError>;

    async fn latest_session(&self, model_id: DbId) -> Result<Option<TrainingSession>, StoreError>;

    async fn append_progress(
        &self,
        session_id: DbId,
        metrics: &EpochMetrics,
    ) -> Result<(), StoreError>;

    async fn update_session_metrics(
        &self,
        session_id: DbId,
        metrics: &EpochMetrics,
    ) -> Result<(), StoreError>;

    /// Terminal transition guarded on the row still running. Returns
    /// whether this call performed the transition.
    async fn finish_session(
        &self,
        session_id: DbId,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn progress_logs(&self, session_id: DbId) -> Result<Vec<ProgressLog>, StoreError>;
}

/// Worker fault and orchestration failure logs.
#[async_trait]
pub trait ErrorLogStore: Send + Sync {
    async fn record_worker_error(&self, input: &CreateWorkerErrorLog) -> Result<(), StoreError>;

    async fn record_system_error(&self, component: &str, message: &str) -> Result<(), StoreError>;

    async fn prune_error_logs(&self, cutoff: Timestamp) -> Result<u64, StoreError>;
}

/// Performance samples and alerts.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn insert_sample(
        &self,
        metrics: &serde_json::Value,
        recorded_at: Timestamp,
    ) -> Result<(), StoreError>;

    async fn insert_alert(&self, alert: &PerformanceAlert) -> Result<(), StoreError>;

    async fn resolve_alert(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn prune_metrics(&self, cutoff: Timestamp) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

/// Postgres-backed store delegating to the repositories.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl TrainingStore for PgStore {
    async fn create_session(&self, input: &CreateSession) -> Result<TrainingSession, StoreError> {
        let config = serde_json::to_value(&input.config)?;
        Ok(SessionRepo::create(&self.pool, input, &config).await?)
    }

    async fn find_session(&self, session_id: DbId) -> Result<Option<TrainingSession>, StoreError> {
        Ok(SessionRepo::find_by_id(&self.pool, session_id).await?)
    }

    async fn find_running_session(
        &self,
        model_id: DbId,
    ) -> Result<Option<TrainingSession>, StoreError> {
        Ok(SessionRepo::find_running(&self.pool, model_id).await?)
    }

    async fn latest_session(&self, model_id: DbId) -> Result<Option<TrainingSession>, StoreError> {
        Ok(SessionRepo::find_latest(&self.pool, model_id).await?)
    }

    async fn append_progress(
        &self,
        session_id: DbId,
        metrics: &EpochMetrics,
    ) -> Result<(), StoreError> {
        Ok(ProgressLogRepo::insert(&self.pool, session_id, metrics).await?)
    }

    async fn update_session_metrics(
        &self,
        session_id: DbId,
        metrics: &EpochMetrics,
    ) -> Result<(), StoreError> {
        Ok(SessionRepo::update_metrics(&self.pool, session_id, metrics).await?)
    }

    async fn finish_session(
        &self,
        session_id: DbId,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        Ok(SessionRepo::finish(&self.pool, session_id, status, error_message).await?)
    }

    async fn progress_logs(&self, session_id: DbId) -> Result<Vec<ProgressLog>, StoreError> {
        Ok(ProgressLogRepo::list_for_session(&self.pool, session_id).await?)
    }
}

#[async_trait]
impl ErrorLogStore for PgStore {
    async fn record_worker_error(&self, input: &CreateWorkerErrorLog) -> Result<(), StoreError> {
        Ok(ErrorLogRepo::insert_worker_error(&self.pool, input).await?)
    }

    async fn record_system_error(&self, component: &str, message: &str) -> Result<(), StoreError> {
        Ok(ErrorLogRepo::insert_system_error(&self.pool, component, message).await?)
    }

    async fn prune_error_logs(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        Ok(ErrorLogRepo::delete_older_than(&self.pool, cutoff).await?)
    }
}

#[async_trait]
impl MetricsStore for PgStore {
    async fn insert_sample(
        &self,
        metrics: &serde_json::Value,
        recorded_at: Timestamp,
    ) -> Result<(), StoreError> {
        Ok(PerformanceRepo::insert_sample(&self.pool, metrics, recorded_at).await?)
    }

    async fn insert_alert(&self, alert: &PerformanceAlert) -> Result<(), StoreError> {
        let row = PerformanceAlertRow::from(alert);
        Ok(PerformanceRepo::insert_alert(&self.pool, &row).await?)
    }

    async fn resolve_alert(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(PerformanceRepo::resolve_alert(&self.pool, id).await?)
    }

    async fn prune_metrics(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        Ok(PerformanceRepo::delete_older_than(&self.pool, cutoff).await?)
    }
}
