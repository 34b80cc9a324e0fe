//! In-process store used when no `DATABASE_URL` is configured.
//!
//! Mirrors the Postgres semantics the orchestrator relies on: one running
//! session per model, terminal transitions guarded on `running`, and
//! age-based pruning.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::alert::PerformanceAlert;
use kiln_core::training::{EpochMetrics, SessionStatus};
use kiln_core::types::{DbId, Timestamp};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::performance::{PerformanceAlertRow, PerformanceSample};
use crate::models::session::{epoch_column, CreateSession, ProgressLog, TrainingSession};
use crate::models::worker_error::{CreateWorkerErrorLog, SystemErrorLog, WorkerErrorLog};
use crate::store::{ErrorLogStore, MetricsStore, StoreError, TrainingStore};

#[derive(Default)]
struct Tables {
    next_id: DbId,
    sessions: HashMap<DbId, TrainingSession>,
    progress: Vec<ProgressLog>,
    worker_errors: Vec<WorkerErrorLog>,
    system_errors: Vec<SystemErrorLog>,
    samples: Vec<PerformanceSample>,
    alerts: Vec<PerformanceAlertRow>,
}

impl Tables {
    fn next_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of session rows ever created for `model_id`.
    pub async fn session_count(&self, model_id: DbId) -> usize {
        self.tables
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.model_id == model_id)
            .count()
    }

    pub async fn worker_error_logs(&self) -> Vec<WorkerErrorLog> {
        self.tables.lock().await.worker_errors.clone()
    }

    pub async fn system_error_logs(&self) -> Vec<SystemErrorLog> {
        self.tables.lock().await.system_errors.clone()
    }

    pub async fn alerts(&self) -> Vec<PerformanceAlertRow> {
        self.tables.lock().await.alerts.clone()
    }

    pub async fn sample_count(&self) -> usize {
        self.tables.lock().await.samples.len()
    }
}

#[async_trait]
impl TrainingStore for MemoryStore {
    async fn create_session(&self, input: &CreateSession) -> Result<TrainingSession, StoreError> {
        let config = serde_json::to_value(&input.config)?;
        let mut t = self.tables.lock().await;
        if t
            .sessions
            .values()
            .any(|s| s.model_id == input.model_id && s.is_running())
        {
            return Err(StoreError::Conflict(format!(
                "model {} already has a running session",
                input.model_id
            )));
        }

        let now = Utc::now();
        let session = TrainingSession {
            id: t.next_id(),
            model_id: input.model_id,
            dataset_id: input.dataset_id,
            user_id: input.user_id,
            config,
            status: SessionStatus::Running.as_str().to_string(),
            current_epoch: 0,
            last_loss: None,
            last_accuracy: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            updated_at: now,
        };
        t.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn find_session(&self, session_id: DbId) -> Result<Option<TrainingSession>, StoreError> {
        Ok(self.tables.lock().await.sessions.get(&session_id).cloned())
    }

    async fn find_running_session(
        &self,
        model_id: DbId,
    ) -> Result<Option<TrainingSession>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .sessions
            .values()
            .find(|s| s.model_id == model_id && s.is_running())
            .cloned())
    }

    async fn latest_session(&self, model_id: DbId) -> Result<Option<TrainingSession>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.model_id == model_id)
            .max_by_key(|s| (s.started_at, s.id))
            .cloned())
    }

    async fn append_progress(
        &self,
        session_id: DbId,
        metrics: &EpochMetrics,
    ) -> Result<(), StoreError> {
        let epoch = epoch_column(metrics.epoch)?;
        let mut t = self.tables.lock().await;
        if !t.sessions.contains_key(&session_id) {
            return Err(StoreError::NotFound {
                entity: "training session",
                id: session_id,
            });
        }
        let id = t.next_id();
        t.progress.push(ProgressLog {
            id,
            session_id,
            epoch,
            loss: metrics.loss,
            accuracy: metrics.accuracy,
            validation_loss: metrics.validation_loss,
            validation_accuracy: metrics.validation_accuracy,
            recorded_at: metrics.timestamp,
        });
        Ok(())
    }

    async fn update_session_metrics(
        &self,
        session_id: DbId,
        metrics: &EpochMetrics,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let session = t
            .sessions
            .get_mut(&session_id)
            .ok_or(StoreError::NotFound {
                entity: "training session",
                id: session_id,
            })?;
        session.apply_epoch(metrics)
    }

    async fn finish_session(
        &self,
        session_id: DbId,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut t = self.tables.lock().await;
        let Some(session) = t.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        if !session.is_running() {
            return Ok(false);
        }
        let now = Utc::now();
        session.status = status.as_str().to_string();
        session.error_message = error_message.map(str::to_string);
        session.completed_at = Some(now);
        session.updated_at = now;
        Ok(true)
    }

    async fn progress_logs(&self, session_id: DbId) -> Result<Vec<ProgressLog>, StoreError> {
        let mut logs: Vec<ProgressLog> = self
            .tables
            .lock()
            .await
            .progress
            .iter()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        logs.sort_by_key(|p| (p.epoch, p.id));
        Ok(logs)
    }
}

#[async_trait]
impl ErrorLogStore for MemoryStore {
    async fn record_worker_error(&self, input: &CreateWorkerErrorLog) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let id = t.next_id();
        t.worker_errors.push(WorkerErrorLog {
            id,
            worker_id: input.worker_id,
            message: input.message.clone(),
            status: input.status.clone(),
            recovery_attempts: input.recovery_attempts,
            occurred_at: input.occurred_at,
        });
        Ok(())
    }

    async fn record_system_error(&self, component: &str, message: &str) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let id = t.next_id();
        t.system_errors.push(SystemErrorLog {
            id,
            component: component.to_string(),
            message: message.to_string(),
            occurred_at: Utc::now(),
        });
        Ok(())
    }

    async fn prune_error_logs(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        let mut t = self.tables.lock().await;
        let before = t.worker_errors.len() + t.system_errors.len();
        t.worker_errors.retain(|e| e.occurred_at >= cutoff);
        t.system_errors.retain(|e| e.occurred_at >= cutoff);
        Ok((before - t.worker_errors.len() - t.system_errors.len()) as u64)
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn insert_sample(
        &self,
        metrics: &serde_json::Value,
        recorded_at: Timestamp,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let id = t.next_id();
        t.samples.push(PerformanceSample {
            id,
            metrics: metrics.clone(),
            recorded_at,
        });
        Ok(())
    }

    async fn insert_alert(&self, alert: &PerformanceAlert) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .alerts
            .push(PerformanceAlertRow::from(alert));
        Ok(())
    }

    async fn resolve_alert(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut t = self.tables.lock().await;
        match t.alerts.iter_mut().find(|a| a.id == id && !a.resolved) {
            Some(alert) => {
                alert.resolved = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn prune_metrics(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        let mut t = self.tables.lock().await;
        let before = t.samples.len() + t.alerts.len();
        t.samples.retain(|s| s.recorded_at >= cutoff);
        t.alerts.retain(|a| a.raised_at >= cutoff || !a.resolved);
        Ok((before - t.samples.len() - t.alerts.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use kiln_core::training::TrainingConfig;

    fn create(model_id: DbId) -> CreateSession {
        CreateSession {
            model_id,
            dataset_id: 1,
            user_id: 42,
            config: TrainingConfig::default(),
        }
    }

    fn epoch(n: u32) -> EpochMetrics {
        EpochMetrics {
            epoch: n,
            loss: 1.0 / n as f64,
            accuracy: 0.1 * n as f64,
            validation_loss: None,
            validation_accuracy: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_running_session_conflicts() {
        let store = MemoryStore::new();
        store.create_session(&create(7)).await.unwrap();
        assert_matches!(
            store.create_session(&create(7)).await,
            Err(StoreError::Conflict(_))
        );
        assert_eq!(store.session_count(7).await, 1);
        store.create_session(&create(8)).await.unwrap();
    }

    #[tokio::test]
    async fn finish_is_guarded_on_running() {
        let store = MemoryStore::new();
        let s = store.create_session(&create(7)).await.unwrap();
        assert!(store
            .finish_session(s.id, SessionStatus::Stopped, None)
            .await
            .unwrap());
        assert!(!store
            .finish_session(s.id, SessionStatus::Completed, None)
            .await
            .unwrap());

        let s = store.find_session(s.id).await.unwrap().unwrap();
        assert_eq!(s.status().unwrap(), SessionStatus::Stopped);
        assert!(s.completed_at.is_some());
        assert!(store.find_running_session(7).await.unwrap().is_none());

        // A finished model can train again.
        store.create_session(&create(7)).await.unwrap();
    }

    #[tokio::test]
    async fn progress_updates_session_and_log() {
        let store = MemoryStore::new();
        let s = store.create_session(&create(1)).await.unwrap();
        for n in 1..=3 {
            store.append_progress(s.id, &epoch(n)).await.unwrap();
            store.update_session_metrics(s.id, &epoch(n)).await.unwrap();
        }
        let logs = store.progress_logs(s.id).await.unwrap();
        assert_eq!(logs.iter().map(|l| l.epoch).collect::<Vec<_>>(), vec![1, 2, 3]);

        let latest = store.latest_session(1).await.unwrap().unwrap();
        assert_eq!(latest.current_epoch, 3);
        assert_eq!(latest.last_accuracy, Some(0.1 * 3.0));
    }

    #[tokio::test]
    async fn epoch_beyond_column_range_is_rejected() {
        let store = MemoryStore::new();
        let s = store.create_session(&create(1)).await.unwrap();
        store.update_session_metrics(s.id, &epoch(2)).await.unwrap();

        let huge = epoch(u32::MAX);
        assert_matches!(
            store.update_session_metrics(s.id, &huge).await,
            Err(StoreError::OutOfRange { field: "epoch", value }) if value == u64::from(u32::MAX)
        );
        assert_matches!(
            store.append_progress(s.id, &huge).await,
            Err(StoreError::OutOfRange { .. })
        );

        let latest = store.latest_session(1).await.unwrap().unwrap();
        assert_eq!(latest.current_epoch, 2);
        assert!(store.progress_logs(s.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_for_unknown_session_is_not_found() {
        let store = MemoryStore::new();
        assert_matches!(
            store.append_progress(99, &epoch(1)).await,
            Err(StoreError::NotFound { id: 99, .. })
        );
    }

    #[tokio::test]
    async fn prune_drops_old_error_rows() {
        let store = MemoryStore::new();
        let old = CreateWorkerErrorLog {
            worker_id: 1,
            message: "crash".into(),
            status: "failed".into(),
            recovery_attempts: 3,
            occurred_at: Utc::now() - chrono::Duration::hours(30),
        };
        store.record_worker_error(&old).await.unwrap();
        store.record_system_error("monitor", "boom").await.unwrap();

        let pruned = store
            .prune_error_logs(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.worker_error_logs().await.is_empty());
        assert_eq!(store.system_error_logs().await.len(), 1);
    }
}
