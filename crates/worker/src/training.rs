//! Training session lifecycle on top of the worker pool.
//!
//! [`TrainingService`] turns a start request into a queued `Train` task and
//! owns the single-flight set of models currently training. For every
//! session it spawns a watcher that drains the task's progress stream
//! (persist log row, update session, publish) and then performs the single
//! terminal transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_core::error::CoreError;
use kiln_core::task::{TaskKind, TaskProgress, TaskResult};
use kiln_core::training::{EpochMetrics, SessionStatus, TrainingConfig};
use kiln_core::types::DbId;
use kiln_db::models::session::{CreateSession, TrainingSession};
use kiln_db::{StoreError, TrainingStore};
use kiln_events::{EventBus, TrainingEvent};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pool::{PoolError, SubmitOptions, TaskHandle, WorkerPool};
use crate::recovery::ErrorHandler;

/// Attempts made to persist a session's terminal status.
const FINISH_ATTEMPTS: u32 = 3;
/// Delay before the first retry; doubled after each further failure.
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Recorded on a running row that no watcher in this process owns.
const ABANDONED_SESSION_MESSAGE: &str = "Session outcome was never recorded";

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("Model {0} is already training")]
    AlreadyTraining(DbId),

    #[error("Model {0} has no active training session")]
    NoActiveSession(DbId),

    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Entry of the single-flight set.
struct ActiveSession {
    /// `None` until the session row exists.
    session_id: Option<DbId>,
    cancel: CancellationToken,
}

/// How a session ended, decided from the task result.
#[derive(Debug, PartialEq)]
enum Outcome {
    Completed(Value),
    Failed(String),
    Stopped,
}

impl Outcome {
    fn status(&self) -> SessionStatus {
        match self {
            Outcome::Completed(_) => SessionStatus::Completed,
            Outcome::Failed(_) => SessionStatus::Failed,
            Outcome::Stopped => SessionStatus::Stopped,
        }
    }

    /// A run that returned a summary is judged by the summary alone: a
    /// stop request that lands after the last epoch does not relabel it.
    fn decide(result: Result<TaskResult, PoolError>, stop_requested: bool) -> Self {
        match result.map(TaskResult::into_value) {
            Ok(Ok(summary)) => {
                let stopped = summary
                    .get("stopped")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if stopped {
                    Outcome::Stopped
                } else {
                    Outcome::Completed(summary)
                }
            }
            Ok(Err(_)) | Err(_) if stop_requested => Outcome::Stopped,
            Ok(Err(message)) => Outcome::Failed(message),
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }
}

pub struct TrainingService {
    pool: Arc<WorkerPool>,
    store: Arc<dyn TrainingStore>,
    bus: Arc<EventBus>,
    errors: Option<Arc<ErrorHandler>>,
    active: Mutex<HashMap<DbId, ActiveSession>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl TrainingService {
    pub fn new(
        pool: Arc<WorkerPool>,
        store: Arc<dyn TrainingStore>,
        bus: Arc<EventBus>,
        errors: Option<Arc<ErrorHandler>>,
    ) -> Self {
        Self {
            pool,
            store,
            bus,
            errors,
            active: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Start training `model_id` and return the new session id.
    ///
    /// Returns as soon as the task is queued. Fails with
    /// [`TrainingError::AlreadyTraining`] while the model has a running
    /// session.
    pub async fn start_training(
        self: &Arc<Self>,
        model_id: DbId,
        dataset_id: DbId,
        user_id: DbId,
        config: TrainingConfig,
    ) -> Result<DbId, TrainingError> {
        config.validate()?;

        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            if active.contains_key(&model_id) {
                return Err(TrainingError::AlreadyTraining(model_id));
            }
            active.insert(
                model_id,
                ActiveSession {
                    session_id: None,
                    cancel: cancel.clone(),
                },
            );
        }

        match self
            .launch(model_id, dataset_id, user_id, config, cancel)
            .await
        {
            Ok(session_id) => Ok(session_id),
            Err(e) => {
                self.active.lock().await.remove(&model_id);
                Err(e)
            }
        }
    }

    async fn launch(
        self: &Arc<Self>,
        model_id: DbId,
        dataset_id: DbId,
        user_id: DbId,
        config: TrainingConfig,
        cancel: CancellationToken,
    ) -> Result<DbId, TrainingError> {
        // The caller holds this model's single-flight slot, so a running row
        // for it has no watcher left: its terminal write was lost.
        if let Some(stale) = self.store.find_running_session(model_id).await? {
            tracing::warn!(
                model_id,
                session_id = stale.id,
                "Closing running session that has no watcher"
            );
            self.store
                .finish_session(stale.id, SessionStatus::Failed, Some(ABANDONED_SESSION_MESSAGE))
                .await?;
        }

        let session = self
            .store
            .create_session(&CreateSession {
                model_id,
                dataset_id,
                user_id,
                config: config.clone(),
            })
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => TrainingError::AlreadyTraining(model_id),
                other => TrainingError::Store(other),
            })?;
        let session_id = session.id;

        if let Some(entry) = self.active.lock().await.get_mut(&model_id) {
            entry.session_id = Some(session_id);
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let handle = self.pool.submit_with(
            TaskKind::Train,
            json!({ "dataset_id": dataset_id, "config": config }),
            SubmitOptions {
                progress: Some(progress_tx),
                cancel: Some(cancel.clone()),
            },
        );
        tracing::info!(
            model_id,
            session_id,
            dataset_id,
            task_id = %handle.id(),
            epochs = config.epochs,
            "Training session started"
        );

        let watcher = Arc::clone(self).watch_session(model_id, session_id, handle, progress_rx, cancel);
        let join = match &self.errors {
            Some(errors) => errors.supervise("training", watcher),
            None => tokio::spawn(watcher),
        };
        let mut watchers = self.watchers.lock().await;
        watchers.retain(|h| !h.is_finished());
        watchers.push(join);

        Ok(session_id)
    }

    async fn watch_session(
        self: Arc<Self>,
        model_id: DbId,
        session_id: DbId,
        handle: TaskHandle,
        progress_rx: mpsc::UnboundedReceiver<TaskProgress>,
        cancel: CancellationToken,
    ) {
        let consumer = tokio::spawn(consume_progress(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            model_id,
            session_id,
            progress_rx,
        ));

        let result = handle.await;
        // The pool drops the listener with the task, so this ends once the
        // last progress message is handled.
        if let Err(e) = consumer.await {
            let message = format!("progress consumer for session {session_id} ended: {e}");
            match &self.errors {
                Some(errors) => errors.record_system_error("training", &message).await,
                None => tracing::error!(model_id, session_id, error = %e, "Progress consumer ended abnormally"),
            }
        }

        let outcome = Outcome::decide(result, cancel.is_cancelled());
        self.finalize(model_id, session_id, outcome).await;
    }

    /// Terminal transition. A session that is no longer running is left
    /// untouched and no event is published. The model leaves the
    /// single-flight set before the event goes out.
    async fn finalize(&self, model_id: DbId, session_id: DbId, outcome: Outcome) {
        let status = outcome.status();
        let error_message = match &outcome {
            Outcome::Failed(message) => Some(message.as_str()),
            _ => None,
        };

        let publish = match self.persist_outcome(session_id, status, error_message).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(model_id, session_id, "Session already terminal");
                false
            }
            Err(e) => {
                let message = format!(
                    "failed to persist {} outcome of session {session_id}: {e}",
                    status.as_str()
                );
                match &self.errors {
                    Some(errors) => errors.record_system_error("training", &message).await,
                    None => tracing::error!(
                        model_id,
                        session_id,
                        status = status.as_str(),
                        error = %e,
                        "Failed to persist session outcome"
                    ),
                }
                true
            }
        };

        {
            let mut active = self.active.lock().await;
            if active
                .get(&model_id)
                .is_some_and(|a| a.session_id == Some(session_id))
            {
                active.remove(&model_id);
            }
        }

        if publish {
            let event = match outcome {
                Outcome::Completed(summary) => {
                    tracing::info!(model_id, session_id, "Training session completed");
                    TrainingEvent::completed(model_id, session_id, summary)
                }
                Outcome::Failed(message) => {
                    tracing::error!(model_id, session_id, error = %message, "Training session failed");
                    TrainingEvent::failed(model_id, session_id, &message)
                }
                Outcome::Stopped => {
                    tracing::info!(model_id, session_id, "Training session stopped");
                    TrainingEvent::stopped(model_id, session_id)
                }
            };
            self.bus.publish(event);
        }
    }

    /// `finish_session` with bounded retries and exponential backoff.
    async fn persist_outcome(
        &self,
        session_id: DbId,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut delay = FINISH_RETRY_DELAY;
        let mut attempt = 1;
        loop {
            match self
                .store
                .finish_session(session_id, status, error_message)
                .await
            {
                Ok(changed) => return Ok(changed),
                Err(e) if attempt < FINISH_ATTEMPTS => {
                    tracing::warn!(session_id, attempt, error = %e, "Retrying session outcome write");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ask the running session of `model_id` to stop at its next epoch
    /// boundary. Repeated calls are harmless.
    pub async fn stop_training(&self, model_id: DbId) -> Result<(), TrainingError> {
        let active = self.active.lock().await;
        let session = active
            .get(&model_id)
            .ok_or(TrainingError::NoActiveSession(model_id))?;
        if !session.cancel.is_cancelled() {
            tracing::info!(model_id, session_id = ?session.session_id, "Stop requested");
            session.cancel.cancel();
        }
        Ok(())
    }

    /// The model's most recent session, running or not.
    pub async fn session_status(
        &self,
        model_id: DbId,
    ) -> Result<Option<TrainingSession>, TrainingError> {
        Ok(self.store.latest_session(model_id).await?)
    }

    pub async fn is_training(&self, model_id: DbId) -> bool {
        self.active.lock().await.contains_key(&model_id)
    }

    /// Model ids with a session in flight.
    pub async fn active_sessions(&self) -> Vec<DbId> {
        let mut ids: Vec<DbId> = self.active.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every active session and wait up to `timeout` for their
    /// watchers to record the outcome.
    pub async fn shutdown(&self, timeout: Duration) {
        let stopping = {
            let active = self.active.lock().await;
            for session in active.values() {
                session.cancel.cancel();
            }
            active.len()
        };
        let watchers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.watchers.lock().await);
        if tokio::time::timeout(timeout, futures::future::join_all(watchers))
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Training sessions did not finish before shutdown timeout"
            );
        }
        tracing::info!(stopping, "Training service stopped");
    }
}

/// Persist and publish each progress message of one session in order.
///
/// Store failures are logged; the stream keeps flowing.
async fn consume_progress(
    store: Arc<dyn TrainingStore>,
    bus: Arc<EventBus>,
    model_id: DbId,
    session_id: DbId,
    mut rx: mpsc::UnboundedReceiver<TaskProgress>,
) {
    while let Some(progress) = rx.recv().await {
        let metrics: EpochMetrics = match serde_json::from_value(progress.data.clone()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Ignoring malformed training progress");
                continue;
            }
        };

        if let Err(e) = store.append_progress(session_id, &metrics).await {
            tracing::error!(session_id, epoch = metrics.epoch, error = %e, "Failed to log training progress");
        }
        if let Err(e) = store.update_session_metrics(session_id, &metrics).await {
            tracing::error!(session_id, epoch = metrics.epoch, error = %e, "Failed to update session metrics");
        }
        tracing::debug!(
            model_id,
            session_id,
            epoch = metrics.epoch,
            loss = metrics.loss,
            accuracy = metrics.accuracy,
            "Training progress"
        );
        bus.publish(TrainingEvent::progress(model_id, session_id, progress.data));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use uuid::Uuid;

    fn ok(summary: Value) -> Result<TaskResult, PoolError> {
        Ok(TaskResult::succeeded(Uuid::new_v4(), summary))
    }

    #[test]
    fn completed_when_summary_not_stopped() {
        let outcome = Outcome::decide(ok(json!({"final_epoch": 3, "stopped": false})), false);
        assert_matches!(outcome, Outcome::Completed(v) if v["final_epoch"] == 3);
    }

    #[test]
    fn stopped_summary_wins() {
        let outcome = Outcome::decide(ok(json!({"stopped": true})), false);
        assert_eq!(outcome, Outcome::Stopped);
    }

    #[test]
    fn late_stop_request_keeps_finished_run_completed() {
        let outcome = Outcome::decide(ok(json!({"final_epoch": 5, "stopped": false})), true);
        assert_matches!(outcome, Outcome::Completed(v) if v["final_epoch"] == 5);
    }

    #[test]
    fn pool_errors_fail_the_session() {
        let outcome = Outcome::decide(Err(PoolError::TaskFailed("Dataset error: gone".into())), false);
        assert_matches!(outcome, Outcome::Failed(msg) if msg.contains("gone"));

        let crashed = Outcome::decide(
            Err(PoolError::WorkerCrashed {
                worker_id: 2,
                message: "boom".into(),
            }),
            false,
        );
        assert_eq!(crashed.status(), SessionStatus::Failed);
    }

    #[test]
    fn errors_after_stop_count_as_stopped() {
        let outcome = Outcome::decide(Err(PoolError::Terminated), true);
        assert_eq!(outcome, Outcome::Stopped);
    }
}
