//! Worker crash recovery and orchestration failure tracking.
//!
//! The [`ErrorHandler`] consumes [`WorkerFault`]s reported by the pool. For
//! each fault it opens a [`WorkerErrorRecord`] and drives it through
//! bounded, exponentially backed-off replacement attempts via the
//! [`WorkerRecovery`] seam. Every state change is written to the error log
//! store; store failures are logged and never interrupt recovery.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::error::CoreError;
use kiln_core::recovery::{
    backoff_delay, summarize_health, ErrorStatistics, HealthSummary, WorkerErrorRecord,
    WorkerErrorStatus,
};
use kiln_core::types::WorkerId;
use kiln_db::models::worker_error::CreateWorkerErrorLog;
use kiln_db::ErrorLogStore;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pool::context::panic_message;
use crate::pool::{FaultReceiver, PoolError, WorkerFault};

/// Pool operations the error handler needs to replace a worker.
#[async_trait]
pub trait WorkerRecovery: Send + Sync {
    /// Take a worker out of service. Unknown ids are reported as
    /// [`PoolError::UnknownWorker`].
    async fn retire_worker(&self, worker_id: WorkerId) -> Result<(), PoolError>;

    /// Spawn a fresh context in place of `failed`, returning its id.
    async fn spawn_replacement(&self, failed: WorkerId) -> Result<WorkerId, PoolError>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_backoff: Duration,
    /// How long settled records stay in memory.
    pub retention: Duration,
    pub cleanup_interval: Duration,
    /// Age beyond which persisted error log rows are pruned.
    pub log_retention: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            retention: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            log_retention: Duration::from_secs(24 * 3600),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Totals {
    observed: u64,
    failed: u64,
    recovered: u64,
    recovery_time: Duration,
    system_errors: u64,
}

#[derive(Default)]
struct HandlerState {
    records: HashMap<WorkerId, WorkerErrorRecord>,
    totals: Totals,
}

enum AttemptOutcome {
    Recovered(WorkerId),
    Retry,
    /// Stop recovering without marking the record failed.
    Abandon(&'static str),
}

// ---------------------------------------------------------------------------
// ErrorHandler
// ---------------------------------------------------------------------------

pub struct ErrorHandler {
    config: RecoveryConfig,
    recovery: Arc<dyn WorkerRecovery>,
    store: Arc<dyn ErrorLogStore>,
    state: Mutex<HandlerState>,
    cancel: CancellationToken,
}

impl ErrorHandler {
    pub fn new(
        config: RecoveryConfig,
        recovery: Arc<dyn WorkerRecovery>,
        store: Arc<dyn ErrorLogStore>,
    ) -> Self {
        Self {
            config,
            recovery,
            store,
            state: Mutex::new(HandlerState::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Spawn the fault consumer and the periodic cleanup loop.
    ///
    /// Each fault is recovered on its own task so one slow recovery does
    /// not delay the next.
    pub fn start(self: &Arc<Self>, mut faults: FaultReceiver) -> Vec<JoinHandle<()>> {
        let handler = Arc::clone(self);
        let consumer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = handler.cancel.cancelled() => break,
                    fault = faults.recv() => {
                        let Some(fault) = fault else { break };
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move { handler.handle_fault(fault).await });
                    }
                }
            }
            tracing::debug!("Worker fault consumer stopped");
        });

        let cleanup = tokio::spawn(Arc::clone(self).run_cleanup());
        tracing::info!(
            max_retries = self.config.max_retries,
            base_delay_ms = self.config.base_delay.as_millis() as u64,
            "Error handler started"
        );
        vec![consumer, cleanup]
    }

    /// Recover one crashed worker. Returns once the record is settled.
    pub async fn handle_fault(&self, fault: WorkerFault) {
        let worker_id = fault.worker_id;
        tracing::warn!(
            worker_id,
            task_id = ?fault.task_id,
            exit_code = fault.exit_code,
            error = %fault.message,
            "Worker fault observed"
        );

        let opened = {
            let mut state = self.state.lock().await;
            if state
                .records
                .get(&worker_id)
                .is_some_and(|r| !r.is_settled())
            {
                tracing::debug!(worker_id, "Recovery already in progress");
                return;
            }
            let mut record = WorkerErrorRecord::new(worker_id, fault.message);
            record.occurred_at = fault.occurred_at;
            match record.begin_recovery() {
                Ok(()) => {
                    state.totals.observed += 1;
                    state.records.insert(worker_id, record.clone());
                    Some(record)
                }
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Cannot open recovery");
                    None
                }
            }
        };
        let Some(opened) = opened else { return };
        self.persist(&opened).await;

        for _ in 0..self.config.max_retries {
            let Some(attempt) = self.update(worker_id, |r, _| r.record_attempt()).await else {
                return;
            };
            let delay = backoff_delay(attempt, self.config.base_delay, self.config.max_backoff);
            tracing::info!(
                worker_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Recovering worker"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.attempt(worker_id).await {
                AttemptOutcome::Recovered(replacement) => {
                    let recovered = self
                        .update(worker_id, |r, totals| {
                            r.mark_recovered(replacement)?;
                            totals.recovered += 1;
                            totals.recovery_time += r.recovery_latency().unwrap_or_default();
                            Ok(())
                        })
                        .await;
                    if recovered.is_some() {
                        tracing::info!(worker_id, replacement, attempt, "Worker recovered");
                    }
                    return;
                }
                AttemptOutcome::Retry => {}
                AttemptOutcome::Abandon(reason) => {
                    tracing::info!(worker_id, reason, "Recovery abandoned");
                    self.update(worker_id, |r, _| r.terminate()).await;
                    return;
                }
            }
        }

        let failed = self
            .update(worker_id, |r, totals| {
                r.mark_failed()?;
                totals.failed += 1;
                Ok(())
            })
            .await;
        if failed.is_some() {
            tracing::error!(
                worker_id,
                attempts = self.config.max_retries,
                "Worker recovery failed, pool is below capacity"
            );
        }
    }

    /// One retire-and-replace round.
    async fn attempt(&self, worker_id: WorkerId) -> AttemptOutcome {
        match self.recovery.retire_worker(worker_id).await {
            Ok(()) | Err(PoolError::UnknownWorker(_)) => {}
            Err(PoolError::Terminated) => return AttemptOutcome::Abandon("pool terminated"),
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Failed to retire worker");
                return AttemptOutcome::Retry;
            }
        }

        match self.recovery.spawn_replacement(worker_id).await {
            Ok(replacement) => AttemptOutcome::Recovered(replacement),
            Err(PoolError::Terminated) => AttemptOutcome::Abandon("pool terminated"),
            Err(PoolError::AtCapacity(_)) => AttemptOutcome::Abandon("pool already at capacity"),
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Failed to spawn replacement worker");
                AttemptOutcome::Retry
            }
        }
    }

    /// Apply `f` to a worker's record and persist the new snapshot.
    ///
    /// Returns `None` when the record is gone or the transition is refused
    /// (for instance after shutdown terminated it).
    async fn update<T>(
        &self,
        worker_id: WorkerId,
        f: impl FnOnce(&mut WorkerErrorRecord, &mut Totals) -> Result<T, CoreError>,
    ) -> Option<T> {
        let (value, snapshot) = {
            let mut state = self.state.lock().await;
            let HandlerState { records, totals } = &mut *state;
            let record = records.get_mut(&worker_id)?;
            match f(record, totals) {
                Ok(value) => (value, record.clone()),
                Err(e) => {
                    tracing::debug!(worker_id, error = %e, "Recovery step skipped");
                    return None;
                }
            }
        };
        self.persist(&snapshot).await;
        Some(value)
    }

    async fn persist(&self, record: &WorkerErrorRecord) {
        let row = CreateWorkerErrorLog::from(record);
        if let Err(e) = self.store.record_worker_error(&row).await {
            tracing::error!(
                worker_id = record.worker_id,
                status = record.status.as_str(),
                error = %e,
                "Failed to persist worker error"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Orchestration-level failures
    // -----------------------------------------------------------------------

    /// Record a failure not tied to one worker.
    pub async fn record_system_error(&self, component: &str, message: &str) {
        tracing::error!(component, error = %message, "Orchestration error");
        self.state.lock().await.totals.system_errors += 1;
        if let Err(e) = self.store.record_system_error(component, message).await {
            tracing::error!(component, error = %e, "Failed to persist system error");
        }
    }

    /// Spawn `fut` and record a system error if it panics.
    pub fn supervise<F>(self: &Arc<Self>, component: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            match tokio::spawn(fut).await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic().as_ref());
                    handler.record_system_error(component, &message).await;
                }
                Err(_) => {
                    tracing::debug!(component, "Supervised task cancelled");
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    pub async fn error_statistics(&self) -> ErrorStatistics {
        let state = self.state.lock().await;
        let mut stats = ErrorStatistics::default();
        for record in state.records.values() {
            match record.status {
                WorkerErrorStatus::Active => stats.active += 1,
                WorkerErrorStatus::Recovering => stats.recovering += 1,
                WorkerErrorStatus::Failed => stats.failed += 1,
                WorkerErrorStatus::Terminated => stats.terminated += 1,
            }
        }
        let totals = &state.totals;
        stats.total_observed = totals.observed;
        stats.system_errors = totals.system_errors;
        stats.error_rate = if totals.observed == 0 {
            0.0
        } else {
            totals.failed as f64 / totals.observed as f64
        };
        stats.average_recovery_ms = (totals.recovered > 0).then(|| {
            totals.recovery_time.as_secs_f64() * 1000.0 / totals.recovered as f64
        });
        stats
    }

    pub async fn health_summary(&self) -> HealthSummary {
        let stats = self.error_statistics().await;
        summarize_health(&stats, self.config.max_retries)
    }

    /// Snapshot of the records currently held in memory.
    pub async fn worker_errors(&self) -> Vec<WorkerErrorRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by_key(|r| r.occurred_at);
        records
    }

    // -----------------------------------------------------------------------
    // Cleanup / shutdown
    // -----------------------------------------------------------------------

    /// Evict settled records older than the retention window and prune the
    /// persisted log. Returns the number of evicted records.
    pub async fn cleanup(&self) -> usize {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let evicted = {
            let mut state = self.state.lock().await;
            let before = state.records.len();
            state
                .records
                .retain(|_, r| !(r.is_settled() && r.updated_at < now - retention));
            before - state.records.len()
        };
        if evicted > 0 {
            tracing::info!(evicted, "Evicted settled worker error records");
        }

        let log_retention = chrono::Duration::from_std(self.config.log_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        match self.store.prune_error_logs(now - log_retention).await {
            Ok(0) => tracing::debug!("Error log retention: no rows to purge"),
            Ok(deleted) => tracing::info!(deleted, "Error log retention: purged old rows"),
            Err(e) => tracing::error!(error = %e, "Error log retention: cleanup failed"),
        }
        evicted
    }

    async fn run_cleanup(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Error handler cleanup stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.cleanup().await;
                }
            }
        }
    }

    /// Stop consuming faults and terminate records still in recovery.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let terminated: Vec<WorkerErrorRecord> = {
            let mut state = self.state.lock().await;
            state
                .records
                .values_mut()
                .filter(|r| !r.is_settled())
                .filter_map(|r| r.terminate().ok().map(|()| r.clone()))
                .collect()
        };
        for record in &terminated {
            self.persist(record).await;
        }
        tracing::info!(terminated = terminated.len(), "Error handler stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
