//! Performance sampling, threshold alerts and retention.
//!
//! Four independent cadences run once [`PerformanceMonitor::start`] is
//! called:
//!
//! | cadence    | default | work                                       |
//! |------------|---------|--------------------------------------------|
//! | fast       | 1s      | scheduler latency across a `yield_now`     |
//! | medium     | 5s      | process resident memory                    |
//! | slow       | 10s     | rule evaluation and sample persistence     |
//! | background | 5min    | pruning of persisted samples and alerts    |
//!
//! Pool state arrives by push over the pool's status channel; the monitor
//! never reaches into the pool.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kiln_core::alert::PerformanceAlert;
use kiln_core::thresholds::{
    evaluate_rules, summarize_performance, AlertCooldownTracker, AlertThresholds,
    PerformanceMetrics, PerformanceSummary,
};
use kiln_core::worker_state::WorkerMetrics;
use kiln_db::MetricsStore;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pool::PoolStatus;

const ALERT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub thresholds: AlertThresholds,
    /// Minimum gap between two alerts of the same type. Zero disables
    /// coalescing.
    pub alert_cooldown: Duration,
    pub fast_interval: Duration,
    pub medium_interval: Duration,
    pub slow_interval: Duration,
    pub background_interval: Duration,
    /// Age beyond which persisted samples and alerts are pruned.
    pub retention: Duration,
    /// Alerts kept in memory; the oldest are dropped first.
    pub alert_history_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: AlertThresholds::default(),
            alert_cooldown: Duration::from_secs(300),
            fast_interval: Duration::from_secs(1),
            medium_interval: Duration::from_secs(5),
            slow_interval: Duration::from_secs(10),
            background_interval: Duration::from_secs(300),
            retention: Duration::from_secs(24 * 3600),
            alert_history_limit: 1000,
        }
    }
}

struct MonitorState {
    metrics: PerformanceMetrics,
    alerts: VecDeque<PerformanceAlert>,
    cooldown: AlertCooldownTracker,
}

pub struct PerformanceMonitor {
    config: MonitorConfig,
    store: Arc<dyn MetricsStore>,
    state: Mutex<MonitorState>,
    alert_tx: broadcast::Sender<PerformanceAlert>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig, store: Arc<dyn MetricsStore>) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MonitorState {
                metrics: PerformanceMetrics::default(),
                alerts: VecDeque::new(),
                cooldown: AlertCooldownTracker::new(config.alert_cooldown),
            }),
            config,
            store,
            alert_tx,
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.config.thresholds
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Spawn the cadence loops and the pool status forwarder. All of them
    /// stop when `cancel` fires.
    pub fn start(
        self: &Arc<Self>,
        pool_status: watch::Receiver<PoolStatus>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let handles = vec![
            self.spawn_cadence("fast", self.config.fast_interval, cancel.clone(), |m| async move {
                m.measure_scheduler_latency().await;
            }),
            self.spawn_cadence("medium", self.config.medium_interval, cancel.clone(), |m| async move {
                m.record_process_memory(process_memory_mb().await).await;
            }),
            self.spawn_cadence("slow", self.config.slow_interval, cancel.clone(), |m| async move {
                m.evaluate().await;
                m.persist_sample().await;
            }),
            self.spawn_cadence(
                "background",
                self.config.background_interval,
                cancel.clone(),
                |m| async move {
                    m.prune().await;
                },
            ),
            tokio::spawn(Arc::clone(self).forward_pool_status(pool_status, cancel)),
        ];

        tracing::info!(
            memory_mb = self.config.thresholds.memory_mb,
            latency_ms = self.config.thresholds.latency_ms,
            error_rate = self.config.thresholds.error_rate,
            cooldown_secs = self.config.alert_cooldown.as_secs(),
            "Performance monitor started"
        );
        handles
    }

    fn spawn_cadence<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        cancel: CancellationToken,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(cadence = name, "Monitor loop stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        tick(Arc::clone(&monitor)).await;
                    }
                }
            }
        })
    }

    async fn forward_pool_status(
        self: Arc<Self>,
        mut status: watch::Receiver<PoolStatus>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = status.borrow_and_update().clone();
                    self.update_worker_pool_status(&snapshot).await;
                    self.update_worker_metrics(&snapshot.workers).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    /// Aggregate per-worker metrics and re-evaluate the rules at once.
    pub async fn update_worker_metrics(&self, workers: &[WorkerMetrics]) -> Vec<PerformanceAlert> {
        self.state.lock().await.metrics.apply_worker_metrics(workers);
        self.evaluate().await
    }

    pub async fn update_worker_pool_status(&self, status: &PoolStatus) {
        let mut state = self.state.lock().await;
        let m = &mut state.metrics;
        m.queue_depth = status.queue_depth;
        m.apply_pool_counts(status.completed_tasks, status.failed_tasks);
        m.average_dispatch_latency_ms = status.average_dispatch_latency_ms;
        m.live_workers = status.live_workers;
        m.busy_workers = status.busy_workers;
    }

    pub async fn record_scheduler_latency(&self, latency: Duration) {
        self.state.lock().await.metrics.scheduler_latency_ms = latency.as_secs_f64() * 1000.0;
    }

    pub async fn record_process_memory(&self, megabytes: f64) {
        self.state.lock().await.metrics.process_memory_mb = megabytes;
    }

    /// Time a zero-cost continuation on the runtime.
    pub async fn measure_scheduler_latency(&self) -> Duration {
        let started = Instant::now();
        tokio::task::yield_now().await;
        let latency = started.elapsed();
        self.record_scheduler_latency(latency).await;
        latency
    }

    // -----------------------------------------------------------------------
    // Rules and alerts
    // -----------------------------------------------------------------------

    /// Evaluate the rules against current metrics. Returns the alerts that
    /// passed the cooldown; each is broadcast and persisted.
    pub async fn evaluate(&self) -> Vec<PerformanceAlert> {
        let raised = {
            let mut state = self.state.lock().await;
            let candidates = evaluate_rules(&state.metrics, &self.config.thresholds);
            if candidates.is_empty() {
                return Vec::new();
            }
            let raised = state.cooldown.admit(candidates, Utc::now());
            for alert in &raised {
                state.alerts.push_back(alert.clone());
            }
            while state.alerts.len() > self.config.alert_history_limit {
                state.alerts.pop_front();
            }
            raised
        };

        for alert in &raised {
            tracing::warn!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                severity = alert.severity.as_str(),
                threshold = alert.threshold,
                current_value = alert.current_value,
                "Performance alert raised"
            );
            // No subscribers is fine.
            let _ = self.alert_tx.send(alert.clone());
            if let Err(e) = self.store.insert_alert(alert).await {
                tracing::error!(alert_id = %alert.id, error = %e, "Failed to persist alert");
            }
        }
        raised
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<PerformanceAlert> {
        self.alert_tx.subscribe()
    }

    /// Mark an alert resolved. Returns `false` for unknown ids.
    pub async fn acknowledge_alert(&self, id: Uuid) -> bool {
        let found = {
            let mut state = self.state.lock().await;
            match state.alerts.iter_mut().find(|a| a.id == id) {
                Some(alert) => {
                    alert.resolved = true;
                    true
                }
                None => false,
            }
        };
        if found {
            tracing::info!(alert_id = %id, "Alert acknowledged");
            if let Err(e) = self.store.resolve_alert(id).await {
                tracing::error!(alert_id = %id, error = %e, "Failed to persist alert resolution");
            }
        }
        found
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn alerts(&self) -> Vec<PerformanceAlert> {
        self.state.lock().await.alerts.iter().cloned().collect()
    }

    pub async fn metrics(&self) -> PerformanceMetrics {
        self.state.lock().await.metrics.clone()
    }

    pub async fn performance_summary(&self) -> PerformanceSummary {
        let state = self.state.lock().await;
        let alerts: Vec<PerformanceAlert> = state.alerts.iter().cloned().collect();
        summarize_performance(&state.metrics, &self.config.thresholds, &alerts)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    async fn persist_sample(&self) {
        let mut metrics = self.metrics().await;
        let now = Utc::now();
        metrics.sampled_at = Some(now);
        let value = match serde_json::to_value(&metrics) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode performance sample");
                return;
            }
        };
        if let Err(e) = self.store.insert_sample(&value, now).await {
            tracing::error!(error = %e, "Failed to persist performance sample");
        }
    }

    /// Delete persisted samples and alerts older than the retention window.
    pub async fn prune(&self) -> u64 {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        match self.store.prune_metrics(Utc::now() - retention).await {
            Ok(0) => {
                tracing::debug!("Metrics retention: no rows to purge");
                0
            }
            Ok(deleted) => {
                tracing::info!(deleted, "Metrics retention: purged old rows");
                deleted
            }
            Err(e) => {
                tracing::error!(error = %e, "Metrics retention: cleanup failed");
                0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process memory
// ---------------------------------------------------------------------------

/// Resident set size of this process in megabytes; 0 where unsupported.
#[cfg(target_os = "linux")]
async fn process_memory_mb() -> f64 {
    match tokio::fs::read_to_string("/proc/self/status").await {
        Ok(status) => parse_vm_rss_kb(&status).map_or(0.0, |kb| kb as f64 / 1024.0),
        Err(e) => {
            tracing::debug!(error = %e, "Cannot read /proc/self/status");
            0.0
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn process_memory_mb() -> f64 {
    0.0
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
