//! Threshold evaluation for orchestrator performance metrics.
//!
//! Pure logic. The performance monitor samples and aggregates metrics, then
//! passes them in together with the configured thresholds.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::alert::{AlertCandidate, AlertSeverity, AlertType, PerformanceAlert};
use crate::recovery::HealthStatus;
use crate::types::Timestamp;
use crate::worker_state::WorkerMetrics;

/// Critical severity starts at this multiple of the threshold.
pub const CRITICAL_FACTOR: f64 = 1.5;

/// Share of a threshold at which the summary starts recommending action.
const PROXIMITY_FACTOR: f64 = 0.8;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub memory_mb: f64,
    pub latency_ms: f64,
    pub error_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            memory_mb: 512.0,
            latency_ms: 100.0,
            error_rate: 0.1,
        }
    }
}

/// Current view of orchestrator performance, assembled from sampling and
/// from data pushed by the pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Last measured scheduler responsiveness (fast cadence).
    pub scheduler_latency_ms: f64,
    /// Resident memory of this process (medium cadence).
    pub process_memory_mb: f64,

    // Aggregated from per-worker metrics.
    pub worker_memory_mb: f64,
    pub average_cpu_percent: f64,
    pub total_throughput_per_min: f64,
    pub error_rate: f64,

    // Mirrored from the pool status.
    pub queue_depth: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub average_dispatch_latency_ms: f64,
    pub live_workers: usize,
    pub busy_workers: usize,

    pub sampled_at: Option<Timestamp>,
}

impl PerformanceMetrics {
    /// Fold per-worker metrics into pool-wide figures.
    ///
    /// Memory and throughput are summed, CPU is averaged. The error rate
    /// comes from the mirrored pool counters once any are present, since
    /// those keep the tasks of workers that crashed and were retired; before
    /// that it falls back to the per-worker counts.
    pub fn apply_worker_metrics(&mut self, workers: &[WorkerMetrics]) {
        self.worker_memory_mb = workers.iter().map(|w| w.memory_usage_mb).sum();
        self.total_throughput_per_min = workers.iter().map(|w| w.throughput_per_min).sum();
        self.average_cpu_percent = if workers.is_empty() {
            0.0
        } else {
            workers.iter().map(|w| w.cpu_usage_percent).sum::<f64>() / workers.len() as f64
        };
        self.error_rate = if self.completed_tasks + self.failed_tasks > 0 {
            failure_ratio(self.completed_tasks, self.failed_tasks)
        } else {
            failure_ratio(
                workers.iter().map(|w| w.completed_tasks).sum(),
                workers.iter().map(|w| w.failed_tasks).sum(),
            )
        };
        self.sampled_at = Some(Utc::now());
    }

    /// Mirror the pool's lifetime task counters and recompute the error
    /// rate from them.
    pub fn apply_pool_counts(&mut self, completed: u64, failed: u64) {
        self.completed_tasks = completed;
        self.failed_tasks = failed;
        self.error_rate = failure_ratio(completed, failed);
    }

    /// Value the memory rule checks: the larger of worker-reported and
    /// process-resident memory.
    pub fn memory_for_rules(&self) -> f64 {
        self.worker_memory_mb.max(self.process_memory_mb)
    }
}

/// `failed / completed`; with nothing completed it is 1.0 if anything
/// failed and 0.0 otherwise.
fn failure_ratio(completed: u64, failed: u64) -> f64 {
    match (completed, failed) {
        (0, 0) => 0.0,
        (0, _) => 1.0,
        (c, f) => f as f64 / c as f64,
    }
}

// ---------------------------------------------------------------------------
// Rule evaluation
// ---------------------------------------------------------------------------

/// Check every rule and return one candidate per violated rule.
pub fn evaluate_rules(
    metrics: &PerformanceMetrics,
    thresholds: &AlertThresholds,
) -> Vec<AlertCandidate> {
    [
        (AlertType::Memory, metrics.memory_for_rules(), thresholds.memory_mb),
        (
            AlertType::Latency,
            metrics.scheduler_latency_ms,
            thresholds.latency_ms,
        ),
        (AlertType::ErrorRate, metrics.error_rate, thresholds.error_rate),
    ]
    .into_iter()
    .filter_map(|(alert_type, value, threshold)| {
        classify(value, threshold).map(|severity| AlertCandidate {
            alert_type,
            severity,
            threshold,
            current_value: value,
        })
    })
    .collect()
}

fn classify(value: f64, threshold: f64) -> Option<AlertSeverity> {
    if value > threshold * CRITICAL_FACTOR {
        Some(AlertSeverity::Critical)
    } else if value > threshold {
        Some(AlertSeverity::High)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Cooldown
// ---------------------------------------------------------------------------

/// Suppresses repeated alerts of the same type within a window.
///
/// A zero window admits every candidate.
#[derive(Debug, Default)]
pub struct AlertCooldownTracker {
    window: Duration,
    last_alert: HashMap<AlertType, Timestamp>,
}

impl AlertCooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_alert: HashMap::new(),
        }
    }

    /// Returns `true` (and records `now`) if an alert of this type may fire.
    pub fn should_alert(&mut self, alert_type: AlertType, now: Timestamp) -> bool {
        if let (Some(last), Ok(window)) = (
            self.last_alert.get(&alert_type),
            chrono::Duration::from_std(self.window),
        ) {
            if now.signed_duration_since(*last) < window {
                return false;
            }
        }
        self.last_alert.insert(alert_type, now);
        true
    }

    /// Filter candidates through the cooldown, turning survivors into alerts.
    pub fn admit(&mut self, candidates: Vec<AlertCandidate>, now: Timestamp) -> Vec<PerformanceAlert> {
        candidates
            .into_iter()
            .filter(|c| self.should_alert(c.alert_type, now))
            .map(PerformanceAlert::from)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub status: HealthStatus,
    pub metrics: PerformanceMetrics,
    pub unresolved_alerts: usize,
    pub recommendations: Vec<String>,
}

/// Status is the worst severity among unresolved alerts; recommendations
/// fire when a metric is within reach of its threshold.
pub fn summarize_performance(
    metrics: &PerformanceMetrics,
    thresholds: &AlertThresholds,
    alerts: &[PerformanceAlert],
) -> PerformanceSummary {
    let unresolved: Vec<&PerformanceAlert> = alerts.iter().filter(|a| !a.resolved).collect();
    let status = match unresolved.iter().map(|a| a.severity).max() {
        Some(AlertSeverity::Critical) => HealthStatus::Critical,
        Some(AlertSeverity::High) => HealthStatus::Warning,
        None => HealthStatus::Healthy,
    };

    let mut recommendations = Vec::new();
    if metrics.memory_for_rules() > thresholds.memory_mb * PROXIMITY_FACTOR {
        recommendations.push(format!(
            "Memory usage ({:.0} MB) is near the {:.0} MB limit; reduce the pool size or batch sizes.",
            metrics.memory_for_rules(),
            thresholds.memory_mb
        ));
    }
    if metrics.scheduler_latency_ms > thresholds.latency_ms * PROXIMITY_FACTOR {
        recommendations.push(format!(
            "Scheduler latency ({:.1} ms) is high; move blocking work off the orchestrator runtime.",
            metrics.scheduler_latency_ms
        ));
    }
    if metrics.error_rate > thresholds.error_rate * PROXIMITY_FACTOR {
        recommendations.push(format!(
            "Task error rate is {:.0}%; check recent failures in the error log.",
            metrics.error_rate * 100.0
        ));
    }
    if metrics.queue_depth > metrics.live_workers.max(1) * 4 {
        recommendations.push(format!(
            "{} tasks are queued for {} workers; consider raising WORKER_POOL_SIZE.",
            metrics.queue_depth, metrics.live_workers
        ));
    }

    PerformanceSummary {
        status,
        metrics: metrics.clone(),
        unresolved_alerts: unresolved.len(),
        recommendations,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
