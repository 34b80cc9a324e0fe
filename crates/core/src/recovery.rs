//! Worker fault records, recovery backoff and health classification.
//!
//! Pure logic only. The error handler in the worker crate owns the records
//! and drives the state machine:
//!
//! ```text
//! Active -> Recovering -> Active   (replacement spawned)
//!                      -> Failed   (retries exhausted)
//! any non-terminated   -> Terminated (evicted / shut down)
//! ```

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::error::CoreError;
use crate::types::{Timestamp, WorkerId};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Error rate above which the health summary recommends investigation.
pub const ERROR_RATE_HINT_THRESHOLD: f64 = 0.1;

/// Average recovery latency above which a tuning hint is emitted.
pub const SLOW_RECOVERY_HINT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Delay before recovery attempt `attempt` (1-based).
///
/// `base * 2^(attempt - 1)`, clamped to `max`. Attempt 0 is treated as 1.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1);
    2u32.checked_pow(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(max)
        .min(max)
}

// ---------------------------------------------------------------------------
// WorkerErrorStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerErrorStatus {
    Active,
    Recovering,
    Failed,
    Terminated,
}

impl WorkerErrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerErrorStatus::Active => "active",
            WorkerErrorStatus::Recovering => "recovering",
            WorkerErrorStatus::Failed => "failed",
            WorkerErrorStatus::Terminated => "terminated",
        }
    }

    pub fn can_transition_to(&self, next: WorkerErrorStatus) -> bool {
        use WorkerErrorStatus::*;
        matches!(
            (self, next),
            (Active, Recovering) | (Recovering, Active) | (Recovering, Failed)
        ) || (*self != Terminated && next == Terminated)
    }
}

// ---------------------------------------------------------------------------
// WorkerErrorRecord
// ---------------------------------------------------------------------------

/// One observed worker fault and the progress of its recovery.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerErrorRecord {
    pub worker_id: WorkerId,
    pub message: String,
    pub occurred_at: Timestamp,
    pub recovery_attempts: u32,
    pub status: WorkerErrorStatus,
    /// Id of the context that replaced the failed one.
    pub replacement_id: Option<WorkerId>,
    pub recovered_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl WorkerErrorRecord {
    pub fn new(worker_id: WorkerId, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            message: message.into(),
            occurred_at: now,
            recovery_attempts: 0,
            status: WorkerErrorStatus::Active,
            replacement_id: None,
            recovered_at: None,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: WorkerErrorStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: "worker error",
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn begin_recovery(&mut self) -> Result<(), CoreError> {
        self.transition(WorkerErrorStatus::Recovering)
    }

    /// Count one more recovery attempt. Only valid while recovering.
    pub fn record_attempt(&mut self) -> Result<u32, CoreError> {
        if self.status != WorkerErrorStatus::Recovering {
            return Err(CoreError::Conflict(format!(
                "worker {} is not recovering",
                self.worker_id
            )));
        }
        self.recovery_attempts += 1;
        self.updated_at = Utc::now();
        Ok(self.recovery_attempts)
    }

    pub fn mark_recovered(&mut self, replacement_id: WorkerId) -> Result<(), CoreError> {
        self.transition(WorkerErrorStatus::Active)?;
        self.replacement_id = Some(replacement_id);
        self.recovered_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_failed(&mut self) -> Result<(), CoreError> {
        self.transition(WorkerErrorStatus::Failed)
    }

    pub fn terminate(&mut self) -> Result<(), CoreError> {
        self.transition(WorkerErrorStatus::Terminated)
    }

    /// Time from fault to successful replacement.
    pub fn recovery_latency(&self) -> Option<Duration> {
        self.recovered_at
            .and_then(|done| (done - self.occurred_at).to_std().ok())
    }

    /// Whether the record is settled (recovered, failed or terminated).
    pub fn is_settled(&self) -> bool {
        match self.status {
            WorkerErrorStatus::Active => self.recovered_at.is_some(),
            WorkerErrorStatus::Recovering => false,
            WorkerErrorStatus::Failed | WorkerErrorStatus::Terminated => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics and health
// ---------------------------------------------------------------------------

/// Aggregate error statistics exposed by the error handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStatistics {
    pub active: usize,
    pub recovering: usize,
    pub failed: usize,
    pub terminated: usize,
    /// Worker faults observed since start (including evicted records).
    pub total_observed: u64,
    /// Orchestrator-level failures not tied to one worker.
    pub system_errors: u64,
    /// Worker slots that exhausted their retries / `total_observed`.
    pub error_rate: f64,
    pub average_recovery_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub overall: HealthStatus,
    pub statistics: ErrorStatistics,
    pub recommendations: Vec<String>,
}

/// Classify overall health and build plain-text remediation hints.
///
/// Any failed record makes the system critical; any record still
/// recovering makes it a warning.
pub fn summarize_health(stats: &ErrorStatistics, max_retries: u32) -> HealthSummary {
    let overall = if stats.failed > 0 {
        HealthStatus::Critical
    } else if stats.recovering > 0 {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };

    let mut recommendations = Vec::new();

    if stats.failed > 0 {
        recommendations.push(format!(
            "{} worker slot(s) exhausted {max_retries} recovery attempts; the pool is running \
             below capacity. Restart the service or raise RECOVERY_MAX_RETRIES.",
            stats.failed
        ));
    }
    if stats.recovering > 0 {
        recommendations.push(format!(
            "{} worker(s) are being replaced; queued tasks may wait longer than usual.",
            stats.recovering
        ));
    }
    if stats.error_rate > ERROR_RATE_HINT_THRESHOLD {
        recommendations.push(format!(
            "Worker failure rate is {:.0}%; inspect recent task payloads for inputs that crash workers.",
            stats.error_rate * 100.0
        ));
    } else if stats.total_observed > 0 && stats.error_rate > ERROR_RATE_HINT_THRESHOLD / 2.0 {
        recommendations.push(format!(
            "Worker failure rate ({:.0}%) is approaching the {:.0}% threshold.",
            stats.error_rate * 100.0,
            ERROR_RATE_HINT_THRESHOLD * 100.0
        ));
    }
    if let Some(avg) = stats.average_recovery_ms {
        if avg > SLOW_RECOVERY_HINT.as_millis() as f64 {
            recommendations.push(format!(
                "Average recovery takes {:.1}s; consider lowering RECOVERY_BASE_DELAY_MS.",
                avg / 1000.0
            ));
        }
    }
    if stats.system_errors > 0 {
        recommendations.push(format!(
            "{} orchestration-level failure(s) recorded; check the service logs.",
            stats.system_errors
        ));
    }

    HealthSummary {
        overall,
        statistics: stats.clone(),
        recommendations,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // -- backoff_delay ----------------------------------------------------------

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, base, max), Duration::from_millis(400));
    }

    #[test]
    fn backoff_clamps_at_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(5);
        assert_eq!(backoff_delay(4, base, max), Duration::from_secs(5));
        assert_eq!(backoff_delay(60, base, max), Duration::from_secs(5));
    }

    #[test]
    fn backoff_attempt_zero_is_base() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(0, base, Duration::from_secs(1)), base);
    }

    // -- state machine ------------------------------------------------------------

    #[test]
    fn recover_path() {
        let mut r = WorkerErrorRecord::new(4, "panicked");
        r.begin_recovery().unwrap();
        assert_eq!(r.record_attempt().unwrap(), 1);
        r.mark_recovered(9).unwrap();
        assert_eq!(r.status, WorkerErrorStatus::Active);
        assert_eq!(r.replacement_id, Some(9));
        assert!(r.recovery_latency().is_some());
        assert!(r.is_settled());
    }

    #[test]
    fn failed_is_not_reversible() {
        let mut r = WorkerErrorRecord::new(4, "panicked");
        r.begin_recovery().unwrap();
        r.mark_failed().unwrap();
        assert_matches!(r.begin_recovery(), Err(CoreError::InvalidTransition { .. }));
        assert_matches!(r.mark_recovered(1), Err(CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn attempts_only_while_recovering() {
        let mut r = WorkerErrorRecord::new(1, "x");
        assert_matches!(r.record_attempt(), Err(CoreError::Conflict(_)));
    }

    #[test]
    fn fresh_record_is_unsettled() {
        let r = WorkerErrorRecord::new(1, "x");
        assert!(!r.is_settled());
    }

    // -- health -------------------------------------------------------------------

    #[test]
    fn healthy_without_records() {
        let summary = summarize_health(&ErrorStatistics::default(), 3);
        assert_eq!(summary.overall, HealthStatus::Healthy);
        assert!(summary.recommendations.is_empty());
    }

    #[test]
    fn recovering_is_warning() {
        let stats = ErrorStatistics {
            recovering: 1,
            total_observed: 1,
            ..Default::default()
        };
        assert_eq!(summarize_health(&stats, 3).overall, HealthStatus::Warning);
    }

    #[test]
    fn failed_is_critical_with_hint() {
        let stats = ErrorStatistics {
            failed: 1,
            recovering: 1,
            total_observed: 2,
            error_rate: 0.5,
            ..Default::default()
        };
        let summary = summarize_health(&stats, 3);
        assert_eq!(summary.overall, HealthStatus::Critical);
        assert!(summary
            .recommendations
            .iter()
            .any(|r| r.contains("RECOVERY_MAX_RETRIES")));
        assert!(summary.recommendations.iter().any(|r| r.contains("50%")));
    }

    #[test]
    fn approaching_error_rate_hint() {
        let stats = ErrorStatistics {
            total_observed: 20,
            error_rate: 0.07,
            ..Default::default()
        };
        let summary = summarize_health(&stats, 3);
        assert_eq!(summary.overall, HealthStatus::Healthy);
        assert!(summary.recommendations[0].contains("approaching"));
    }
}
