//! Performance sample and alert rows.

use kiln_core::alert::PerformanceAlert;
use kiln_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A row from the `performance_samples` table. `metrics` holds a
/// serialized `PerformanceMetrics`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PerformanceSample {
    pub id: DbId,
    pub metrics: serde_json::Value,
    pub recorded_at: Timestamp,
}

/// A row from the `performance_alerts` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PerformanceAlertRow {
    pub id: Uuid,
    pub alert_type: String,
    pub severity: String,
    pub threshold: f64,
    pub current_value: f64,
    pub resolved: bool,
    pub raised_at: Timestamp,
}

impl From<&PerformanceAlert> for PerformanceAlertRow {
    fn from(a: &PerformanceAlert) -> Self {
        Self {
            id: a.id,
            alert_type: a.alert_type.as_str().to_string(),
            severity: a.severity.as_str().to_string(),
            threshold: a.threshold,
            current_value: a.current_value,
            resolved: a.resolved,
            raised_at: a.timestamp,
        }
    }
}
