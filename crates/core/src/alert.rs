//! Performance alert types raised by threshold evaluation.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Timestamp;

/// Which rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Memory,
    Latency,
    ErrorRate,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Memory => "memory",
            AlertType::Latency => "latency",
            AlertType::ErrorRate => "error_rate",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a threshold violation. Ordered so `max()` yields the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Value exceeded the threshold.
    High,
    /// Value exceeded 1.5x the threshold.
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// A rule violation before it is admitted as an alert.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub threshold: f64,
    pub current_value: f64,
}

/// An emitted alert. `resolved` only flips on acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub threshold: f64,
    pub current_value: f64,
    pub timestamp: Timestamp,
    pub resolved: bool,
}

impl From<AlertCandidate> for PerformanceAlert {
    fn from(c: AlertCandidate) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type: c.alert_type,
            severity: c.severity,
            threshold: c.threshold,
            current_value: c.current_value,
            timestamp: Utc::now(),
            resolved: false,
        }
    }
}
