//! Training session lifecycle and the data exchanged with training backends.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// `Running` is the only non-terminal status; a terminal status is set once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "stopped" => Ok(SessionStatus::Stopped),
            other => Err(CoreError::Validation(format!(
                "unknown session status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != SessionStatus::Running
    }

    /// Check that a session in `self` may move to `next`.
    pub fn validate_transition(&self, next: SessionStatus) -> Result<(), CoreError> {
        if *self == SessionStatus::Running && next.is_terminal() {
            return Ok(());
        }
        Err(CoreError::InvalidTransition {
            entity: "training session",
            from: self.as_str(),
            to: next.as_str(),
        })
    }
}

// ---------------------------------------------------------------------------
// TrainingConfig
// ---------------------------------------------------------------------------

fn default_epochs() -> u32 {
    10
}

fn default_batch_size() -> u32 {
    32
}

fn default_learning_rate() -> f64 {
    0.001
}

/// Hyper-parameters for one training run. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.epochs == 0 {
            return Err(CoreError::Validation("epochs must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(CoreError::Validation(
                "batch_size must be at least 1".into(),
            ));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(CoreError::Validation(format!(
                "learning_rate must be in (0, 1], got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Progress / summary
// ---------------------------------------------------------------------------

/// Emitted by a backend at least once per epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: u32,
    pub loss: f64,
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_accuracy: Option<f64>,
    pub timestamp: Timestamp,
}

/// Final figures of a train run, returned as the task result value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub final_epoch: u32,
    pub final_loss: Option<f64>,
    pub final_accuracy: Option<f64>,
    /// The run ended early because a stop was requested.
    pub stopped: bool,
}

impl TrainingSummary {
    /// Fold one epoch into the running summary.
    pub fn record(&mut self, metrics: &EpochMetrics) {
        self.final_epoch = metrics.epoch;
        self.final_loss = Some(metrics.loss);
        self.final_accuracy = Some(metrics.accuracy);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
