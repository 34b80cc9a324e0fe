//! Worker execution-context lifecycle.
//!
//! `Idle -> Busy -> (Idle | Error) -> Terminated`. Transitions outside that
//! graph are rejected with [`CoreError::InvalidTransition`].

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::task::TaskId;
use crate::types::WorkerId;

// ---------------------------------------------------------------------------
// WorkerState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Busy,
    Error,
    Terminated,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Error => "error",
            WorkerState::Terminated => "terminated",
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Busy) | (Busy, Idle) | (Busy, Error) | (Idle, Error)
        ) || (*self != Terminated && next == Terminated)
    }

    fn transition(&mut self, next: WorkerState) -> Result<(), CoreError> {
        if !self.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: "worker",
                from: self.as_str(),
                to: next.as_str(),
            });
        }
        *self = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Per-worker metrics snapshot pushed to the performance monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    /// Busy share of wall-clock time since the context was spawned (0-100).
    pub cpu_usage_percent: f64,
    /// Last memory figure reported by a task running on this worker.
    pub memory_usage_mb: f64,
    /// Completed tasks per minute since spawn.
    pub throughput_per_min: f64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
}

// ---------------------------------------------------------------------------
// WorkerRecord
// ---------------------------------------------------------------------------

/// Bookkeeping for one execution context. Mutated only by the pool.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub state: WorkerState,
    pub current_task: Option<TaskId>,
    pub last_metrics: WorkerMetrics,
}

impl WorkerRecord {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: WorkerState::Idle,
            current_task: None,
            last_metrics: WorkerMetrics {
                worker_id: id,
                ..Default::default()
            },
        }
    }

    /// Hand a task to an idle worker. At most one task per worker.
    pub fn assign(&mut self, task_id: TaskId) -> Result<(), CoreError> {
        if self.current_task.is_some() {
            return Err(CoreError::Conflict(format!(
                "worker {} already runs a task",
                self.id
            )));
        }
        self.state.transition(WorkerState::Busy)?;
        self.current_task = Some(task_id);
        Ok(())
    }

    /// The running task finished; the worker goes back to idle.
    pub fn release(&mut self) -> Result<Option<TaskId>, CoreError> {
        self.state.transition(WorkerState::Idle)?;
        Ok(self.current_task.take())
    }

    /// The context crashed. Returns the task that was in flight, if any.
    pub fn fail(&mut self) -> Result<Option<TaskId>, CoreError> {
        self.state.transition(WorkerState::Error)?;
        Ok(self.current_task.take())
    }

    pub fn terminate(&mut self) -> Result<Option<TaskId>, CoreError> {
        self.state.transition(WorkerState::Terminated)?;
        Ok(self.current_task.take())
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
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

    #[test]
    fn busy_then_idle() {
        let mut w = WorkerRecord::new(1);
        let t = Uuid::new_v4();
        w.assign(t).unwrap();
        assert_eq!(w.state, WorkerState::Busy);
        assert_eq!(w.release().unwrap(), Some(t));
        assert!(w.is_idle());
        assert!(w.current_task.is_none());
    }

    #[test]
    fn second_assignment_rejected() {
        let mut w = WorkerRecord::new(1);
        w.assign(Uuid::new_v4()).unwrap();
        assert_matches!(w.assign(Uuid::new_v4()), Err(CoreError::Conflict(_)));
    }

    #[test]
    fn crash_returns_in_flight_task() {
        let mut w = WorkerRecord::new(3);
        let t = Uuid::new_v4();
        w.assign(t).unwrap();
        assert_eq!(w.fail().unwrap(), Some(t));
        assert_eq!(w.state, WorkerState::Error);
    }

    #[test]
    fn error_cannot_return_to_idle() {
        let mut w = WorkerRecord::new(3);
        w.fail().unwrap();
        assert_matches!(
            w.release(),
            Err(CoreError::InvalidTransition { from: "error", to: "idle", .. })
        );
    }

    #[test]
    fn terminated_is_final() {
        let mut w = WorkerRecord::new(2);
        w.terminate().unwrap();
        assert!(w.terminate().is_err());
        assert!(w.assign(Uuid::new_v4()).is_err());
    }

    #[test]
    fn idle_to_idle_is_illegal() {
        assert!(!WorkerState::Idle.can_transition_to(WorkerState::Idle));
        assert!(WorkerState::Error.can_transition_to(WorkerState::Terminated));
    }
}
