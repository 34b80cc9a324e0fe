//! One worker execution context: a named OS thread that runs assignments
//! handed to it by the pool actor.
//!
//! The thread blocks on its assignment channel, runs each task under
//! `catch_unwind`, and reports back over the shared event channel. A
//! panicking task is a crash: the thread reports `Crashed` and exits.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use kiln_core::task::{TaskError, TaskId, TaskRequest};
use kiln_core::types::WorkerId;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::executor::{ProgressSink, TaskContext, TaskExecutor};

use super::PoolError;

/// Exit code reported for a context that died from a panic.
pub const CRASH_EXIT_CODE: i32 = 1;

/// Messages from worker threads (and timeout timers) to the pool actor.
#[derive(Debug)]
pub enum WorkerEvent {
    Progress {
        worker_id: WorkerId,
        task_id: TaskId,
        data: Value,
    },
    Memory {
        worker_id: WorkerId,
        megabytes: f64,
    },
    Finished {
        worker_id: WorkerId,
        task_id: TaskId,
        outcome: Result<Value, TaskError>,
    },
    Crashed {
        worker_id: WorkerId,
        task_id: Option<TaskId>,
        message: String,
        exit_code: i32,
    },
    TimedOut {
        worker_id: WorkerId,
        task_id: TaskId,
    },
}

pub(crate) struct Assignment {
    pub request: TaskRequest,
    pub cancel: CancellationToken,
}

/// The pool's handle on a worker thread.
pub(crate) struct WorkerContext {
    assignments: Option<mpsc::UnboundedSender<Assignment>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerContext {
    pub fn spawn(
        id: WorkerId,
        executor: Arc<dyn TaskExecutor>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Self, PoolError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let thread = thread::Builder::new()
            .name(format!("kiln-worker-{id}"))
            .spawn(move || run(id, executor, rx, events))
            .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;

        tracing::debug!(worker_id = id, "Worker context spawned");
        Ok(Self {
            assignments: Some(tx),
            thread: Some(thread),
        })
    }

    /// Hand a task to the thread. Fails if the thread is gone.
    pub fn assign(&self, assignment: Assignment) -> Result<(), Assignment> {
        match &self.assignments {
            Some(tx) => tx.send(assignment).map_err(|e| e.0),
            None => Err(assignment),
        }
    }

    /// Close the assignment channel so the thread exits once idle.
    /// Returns the join handle for callers that want to wait.
    pub fn close(mut self) -> Option<JoinHandle<()>> {
        self.assignments = None;
        self.thread.take()
    }
}

fn run(
    id: WorkerId,
    executor: Arc<dyn TaskExecutor>,
    mut assignments: mpsc::UnboundedReceiver<Assignment>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    while let Some(Assignment { request, cancel }) = assignments.blocking_recv() {
        let task_id = request.id;
        let ctx = TaskContext::new(task_id, id, ProgressSink::Pool(events.clone()), cancel);

        match panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&request, &ctx))) {
            Ok(outcome) => {
                let _ = events.send(WorkerEvent::Finished {
                    worker_id: id,
                    task_id,
                    outcome,
                });
            }
            Err(payload) => {
                let _ = events.send(WorkerEvent::Crashed {
                    worker_id: id,
                    task_id: Some(task_id),
                    message: panic_message(payload.as_ref()),
                    exit_code: CRASH_EXIT_CODE,
                });
                return;
            }
        }
    }
    tracing::debug!(worker_id = id, "Worker context exiting");
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
