//! The unit-of-work seam between the pool and task logic.
//!
//! A [`TaskExecutor`] runs synchronously on a worker thread (or on the
//! caller in fallback mode). It talks back to the pool only through the
//! [`TaskContext`] it is handed.

use chrono::Utc;
use kiln_core::task::{TaskError, TaskId, TaskProgress, TaskRequest};
use kiln_core::types::WorkerId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pool::context::WorkerEvent;
use crate::pool::ProgressListener;

/// Runs one task to completion.
///
/// Returning `Err` is a task failure: the worker survives and the caller's
/// handle rejects with the message. Panicking takes the worker down.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, request: &TaskRequest, ctx: &TaskContext) -> Result<Value, TaskError>;
}

impl<F> TaskExecutor for F
where
    F: Fn(&TaskRequest, &TaskContext) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    fn execute(&self, request: &TaskRequest, ctx: &TaskContext) -> Result<Value, TaskError> {
        self(request, ctx)
    }
}

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// Where progress and memory reports go.
pub(crate) enum ProgressSink {
    /// Through the pool's event channel (worker thread).
    Pool(mpsc::UnboundedSender<WorkerEvent>),
    /// Straight to the listener (fallback mode).
    Direct(Option<ProgressListener>),
}

/// Handle given to a running task.
pub struct TaskContext {
    task_id: TaskId,
    worker_id: WorkerId,
    sink: ProgressSink,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        worker_id: WorkerId,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            worker_id,
            sink,
            cancel,
        }
    }

    /// A context that is not attached to any pool. Progress is delivered
    /// to `listener` directly.
    pub fn detached(task_id: TaskId, listener: Option<ProgressListener>) -> Self {
        Self::new(
            task_id,
            0,
            ProgressSink::Direct(listener),
            CancellationToken::new(),
        )
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Id of the executing worker; 0 in fallback mode.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Emit a progress message. Never blocks; dropped if nobody listens.
    pub fn report_progress<T: Serialize + ?Sized>(&self, data: &T) {
        let data = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "Unserializable progress dropped");
                return;
            }
        };
        match &self.sink {
            ProgressSink::Pool(events) => {
                let _ = events.send(WorkerEvent::Progress {
                    worker_id: self.worker_id,
                    task_id: self.task_id,
                    data,
                });
            }
            ProgressSink::Direct(Some(listener)) => {
                let _ = listener.send(TaskProgress {
                    task_id: self.task_id,
                    data,
                    emitted_at: Utc::now(),
                });
            }
            ProgressSink::Direct(None) => {}
        }
    }

    /// Report this task's current memory footprint in megabytes.
    pub fn report_memory(&self, megabytes: f64) {
        if let ProgressSink::Pool(events) = &self.sink {
            let _ = events.send(WorkerEvent::Memory {
                worker_id: self.worker_id,
                megabytes,
            });
        }
    }

    /// Whether a stop was requested. Tasks poll this at safe points.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
