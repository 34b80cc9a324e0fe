//! Synchronous fallback used when workers are disabled.
//!
//! Each submission runs the executor on the calling thread before
//! `submit` returns; the handle comes back already resolved. Panics are
//! still caught so a crashing task cannot take the caller down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use kiln_core::task::{TaskRequest, TaskResult};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::executor::{ProgressSink, TaskContext, TaskExecutor};

use super::context::panic_message;
use super::{PoolError, PoolStatus, ProgressListener, TaskHandle};

/// Pseudo worker id reported for inline execution.
const INLINE_WORKER_ID: u32 = 0;

pub(crate) struct InlineRunner {
    executor: Arc<dyn TaskExecutor>,
    status: watch::Sender<PoolStatus>,
    terminated: AtomicBool,
}

impl InlineRunner {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> (Self, watch::Receiver<PoolStatus>) {
        let (status, rx) = watch::channel(PoolStatus::default());
        (
            Self {
                executor,
                status,
                terminated: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn run(
        &self,
        request: TaskRequest,
        progress: Option<ProgressListener>,
        cancel: CancellationToken,
    ) -> TaskHandle {
        let (reply, rx) = oneshot::channel();
        let handle = TaskHandle::new(request.id, rx);

        if self.terminated.load(Ordering::Acquire) {
            let _ = reply.send(Err(PoolError::Terminated));
            return handle;
        }

        let started = Instant::now();
        // The listener lives inside the context and is dropped with it.
        let ctx = TaskContext::new(
            request.id,
            INLINE_WORKER_ID,
            ProgressSink::Direct(progress),
            cancel,
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.executor.execute(&request, &ctx)));
        drop(ctx);

        let result = match outcome {
            Ok(Ok(value)) => Ok(TaskResult::succeeded(request.id, value)),
            Ok(Err(e)) => Err(PoolError::TaskFailed(e.to_string())),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(task_id = %request.id, error = %message, "Inline task panicked");
                Err(PoolError::WorkerCrashed {
                    worker_id: INLINE_WORKER_ID,
                    message,
                })
            }
        };

        tracing::debug!(
            task_id = %request.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            success = result.is_ok(),
            "Inline task finished"
        );
        self.status.send_modify(|s| match &result {
            Ok(_) => s.completed_tasks += 1,
            Err(_) => s.failed_tasks += 1,
        });

        let _ = reply.send(result);
        handle
    }

    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.status.send_modify(|s| s.terminated = true);
            tracing::info!("Inline task runner terminated");
        }
    }
}
