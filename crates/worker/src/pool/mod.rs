//! Fixed-size worker pool with FIFO dispatch.
//!
//! [`WorkerPool`] is a thin handle. All bookkeeping (workers, idle set,
//! pending queue, in-flight replies) lives in a single actor task that
//! consumes commands from the handle and events from worker threads, so
//! no lock guards pool state.
//!
//! When workers are disabled by configuration the pool runs every task
//! synchronously on the caller (see [`inline`]) behind the same API.

pub mod context;
mod dispatcher;
mod inline;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::task::{TaskId, TaskKind, TaskProgress, TaskRequest, TaskResult};
use kiln_core::types::{Timestamp, WorkerId};
use kiln_core::worker_state::WorkerMetrics;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::executor::TaskExecutor;
use crate::recovery::WorkerRecovery;

use self::dispatcher::{PoolActor, PoolCommand};
use self::inline::InlineRunner;

/// Upper bound on how long [`WorkerPool::terminate`] waits for idle
/// threads to exit.
pub const TERMINATE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker contexts kept alive.
    pub size: usize,
    /// `false` selects the synchronous fallback mode.
    pub workers_enabled: bool,
    /// Optional wall-clock limit per task. `None` disables it.
    pub task_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            size: parallelism.saturating_sub(1).max(1),
            workers_enabled: true,
            task_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    /// The task's own logic returned an error. The worker survived.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Worker {worker_id} crashed: {message}")]
    WorkerCrashed { worker_id: WorkerId, message: String },

    #[error("Task timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Worker pool terminated")]
    Terminated,

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("Pool already has {0} live workers")]
    AtCapacity(usize),
}

/// A crashed (or abandoned) worker, reported to the error handler.
#[derive(Debug, Clone)]
pub struct WorkerFault {
    pub worker_id: WorkerId,
    pub task_id: Option<TaskId>,
    pub message: String,
    pub exit_code: i32,
    pub occurred_at: Timestamp,
}

pub type FaultSender = mpsc::UnboundedSender<WorkerFault>;
pub type FaultReceiver = mpsc::UnboundedReceiver<WorkerFault>;

/// Channel connecting the pool's crash path to the error handler.
pub fn fault_channel() -> (FaultSender, FaultReceiver) {
    mpsc::unbounded_channel()
}

/// Receives a task's progress in emission order. Dropped by the pool once
/// the task finishes, so the receiver sees end-of-stream.
pub type ProgressListener = mpsc::UnboundedSender<TaskProgress>;

#[derive(Debug, Default)]
pub struct SubmitOptions {
    pub progress: Option<ProgressListener>,
    /// Cooperative stop signal handed to the task's context.
    pub cancel: Option<CancellationToken>,
}

/// Snapshot pushed after every pool state change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub live_workers: usize,
    pub busy_workers: usize,
    pub queue_depth: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub average_dispatch_latency_ms: f64,
    pub workers: Vec<WorkerMetrics>,
    pub terminated: bool,
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// Resolves exactly once with the task's result.
///
/// A task error resolves as [`PoolError::TaskFailed`]; a crash as
/// [`PoolError::WorkerCrashed`].
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<Result<TaskResult, PoolError>>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, rx: oneshot::Receiver<Result<TaskResult, PoolError>>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = Result<TaskResult, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(PoolError::Terminated)))
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

enum Mode {
    Threads {
        commands: mpsc::UnboundedSender<PoolCommand>,
    },
    Inline(InlineRunner),
}

pub struct WorkerPool {
    mode: Mode,
    status: watch::Receiver<PoolStatus>,
}

impl WorkerPool {
    /// Spawn `config.size` worker contexts and the pool actor.
    ///
    /// Must be called from within a Tokio runtime. Crashes are reported on
    /// `faults` when given; otherwise the pool replaces crashed workers
    /// itself.
    pub fn start(
        config: &PoolConfig,
        executor: Arc<dyn TaskExecutor>,
        faults: Option<FaultSender>,
    ) -> Result<Arc<Self>, PoolError> {
        if !config.workers_enabled {
            tracing::warn!("Workers disabled, running tasks synchronously on the caller");
            let (runner, status) = InlineRunner::new(executor);
            return Ok(Arc::new(Self {
                mode: Mode::Inline(runner),
                status,
            }));
        }

        let (commands, status) = PoolActor::spawn(config.clone(), executor, faults)?;
        tracing::info!(size = config.size, "Worker pool started");
        Ok(Arc::new(Self {
            mode: Mode::Threads { commands },
            status,
        }))
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.mode, Mode::Inline(_))
    }

    pub fn submit(&self, kind: TaskKind, payload: Value) -> TaskHandle {
        self.submit_with(kind, payload, SubmitOptions::default())
    }

    pub fn submit_with(&self, kind: TaskKind, payload: Value, options: SubmitOptions) -> TaskHandle {
        self.submit_request(TaskRequest::new(kind, payload), options)
    }

    /// Queue a prepared request. Dispatches at once if a worker is idle.
    pub fn submit_request(&self, request: TaskRequest, options: SubmitOptions) -> TaskHandle {
        let cancel = options.cancel.unwrap_or_default();
        match &self.mode {
            Mode::Inline(runner) => runner.run(request, options.progress, cancel),
            Mode::Threads { commands } => {
                let (reply, rx) = oneshot::channel();
                let handle = TaskHandle::new(request.id, rx);
                // A closed channel drops `reply`, resolving the handle as Terminated.
                let _ = commands.send(PoolCommand::Submit {
                    request,
                    reply,
                    progress: options.progress,
                    cancel,
                });
                handle
            }
        }
    }

    /// Attach (or replace) the progress listener of a queued or running
    /// task. Ignored for tasks that already finished.
    pub fn register_progress_listener(&self, task_id: TaskId, listener: ProgressListener) {
        if let Mode::Threads { commands } = &self.mode {
            let _ = commands.send(PoolCommand::RegisterProgress { task_id, listener });
        }
    }

    pub fn status(&self) -> PoolStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PoolStatus> {
        self.status.clone()
    }

    /// Stop every context and reject queued and in-flight tasks with
    /// [`PoolError::Terminated`]. Repeated calls are no-ops.
    pub async fn terminate(&self) {
        match &self.mode {
            Mode::Inline(runner) => runner.terminate(),
            Mode::Threads { commands } => {
                let (reply, rx) = oneshot::channel();
                if commands.send(PoolCommand::Terminate { reply }).is_ok() {
                    let _ = rx.await;
                }
            }
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, PoolError>>) -> PoolCommand,
    ) -> Result<T, PoolError> {
        let Mode::Threads { commands } = &self.mode else {
            return Err(PoolError::SpawnFailed(
                "workers are disabled in fallback mode".into(),
            ));
        };
        let (reply, rx) = oneshot::channel();
        commands
            .send(build(reply))
            .map_err(|_| PoolError::Terminated)?;
        rx.await.unwrap_or(Err(PoolError::Terminated))
    }
}

#[async_trait]
impl WorkerRecovery for WorkerPool {
    async fn retire_worker(&self, worker_id: WorkerId) -> Result<(), PoolError> {
        self.request(|reply| PoolCommand::Retire { worker_id, reply })
            .await
    }

    async fn spawn_replacement(&self, failed: WorkerId) -> Result<WorkerId, PoolError> {
        self.request(|reply| PoolCommand::SpawnReplacement { failed, reply })
            .await
    }
}

impl WorkerFault {
    pub fn new(
        worker_id: WorkerId,
        task_id: Option<TaskId>,
        message: impl Into<String>,
        exit_code: i32,
    ) -> Self {
        Self {
            worker_id,
            task_id,
            message: message.into(),
            exit_code,
            occurred_at: Utc::now(),
        }
    }
}
