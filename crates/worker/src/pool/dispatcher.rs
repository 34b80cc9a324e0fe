//! The pool actor: sole owner of worker records, the idle set and the
//! pending queue.
//!
//! Commands from [`WorkerPool`](super::WorkerPool) and events from worker
//! threads are handled one at a time. After each change the actor
//! dispatches as much of the queue as idle workers allow and publishes a
//! fresh [`PoolStatus`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use kiln_core::task::{TaskError, TaskId, TaskProgress, TaskRequest, TaskResult};
use kiln_core::types::WorkerId;
use kiln_core::worker_state::{WorkerRecord, WorkerState};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::executor::TaskExecutor;

use super::context::{Assignment, WorkerContext, WorkerEvent};
use super::{
    FaultSender, PoolConfig, PoolError, PoolStatus, ProgressListener, WorkerFault,
    TERMINATE_JOIN_TIMEOUT,
};

type Reply = oneshot::Sender<Result<TaskResult, PoolError>>;

pub(crate) enum PoolCommand {
    Submit {
        request: TaskRequest,
        reply: Reply,
        progress: Option<ProgressListener>,
        cancel: CancellationToken,
    },
    RegisterProgress {
        task_id: TaskId,
        listener: ProgressListener,
    },
    Retire {
        worker_id: WorkerId,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    SpawnReplacement {
        failed: WorkerId,
        reply: oneshot::Sender<Result<WorkerId, PoolError>>,
    },
    Terminate {
        reply: oneshot::Sender<()>,
    },
}

struct PendingTask {
    request: TaskRequest,
    reply: Reply,
    progress: Option<ProgressListener>,
    cancel: CancellationToken,
    queued_at: Instant,
}

struct InFlight {
    worker_id: WorkerId,
    reply: Reply,
    progress: Option<ProgressListener>,
    cancel: CancellationToken,
}

/// A worker record plus its thread handle and usage counters.
struct WorkerSlot {
    record: WorkerRecord,
    context: WorkerContext,
    spawned_at: Instant,
    busy_total: Duration,
    busy_since: Option<Instant>,
}

impl WorkerSlot {
    fn refresh_metrics(&mut self, now: Instant) {
        let alive = now.duration_since(self.spawned_at);
        let busy = self.busy_total + self.busy_since.map_or(Duration::ZERO, |s| now - s);
        let metrics = &mut self.record.last_metrics;
        if !alive.is_zero() {
            metrics.cpu_usage_percent = (busy.as_secs_f64() / alive.as_secs_f64() * 100.0).min(100.0);
            metrics.throughput_per_min = metrics.completed_tasks as f64 / (alive.as_secs_f64() / 60.0);
        }
    }

    fn mark_idle(&mut self, now: Instant) {
        if let Some(since) = self.busy_since.take() {
            self.busy_total += now - since;
        }
    }
}

pub(crate) struct PoolActor {
    config: PoolConfig,
    executor: Arc<dyn TaskExecutor>,
    faults: Option<FaultSender>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    status_tx: watch::Sender<PoolStatus>,

    workers: HashMap<WorkerId, WorkerSlot>,
    idle: VecDeque<WorkerId>,
    queue: VecDeque<PendingTask>,
    in_flight: HashMap<TaskId, InFlight>,
    next_worker_id: WorkerId,

    completed: u64,
    failed: u64,
    dispatched: u64,
    dispatch_latency_total: Duration,
    terminated: bool,
}

impl PoolActor {
    /// Spawn the initial workers and the actor task.
    pub fn spawn(
        config: PoolConfig,
        executor: Arc<dyn TaskExecutor>,
        faults: Option<FaultSender>,
    ) -> Result<(mpsc::UnboundedSender<PoolCommand>, watch::Receiver<PoolStatus>), PoolError> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PoolStatus {
            pool_size: config.size,
            ..Default::default()
        });

        let mut actor = PoolActor {
            config,
            executor,
            faults,
            events_tx,
            status_tx,
            workers: HashMap::new(),
            idle: VecDeque::new(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            next_worker_id: 1,
            completed: 0,
            failed: 0,
            dispatched: 0,
            dispatch_latency_total: Duration::ZERO,
            terminated: false,
        };

        for _ in 0..actor.config.size {
            if let Err(e) = actor.spawn_worker() {
                actor.shutdown_threads();
                return Err(e);
            }
        }
        actor.publish_status();

        tokio::spawn(actor.run(commands_rx, events_rx));
        Ok((commands_tx, status_rx))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // Every handle dropped.
                        if !self.terminated {
                            self.terminate().await;
                        }
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
            self.dispatch();
            self.publish_status();
        }
        tracing::debug!("Worker pool actor stopped");
    }

    // -- commands ---------------------------------------------------------------

    async fn handle_command(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Submit {
                request,
                reply,
                progress,
                cancel,
            } => {
                if self.terminated {
                    let _ = reply.send(Err(PoolError::Terminated));
                    return;
                }
                tracing::debug!(task_id = %request.id, kind = %request.kind, "Task queued");
                self.queue.push_back(PendingTask {
                    request,
                    reply,
                    progress,
                    cancel,
                    queued_at: Instant::now(),
                });
            }
            PoolCommand::RegisterProgress { task_id, listener } => {
                if let Some(task) = self.in_flight.get_mut(&task_id) {
                    task.progress = Some(listener);
                } else if let Some(task) = self.queue.iter_mut().find(|t| t.request.id == task_id) {
                    task.progress = Some(listener);
                } else {
                    tracing::debug!(task_id = %task_id, "Progress listener for unknown task ignored");
                }
            }
            PoolCommand::Retire { worker_id, reply } => {
                let _ = reply.send(self.retire(worker_id));
            }
            PoolCommand::SpawnReplacement { failed, reply } => {
                let _ = reply.send(self.replace(failed));
            }
            PoolCommand::Terminate { reply } => {
                if !self.terminated {
                    self.terminate().await;
                }
                let _ = reply.send(());
            }
        }
    }

    // -- events -----------------------------------------------------------------

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Progress {
                worker_id,
                task_id,
                data,
            } => self.forward_progress(worker_id, task_id, data),
            WorkerEvent::Memory {
                worker_id,
                megabytes,
            } => {
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.record.last_metrics.memory_usage_mb = megabytes;
                }
            }
            WorkerEvent::Finished {
                worker_id,
                task_id,
                outcome,
            } => self.on_finished(worker_id, task_id, outcome),
            WorkerEvent::Crashed {
                worker_id,
                task_id,
                message,
                exit_code,
            } => self.on_crashed(worker_id, task_id, message, exit_code),
            WorkerEvent::TimedOut { worker_id, task_id } => self.on_timed_out(worker_id, task_id),
        }
    }

    fn forward_progress(&mut self, worker_id: WorkerId, task_id: TaskId, data: Value) {
        let Some(task) = self.in_flight.get_mut(&task_id) else {
            return;
        };
        if task.worker_id != worker_id {
            return;
        }
        if let Some(listener) = &task.progress {
            let progress = TaskProgress {
                task_id,
                data,
                emitted_at: chrono::Utc::now(),
            };
            if listener.send(progress).is_err() {
                task.progress = None;
            }
        }
    }

    /// Whether `worker_id` is live and currently running `task_id`.
    fn owns_task(&self, worker_id: WorkerId, task_id: TaskId) -> bool {
        self.workers.get(&worker_id).is_some_and(|slot| {
            slot.record.state == WorkerState::Busy && slot.record.current_task == Some(task_id)
        })
    }

    fn on_finished(&mut self, worker_id: WorkerId, task_id: TaskId, outcome: Result<Value, TaskError>) {
        if !self.owns_task(worker_id, task_id) {
            tracing::debug!(worker_id, task_id = %task_id, "Late result from abandoned worker ignored");
            return;
        }
        let now = Instant::now();
        if let Some(slot) = self.workers.get_mut(&worker_id) {
            if let Err(e) = slot.record.release() {
                tracing::error!(worker_id, error = %e, "Worker release rejected");
            }
            slot.mark_idle(now);
            match &outcome {
                Ok(_) => slot.record.last_metrics.completed_tasks += 1,
                Err(_) => slot.record.last_metrics.failed_tasks += 1,
            }
        }
        self.idle.push_back(worker_id);

        let Some(task) = self.in_flight.remove(&task_id) else {
            return;
        };
        let result = match outcome {
            Ok(value) => {
                self.completed += 1;
                tracing::debug!(worker_id, task_id = %task_id, "Task completed");
                Ok(TaskResult::succeeded(task_id, value))
            }
            Err(e) => {
                self.failed += 1;
                tracing::warn!(worker_id, task_id = %task_id, error = %e, "Task failed");
                Err(PoolError::TaskFailed(e.to_string()))
            }
        };
        let _ = task.reply.send(result);
    }

    fn on_crashed(
        &mut self,
        worker_id: WorkerId,
        task_id: Option<TaskId>,
        message: String,
        exit_code: i32,
    ) {
        let live = self
            .workers
            .get(&worker_id)
            .is_some_and(|s| matches!(s.record.state, WorkerState::Idle | WorkerState::Busy));
        if !live {
            tracing::debug!(worker_id, "Crash report from retired worker ignored");
            return;
        }
        tracing::error!(worker_id, exit_code, error = %message, "Worker crashed");

        let in_flight = self.fail_worker(worker_id);
        if let Some(task) = in_flight.or(task_id).and_then(|t| self.in_flight.remove(&t)) {
            self.failed += 1;
            let _ = task.reply.send(Err(PoolError::WorkerCrashed {
                worker_id,
                message: message.clone(),
            }));
        }

        self.report_fault(WorkerFault::new(worker_id, task_id, message, exit_code));
    }

    fn on_timed_out(&mut self, worker_id: WorkerId, task_id: TaskId) {
        if !self.owns_task(worker_id, task_id) {
            return;
        }
        let Some(limit) = self.config.task_timeout else {
            return;
        };
        tracing::warn!(worker_id, task_id = %task_id, timeout_ms = limit.as_millis() as u64, "Task timed out, abandoning worker");

        self.fail_worker(worker_id);
        if let Some(task) = self.in_flight.remove(&task_id) {
            task.cancel.cancel();
            self.failed += 1;
            let _ = task.reply.send(Err(PoolError::TimedOut(limit)));
        }

        self.report_fault(WorkerFault::new(
            worker_id,
            Some(task_id),
            format!("task {task_id} exceeded {limit:?}"),
            0,
        ));
    }

    /// Move a worker to Error and out of the idle set. Returns its task.
    fn fail_worker(&mut self, worker_id: WorkerId) -> Option<TaskId> {
        self.idle.retain(|id| *id != worker_id);
        let slot = self.workers.get_mut(&worker_id)?;
        slot.mark_idle(Instant::now());
        slot.record.last_metrics.failed_tasks += 1;
        match slot.record.fail() {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Worker fail transition rejected");
                None
            }
        }
    }

    /// Hand the fault to the error handler, or replace the worker here if
    /// none is attached.
    fn report_fault(&mut self, fault: WorkerFault) {
        let worker_id = fault.worker_id;
        let fault = match &self.faults {
            Some(tx) => match tx.send(fault) {
                Ok(()) => return,
                Err(e) => e.0,
            },
            None => fault,
        };
        tracing::info!(worker_id = fault.worker_id, "No error handler attached, replacing worker directly");
        let _ = self.retire(worker_id);
        if let Err(e) = self.replace(worker_id) {
            tracing::error!(worker_id, error = %e, "Direct worker replacement failed");
        }
    }

    // -- worker lifecycle -------------------------------------------------------

    fn spawn_worker(&mut self) -> Result<WorkerId, PoolError> {
        let id = self.next_worker_id;
        let context = WorkerContext::spawn(id, Arc::clone(&self.executor), self.events_tx.clone())?;
        self.next_worker_id += 1;
        self.workers.insert(
            id,
            WorkerSlot {
                record: WorkerRecord::new(id),
                context,
                spawned_at: Instant::now(),
                busy_total: Duration::ZERO,
                busy_since: None,
            },
        );
        self.idle.push_back(id);
        Ok(id)
    }

    fn live_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|s| matches!(s.record.state, WorkerState::Idle | WorkerState::Busy))
            .count()
    }

    /// Terminate a failed context and drop it from the pool.
    fn retire(&mut self, worker_id: WorkerId) -> Result<(), PoolError> {
        let mut slot = self
            .workers
            .remove(&worker_id)
            .ok_or(PoolError::UnknownWorker(worker_id))?;
        self.idle.retain(|id| *id != worker_id);

        if let Some(task_id) = slot.record.current_task {
            if let Some(task) = self.in_flight.remove(&task_id) {
                task.cancel.cancel();
                self.failed += 1;
                let _ = task.reply.send(Err(PoolError::Terminated));
            }
        }
        if let Err(e) = slot.record.terminate() {
            tracing::debug!(worker_id, error = %e, "Worker already terminated");
        }
        // A stuck thread is detached; it exits once its task returns.
        drop(slot.context.close());
        tracing::info!(worker_id, "Worker retired");
        Ok(())
    }

    fn replace(&mut self, failed: WorkerId) -> Result<WorkerId, PoolError> {
        if self.terminated {
            return Err(PoolError::Terminated);
        }
        let live = self.live_workers();
        if live >= self.config.size {
            return Err(PoolError::AtCapacity(live));
        }
        let id = self.spawn_worker()?;
        tracing::info!(failed_worker = failed, worker_id = id, "Replacement worker spawned");
        Ok(id)
    }

    // -- dispatch ---------------------------------------------------------------

    /// Pair queued tasks with idle workers in submission order.
    fn dispatch(&mut self) {
        if self.terminated {
            return;
        }
        while !self.queue.is_empty() {
            let Some(worker_id) = self.idle.pop_front() else {
                break;
            };
            let Some(task) = self.queue.pop_front() else {
                self.idle.push_front(worker_id);
                break;
            };

            if task.cancel.is_cancelled() {
                self.idle.push_front(worker_id);
                self.failed += 1;
                let _ = task
                    .reply
                    .send(Err(PoolError::TaskFailed(TaskError::Cancelled.to_string())));
                continue;
            }

            self.assign(worker_id, task);
        }
    }

    fn assign(&mut self, worker_id: WorkerId, task: PendingTask) {
        let Some(slot) = self.workers.get_mut(&worker_id) else {
            self.queue.push_front(task);
            return;
        };
        let task_id = task.request.id;
        if let Err(e) = slot.record.assign(task_id) {
            tracing::error!(worker_id, error = %e, "Worker assignment rejected");
            self.queue.push_front(task);
            return;
        }

        let now = Instant::now();
        slot.busy_since = Some(now);
        self.dispatched += 1;
        self.dispatch_latency_total += now - task.queued_at;

        let assignment = Assignment {
            request: task.request,
            cancel: task.cancel.clone(),
        };
        self.in_flight.insert(
            task_id,
            InFlight {
                worker_id,
                reply: task.reply,
                progress: task.progress,
                cancel: task.cancel,
            },
        );

        if slot.context.assign(assignment).is_err() {
            // The thread is gone without having reported a crash.
            self.on_crashed(
                worker_id,
                Some(task_id),
                "worker thread exited unexpectedly".into(),
                super::context::CRASH_EXIT_CODE,
            );
            return;
        }
        tracing::debug!(worker_id, task_id = %task_id, "Task dispatched");

        if let Some(limit) = self.config.task_timeout {
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                let _ = events.send(WorkerEvent::TimedOut { worker_id, task_id });
            });
        }
    }

    // -- shutdown ---------------------------------------------------------------

    async fn terminate(&mut self) {
        self.terminated = true;
        let rejected = self.queue.len() + self.in_flight.len();

        for task in self.queue.drain(..) {
            let _ = task.reply.send(Err(PoolError::Terminated));
        }
        for (_, task) in self.in_flight.drain() {
            task.cancel.cancel();
            let _ = task.reply.send(Err(PoolError::Terminated));
        }

        let handles = self.shutdown_threads();
        if !handles.is_empty() {
            let join = tokio::task::spawn_blocking(move || {
                for handle in handles {
                    let _ = handle.join();
                }
            });
            if tokio::time::timeout(TERMINATE_JOIN_TIMEOUT, join).await.is_err() {
                tracing::warn!("Timed out waiting for idle workers to exit");
            }
        }
        tracing::info!(rejected, "Worker pool terminated");
    }

    /// Close every context. Returns join handles of the idle ones; busy
    /// threads are detached.
    fn shutdown_threads(&mut self) -> Vec<JoinHandle<()>> {
        self.idle.clear();
        let mut handles = Vec::new();
        for (_, mut slot) in self.workers.drain() {
            let was_idle = slot.record.is_idle();
            let _ = slot.record.terminate();
            if let Some(handle) = slot.context.close() {
                if was_idle {
                    handles.push(handle);
                }
            }
        }
        handles
    }

    // -- status -----------------------------------------------------------------

    fn publish_status(&mut self) {
        let now = Instant::now();
        let mut workers: Vec<_> = self
            .workers
            .values_mut()
            .filter(|s| matches!(s.record.state, WorkerState::Idle | WorkerState::Busy))
            .map(|s| {
                s.refresh_metrics(now);
                s.record.last_metrics.clone()
            })
            .collect();
        workers.sort_by_key(|m| m.worker_id);

        let busy = self
            .workers
            .values()
            .filter(|s| s.record.state == WorkerState::Busy)
            .count();

        let status = PoolStatus {
            pool_size: self.config.size,
            live_workers: workers.len(),
            busy_workers: busy,
            queue_depth: self.queue.len(),
            completed_tasks: self.completed,
            failed_tasks: self.failed,
            average_dispatch_latency_ms: if self.dispatched == 0 {
                0.0
            } else {
                self.dispatch_latency_total.as_secs_f64() * 1000.0 / self.dispatched as f64
            },
            workers,
            terminated: self.terminated,
        };
        self.status_tx.send_replace(status);
    }
}
