//! Shared helpers for the worker integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kiln_core::task::{TaskError, TaskRequest};
use kiln_worker::executor::{TaskContext, TaskExecutor};
use kiln_worker::pool::{PoolConfig, PoolStatus, WorkerPool};
use serde_json::Value;
use tokio::sync::watch;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn pool_config(size: usize) -> PoolConfig {
    PoolConfig {
        size,
        workers_enabled: true,
        task_timeout: None,
    }
}

/// Wrap a closure as a shareable executor.
pub fn executor<F>(f: F) -> Arc<dyn TaskExecutor>
where
    F: Fn(&TaskRequest, &TaskContext) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Executor that echoes the payload back.
pub fn echo() -> Arc<dyn TaskExecutor> {
    executor(|req, _| Ok(req.payload.clone()))
}

/// Wait until the pool publishes a status matching `pred`.
pub async fn wait_for_status(
    pool: &WorkerPool,
    pred: impl FnMut(&PoolStatus) -> bool,
) -> PoolStatus {
    let mut rx: watch::Receiver<PoolStatus> = pool.subscribe_status();
    let status = tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for pool status")
        .expect("pool status channel closed");
    status.clone()
}

/// Sleep on the worker thread, polling cancellation every 5ms.
pub fn cancellable_sleep(ctx: &TaskContext, total: Duration) -> bool {
    let step = Duration::from_millis(5);
    let mut slept = Duration::ZERO;
    while slept < total {
        if ctx.is_cancelled() {
            return false;
        }
        std::thread::sleep(step);
        slept += step;
    }
    true
}
