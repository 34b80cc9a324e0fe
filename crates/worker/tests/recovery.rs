mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{executor, pool_config, wait_for_status, WAIT};
use kiln_core::recovery::{HealthStatus, WorkerErrorRecord, WorkerErrorStatus};
use kiln_core::task::{TaskError, TaskKind};
use kiln_db::MemoryStore;
use kiln_worker::pool::{fault_channel, PoolError};
use kiln_worker::recovery::{RecoveryConfig, WorkerRecovery};
use kiln_worker::{ErrorHandler, WorkerPool};
use serde_json::{json, Value};

fn fast_recovery() -> RecoveryConfig {
    RecoveryConfig {
        base_delay: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Poll the handler until `pred` holds for some record.
async fn wait_for_record(
    handler: &ErrorHandler,
    pred: impl Fn(&WorkerErrorRecord) -> bool,
) -> WorkerErrorRecord {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(record) = handler.worker_errors().await.into_iter().find(|r| pred(r)) {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for error record")
}

async fn recovered(handler: &ErrorHandler) -> usize {
    handler
        .worker_errors()
        .await
        .iter()
        .filter(|r| r.replacement_id.is_some())
        .count()
}

fn crash_on_boom() -> Arc<dyn kiln_worker::TaskExecutor> {
    executor(|req, _| -> Result<Value, TaskError> {
        if req.payload == json!("boom") {
            panic!("native backend aborted");
        }
        Ok(req.payload.clone())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_worker_is_replaced_by_the_handler() {
    let store = Arc::new(MemoryStore::new());
    let (fault_tx, fault_rx) = fault_channel();
    let pool = WorkerPool::start(&pool_config(2), crash_on_boom(), Some(fault_tx)).unwrap();
    let recovery: Arc<dyn WorkerRecovery> = pool.clone();
    let handler = Arc::new(ErrorHandler::new(
        fast_recovery(),
        recovery,
        store.clone(),
    ));
    let background = handler.start(fault_rx);

    assert_matches!(
        pool.submit(TaskKind::Train, json!("boom")).await,
        Err(PoolError::WorkerCrashed { message, .. }) if message == "native backend aborted"
    );

    let record = wait_for_record(&handler, |r| r.replacement_id.is_some()).await;
    assert_eq!(record.status, WorkerErrorStatus::Active);
    assert_eq!(record.recovery_attempts, 1);
    assert_eq!(record.replacement_id, Some(3));

    let status = wait_for_status(&pool, |s| s.workers.iter().any(|w| w.worker_id == 3)).await;
    assert_eq!(status.live_workers, 2);

    // The pool keeps serving at full size.
    let results =
        futures::future::join_all((0..4).map(|i| pool.submit(TaskKind::Evaluate, json!(i)))).await;
    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|r| r.is_success())));

    let stats = handler.error_statistics().await;
    assert_eq!(stats.total_observed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.error_rate, 0.0);
    assert!(stats.average_recovery_ms.is_some());
    assert_eq!(handler.health_summary().await.overall, HealthStatus::Healthy);

    let logged: Vec<_> = store
        .worker_error_logs()
        .await
        .into_iter()
        .map(|row| row.status)
        .collect();
    assert_eq!(logged.first().map(String::as_str), Some("recovering"));
    assert_eq!(logged.last().map(String::as_str), Some("active"));

    pool.terminate().await;
    handler.shutdown().await;
    for handle in background {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn each_crash_gets_its_own_record() {
    let store = Arc::new(MemoryStore::new());
    let (fault_tx, fault_rx) = fault_channel();
    let pool = WorkerPool::start(&pool_config(2), crash_on_boom(), Some(fault_tx)).unwrap();
    let recovery: Arc<dyn WorkerRecovery> = pool.clone();
    let handler = Arc::new(ErrorHandler::new(
        fast_recovery(),
        recovery,
        store,
    ));
    let background = handler.start(fault_rx);

    for crashes in 1..=2 {
        assert_matches!(
            pool.submit(TaskKind::Train, json!("boom")).await,
            Err(PoolError::WorkerCrashed { .. })
        );
        tokio::time::timeout(WAIT, async {
            while recovered(&handler).await < crashes {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("crash recovered");
    }

    assert_eq!(handler.error_statistics().await.total_observed, 2);

    pool.terminate().await;
    handler.shutdown().await;
    for handle in background {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovery_after_terminate_is_abandoned() {
    let store = Arc::new(MemoryStore::new());
    let (fault_tx, _fault_rx) = fault_channel();
    let pool = WorkerPool::start(&pool_config(1), crash_on_boom(), Some(fault_tx)).unwrap();
    let recovery: Arc<dyn WorkerRecovery> = pool.clone();
    let handler = ErrorHandler::new(fast_recovery(), recovery, store);

    assert_matches!(
        pool.submit(TaskKind::Train, json!("boom")).await,
        Err(PoolError::WorkerCrashed { .. })
    );
    pool.terminate().await;

    // Drive the fault by hand once the pool is gone.
    handler
        .handle_fault(kiln_worker::pool::WorkerFault::new(1, None, "late fault", 1))
        .await;

    let records = handler.worker_errors().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, WorkerErrorStatus::Terminated);
    assert_eq!(handler.error_statistics().await.failed, 0);
}
