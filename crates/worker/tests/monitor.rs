mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{executor, pool_config, wait_for_status, WAIT};
use kiln_core::alert::{AlertSeverity, AlertType};
use kiln_core::task::{TaskError, TaskKind};
use kiln_db::MemoryStore;
use kiln_worker::monitor::MonitorConfig;
use kiln_worker::{PerformanceMonitor, WorkerPool};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_crashes_raise_an_error_rate_alert() {
    let crash_on_odd = executor(|req, _| -> Result<Value, TaskError> {
        if req.payload.as_u64().is_some_and(|n| n % 2 == 1) {
            panic!("native backend aborted");
        }
        Ok(req.payload.clone())
    });
    let pool = WorkerPool::start(&pool_config(2), crash_on_odd, None).unwrap();

    let monitor = Arc::new(PerformanceMonitor::new(
        MonitorConfig {
            alert_cooldown: Duration::ZERO,
            ..Default::default()
        },
        Arc::new(MemoryStore::new()),
    ));
    let mut alerts = monitor.subscribe_alerts();
    let cancel = CancellationToken::new();
    let loops = monitor.start(pool.subscribe_status(), cancel.clone());

    let results =
        futures::future::join_all((0..10u64).map(|i| pool.submit(TaskKind::Train, json!(i)))).await;
    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 5);

    // The crashed workers were retired; only the pool counters remember them.
    let status = wait_for_status(&pool, |s| s.failed_tasks == 5 && s.live_workers == 2).await;
    let live_failed: u64 = status.workers.iter().map(|w| w.failed_tasks).sum();
    assert_eq!(live_failed, 0);

    let alert = tokio::time::timeout(WAIT, async {
        loop {
            match alerts.recv().await {
                Ok(alert) if alert.alert_type == AlertType::ErrorRate => return alert,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("alert channel closed"),
            }
        }
    })
    .await
    .expect("no error rate alert");
    assert_eq!(alert.severity, AlertSeverity::Critical);
    assert!(monitor.metrics().await.error_rate > 0.0);

    cancel.cancel();
    for handle in loops {
        handle.await.unwrap();
    }
    pool.terminate().await;
}
