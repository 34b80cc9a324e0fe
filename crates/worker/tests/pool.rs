mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use common::{cancellable_sleep, echo, executor, pool_config, wait_for_status, WAIT};
use kiln_core::task::{TaskError, TaskKind};
use kiln_worker::pool::{fault_channel, PoolConfig, PoolError, SubmitOptions, WorkerPool};
use serde_json::{json, Value};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrency_never_exceeds_pool_size() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let exec = {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        executor(move |req, _| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(req.payload.clone())
        })
    };
    let pool = WorkerPool::start(&pool_config(2), exec, None).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| pool.submit(TaskKind::Preprocess, json!(i)))
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        assert_eq!(result.value(), Some(&json!(i)));
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    let status = wait_for_status(&pool, |s| s.completed_tasks == 8).await;
    assert_eq!(status.busy_workers, 0);
    assert_eq!(status.queue_depth, 0);
    pool.terminate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_tasks_run_in_submission_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let exec = {
        let order = Arc::clone(&order);
        executor(move |req, _| {
            std::thread::sleep(Duration::from_millis(5));
            order.lock().unwrap().push(req.payload.as_u64().unwrap());
            Ok(Value::Null)
        })
    };
    let pool = WorkerPool::start(&pool_config(1), exec, None).unwrap();

    let handles: Vec<_> = (0..6u64)
        .map(|i| pool.submit(TaskKind::Evaluate, json!(i)))
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    pool.terminate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn task_error_keeps_worker_alive() {
    let exec = executor(|req, _| match req.payload.as_str() {
        Some("bad") => Err(TaskError::InvalidPayload("bad input".into())),
        _ => Ok(json!("ok")),
    });
    let pool = WorkerPool::start(&pool_config(1), exec, None).unwrap();

    let failed = pool.submit(TaskKind::Train, json!("bad")).await;
    assert_matches!(failed, Err(PoolError::TaskFailed(msg)) if msg.contains("bad input"));

    let ok = pool.submit(TaskKind::Train, json!("good")).await.unwrap();
    assert!(ok.is_success());

    let status = wait_for_status(&pool, |s| s.completed_tasks == 1).await;
    assert_eq!(status.failed_tasks, 1);
    assert_eq!(status.live_workers, 1);
    assert_eq!(status.workers[0].failed_tasks, 1);
    pool.terminate().await;
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_arrives_in_order_then_closes() {
    let exec = executor(|_, ctx| {
        for step in 0..20 {
            ctx.report_progress(&json!({ "step": step }));
        }
        Ok(json!("done"))
    });
    let pool = WorkerPool::start(&pool_config(1), exec, None).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = pool.submit_with(
        TaskKind::Train,
        Value::Null,
        SubmitOptions {
            progress: Some(tx),
            ..Default::default()
        },
    );
    let task_id = handle.id();
    handle.await.unwrap();

    let mut steps = Vec::new();
    while let Some(progress) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap() {
        assert_eq!(progress.task_id, task_id);
        steps.push(progress.data["step"].as_u64().unwrap());
    }
    assert_eq!(steps, (0..20).collect::<Vec<_>>());
    pool.terminate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_can_be_registered_while_queued() {
    let exec = executor(|req, ctx| {
        std::thread::sleep(Duration::from_millis(20));
        ctx.report_progress(&req.payload);
        Ok(Value::Null)
    });
    let pool = WorkerPool::start(&pool_config(1), exec, None).unwrap();

    let first = pool.submit(TaskKind::Train, json!("first"));
    let second = pool.submit(TaskKind::Train, json!("second"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.register_progress_listener(second.id(), tx);

    first.await.unwrap();
    second.await.unwrap();
    let progress = rx.recv().await.unwrap();
    assert_eq!(progress.data, json!("second"));
    assert!(rx.recv().await.is_none());
    pool.terminate().await;
}

// ---------------------------------------------------------------------------
// Crashes
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_fails_only_its_own_task() {
    let exec = executor(|req, _| {
        if req.payload == json!(3) {
            panic!("worker blew up");
        }
        std::thread::sleep(Duration::from_millis(10));
        Ok(req.payload.clone())
    });
    let pool = WorkerPool::start(&pool_config(2), exec, None).unwrap();

    let handles: Vec<_> = (0..6)
        .map(|i| pool.submit(TaskKind::Optimize, json!(i)))
        .collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await);
    }

    for (i, result) in results.iter().enumerate() {
        if i == 3 {
            assert_matches!(
                result,
                Err(PoolError::WorkerCrashed { message, .. }) if message == "worker blew up"
            );
        } else {
            assert_eq!(result.as_ref().unwrap().value(), Some(&json!(i)));
        }
    }

    // Without an error handler the pool replaces the context itself.
    let status = wait_for_status(&pool, |s| s.live_workers == 2 && s.busy_workers == 0).await;
    assert_eq!(status.failed_tasks, 1);
    assert_eq!(status.completed_tasks, 5);
    assert!(status.workers.iter().any(|w| w.worker_id == 3));

    let after = pool.submit(TaskKind::Optimize, json!(10)).await.unwrap();
    assert!(after.is_success());
    pool.terminate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_is_reported_to_fault_channel() {
    let exec = executor(|_, _| -> Result<Value, TaskError> { panic!("segfault") });
    let (fault_tx, mut fault_rx) = fault_channel();
    let pool = WorkerPool::start(&pool_config(1), exec, Some(fault_tx)).unwrap();

    let handle = pool.submit(TaskKind::Train, Value::Null);
    let task_id = handle.id();
    assert_matches!(handle.await, Err(PoolError::WorkerCrashed { worker_id: 1, .. }));

    let fault = tokio::time::timeout(WAIT, fault_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fault.worker_id, 1);
    assert_eq!(fault.task_id, Some(task_id));
    assert_eq!(fault.exit_code, 1);
    assert_eq!(fault.message, "segfault");

    // The handler owns replacement now: the slot stays empty until asked.
    let status = wait_for_status(&pool, |s| s.live_workers == 0).await;
    assert_eq!(status.pool_size, 1);
    pool.terminate().await;
}

// ---------------------------------------------------------------------------
// Timeout
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stuck_task_times_out_and_worker_is_replaced() {
    let exec = executor(|req, ctx| {
        if req.payload == json!("stuck") {
            cancellable_sleep(ctx, Duration::from_secs(5));
            return Err(TaskError::Cancelled);
        }
        Ok(Value::Null)
    });
    let config = PoolConfig {
        task_timeout: Some(Duration::from_millis(100)),
        ..pool_config(1)
    };
    let pool = WorkerPool::start(&config, exec, None).unwrap();

    let stuck = pool.submit(TaskKind::Train, json!("stuck")).await;
    assert_matches!(stuck, Err(PoolError::TimedOut(limit)) if limit == Duration::from_millis(100));

    wait_for_status(&pool, |s| s.live_workers == 1).await;
    let next = pool.submit(TaskKind::Train, json!("quick")).await;
    assert!(next.unwrap().is_success());
    pool.terminate().await;
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_rejects_pending_and_is_idempotent() {
    let exec = executor(|_, ctx| {
        cancellable_sleep(ctx, Duration::from_millis(500));
        Ok(Value::Null)
    });
    let pool = WorkerPool::start(&pool_config(1), exec, None).unwrap();

    let running = pool.submit(TaskKind::Train, Value::Null);
    let queued: Vec<_> = (0..3)
        .map(|_| pool.submit(TaskKind::Train, Value::Null))
        .collect();
    wait_for_status(&pool, |s| s.busy_workers == 1).await;

    pool.terminate().await;
    pool.terminate().await;

    assert_matches!(running.await, Err(PoolError::Terminated));
    for handle in queued {
        assert_matches!(handle.await, Err(PoolError::Terminated));
    }
    assert_matches!(
        pool.submit(TaskKind::Train, Value::Null).await,
        Err(PoolError::Terminated)
    );
    wait_for_status(&pool, |s| s.terminated).await;
}

// ---------------------------------------------------------------------------
// Fallback mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fallback_mode_runs_on_the_caller() {
    let caller = std::thread::current().id();
    let exec = executor(move |req, ctx| {
        assert_eq!(std::thread::current().id(), caller);
        ctx.report_progress(&json!("working"));
        Ok(req.payload.clone())
    });
    let config = PoolConfig {
        workers_enabled: false,
        ..pool_config(4)
    };
    let pool = WorkerPool::start(&config, exec, None).unwrap();
    assert!(pool.is_inline());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = pool.submit_with(
        TaskKind::Preprocess,
        json!({"n": 1}),
        SubmitOptions {
            progress: Some(tx),
            ..Default::default()
        },
    );
    // Already ran: progress is buffered and the listener dropped.
    assert_eq!(rx.recv().await.unwrap().data, json!("working"));
    assert!(rx.recv().await.is_none());

    let result = handle.await.unwrap();
    assert_eq!(result.value(), Some(&json!({"n": 1})));
    assert_eq!(pool.status().completed_tasks, 1);
}

#[tokio::test]
async fn fallback_mode_contains_panics() {
    let exec = executor(|_, _| -> Result<Value, TaskError> { panic!("inline crash") });
    let config = PoolConfig {
        workers_enabled: false,
        ..pool_config(1)
    };
    let pool = WorkerPool::start(&config, exec, None).unwrap();

    assert_matches!(
        pool.submit(TaskKind::Train, Value::Null).await,
        Err(PoolError::WorkerCrashed { worker_id: 0, .. })
    );
    // The caller survived and the pool keeps working.
    assert_matches!(
        pool.submit(TaskKind::Train, Value::Null).await,
        Err(PoolError::WorkerCrashed { .. })
    );
    pool.terminate().await;
    assert_matches!(
        pool.submit(TaskKind::Train, Value::Null).await,
        Err(PoolError::Terminated)
    );
}

#[tokio::test]
async fn echo_roundtrip_in_both_modes() {
    for workers_enabled in [true, false] {
        let config = PoolConfig {
            workers_enabled,
            ..pool_config(1)
        };
        let pool = WorkerPool::start(&config, echo(), None).unwrap();
        let result = pool.submit(TaskKind::Evaluate, json!([1, 2])).await.unwrap();
        assert_eq!(result.into_value(), Ok(json!([1, 2])));
        pool.terminate().await;
    }
}
