use std::sync::Arc;
use std::time::Duration;

use kiln_db::{ErrorLogStore, MemoryStore, MetricsStore, PgStore, TrainingStore};
use kiln_events::EventBus;
use kiln_worker::backend::{select_backend, SyntheticDatasetLoader};
use kiln_worker::jobs::MlTaskExecutor;
use kiln_worker::pool::fault_channel;
use kiln_worker::recovery::WorkerRecovery;
use kiln_worker::{
    ErrorHandler, OrchestratorConfig, PerformanceMonitor, TrainingService, WorkerPool,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound for each background task to wind down after cancellation.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Stores {
    training: Arc<dyn TrainingStore>,
    errors: Arc<dyn ErrorLogStore>,
    metrics: Arc<dyn MetricsStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = OrchestratorConfig::from_env()?;
    tracing::info!(
        workers_enabled = config.pool.workers_enabled,
        pool_size = config.pool.size,
        backend = ?config.backend,
        "Configuration loaded"
    );

    let stores = open_stores(config.database_url.as_deref()).await?;
    let bus = Arc::new(EventBus::default());
    let cancel = CancellationToken::new();

    // --- Task execution ---
    let backend = select_backend(config.backend, config.simulated_epoch, None)?;
    let executor = Arc::new(MlTaskExecutor::new(
        backend,
        Arc::new(SyntheticDatasetLoader::default()),
    ));
    let (fault_tx, fault_rx) = fault_channel();
    let pool = WorkerPool::start(&config.pool, executor, Some(fault_tx))?;

    // --- Recovery ---
    let recovery: Arc<dyn WorkerRecovery> = pool.clone();
    let errors = Arc::new(ErrorHandler::new(
        config.recovery.clone(),
        recovery,
        Arc::clone(&stores.errors),
    ));
    let mut background = errors.start(fault_rx);

    // --- Monitoring ---
    let monitor = Arc::new(PerformanceMonitor::new(
        config.monitor.clone(),
        Arc::clone(&stores.metrics),
    ));
    background.extend(monitor.start(pool.subscribe_status(), cancel.clone()));

    // --- Training ---
    let training = Arc::new(TrainingService::new(
        Arc::clone(&pool),
        Arc::clone(&stores.training),
        Arc::clone(&bus),
        Some(Arc::clone(&errors)),
    ));

    background.push(tokio::spawn(log_events(bus.subscribe(), cancel.clone())));

    tracing::info!("Orchestrator ready");
    shutdown_signal().await;

    // --- Shutdown, in reverse order of startup ---
    training.shutdown(config.shutdown_timeout).await;
    pool.terminate().await;
    tracing::info!("Worker pool terminated");

    errors.shutdown().await;
    cancel.cancel();
    for handle in background {
        let _ = tokio::time::timeout(TASK_DRAIN_TIMEOUT, handle).await;
    }
    tracing::info!("Orchestrator stopped");
    Ok(())
}

/// Postgres when `DATABASE_URL` is set, otherwise the in-memory store.
async fn open_stores(database_url: Option<&str>) -> anyhow::Result<Stores> {
    let Some(url) = database_url else {
        tracing::warn!("DATABASE_URL not set, using in-memory store");
        let store = Arc::new(MemoryStore::new());
        return Ok(Stores {
            training: store.clone(),
            errors: store.clone(),
            metrics: store,
        });
    };

    let pool = kiln_db::create_pool(url).await?;
    kiln_db::health_check(&pool).await?;
    tracing::info!("Database connection established");

    kiln_db::run_migrations(&pool).await?;
    tracing::info!("Database migrations applied");

    let orphaned = kiln_db::repositories::SessionRepo::fail_orphaned(
        &pool,
        "orchestrator restarted while the session was running",
    )
    .await?;
    if orphaned > 0 {
        tracing::warn!(orphaned, "Marked sessions left running by a previous process as failed");
    }

    let store = Arc::new(PgStore::new(pool));
    Ok(Stores {
        training: store.clone(),
        errors: store.clone(),
        metrics: store,
    })
}

/// Log every bus event at debug level until shutdown.
async fn log_events(
    mut rx: broadcast::Receiver<kiln_events::TrainingEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => {
                    tracing::debug!(
                        event_type = %event.event_type,
                        model_id = event.model_id,
                        session_id = event.session_id,
                        payload = %event.payload,
                        "Training event"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
