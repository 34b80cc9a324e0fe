//! Kiln orchestrator: a fixed-size pool of OS-thread workers running ML
//! tasks, with crash recovery, performance alerting and a training session
//! service on top.
//!
//! - [`pool`]: [`WorkerPool`], FIFO dispatch, progress forwarding, crash
//!   detection and the synchronous fallback mode.
//! - [`executor`]: the [`TaskExecutor`] seam and the per-task
//!   [`TaskContext`](executor::TaskContext).
//! - [`backend`] / [`jobs`]: training backends, dataset loading and the
//!   [`MlTaskExecutor`](jobs::MlTaskExecutor) that routes task kinds.
//! - [`recovery`]: [`ErrorHandler`], backoff-driven worker replacement and
//!   health reporting.
//! - [`monitor`]: [`PerformanceMonitor`], sampling cadences and threshold
//!   alerts.
//! - [`training`]: [`TrainingService`], single-flight session lifecycle.

pub mod backend;
pub mod config;
pub mod executor;
pub mod jobs;
pub mod monitor;
pub mod pool;
pub mod recovery;
pub mod training;

pub use config::OrchestratorConfig;
pub use executor::TaskExecutor;
pub use monitor::PerformanceMonitor;
pub use pool::{PoolError, TaskHandle, WorkerPool};
pub use recovery::ErrorHandler;
pub use training::{TrainingError, TrainingService};
