//! Repository layer: one unit struct per table family, each method taking
//! `&PgPool` and returning `sqlx::Error`.

pub mod error_log_repo;
pub mod performance_repo;
pub mod progress_log_repo;
pub mod session_repo;

pub use error_log_repo::ErrorLogRepo;
pub use performance_repo::PerformanceRepo;
pub use progress_log_repo::ProgressLogRepo;
pub use session_repo::SessionRepo;
