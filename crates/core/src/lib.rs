//! Pure domain logic for the kiln training orchestrator.
//!
//! Nothing in this crate performs I/O. The worker crate drives these types
//! and the db crate persists them.

pub mod alert;
pub mod error;
pub mod recovery;
pub mod task;
pub mod thresholds;
pub mod training;
pub mod training_events;
pub mod types;
pub mod worker_state;
