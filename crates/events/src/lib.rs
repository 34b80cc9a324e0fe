//! Kiln training event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`TrainingEvent`]: the envelope for session lifecycle broadcasts.

pub mod bus;

pub use bus::{EventBus, TrainingEvent};
