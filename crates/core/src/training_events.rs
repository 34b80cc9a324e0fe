//! Event type names broadcast for training session lifecycle changes.
//!
//! Every event payload carries `model_id` and `session_id` alongside the
//! event-specific fields.

/// One epoch finished (epoch, loss, accuracy, optional validation figures).
pub const EVENT_TRAINING_PROGRESS: &str = "training_progress";

/// Session finished all epochs.
pub const EVENT_TRAINING_COMPLETED: &str = "training_completed";

/// Session ended with an error.
pub const EVENT_TRAINING_FAILED: &str = "training_failed";

/// Session was stopped on request.
pub const EVENT_TRAINING_STOPPED: &str = "training_stopped";
