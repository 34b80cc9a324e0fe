//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans out [`TrainingEvent`]s to every subscriber. Publishing
//! never blocks and never fails: a slow subscriber lags, it does not hold up
//! the producer.

use chrono::{DateTime, Utc};
use kiln_core::training_events::{
    EVENT_TRAINING_COMPLETED, EVENT_TRAINING_FAILED, EVENT_TRAINING_PROGRESS,
    EVENT_TRAINING_STOPPED,
};
use kiln_core::types::DbId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// TrainingEvent
// ---------------------------------------------------------------------------

/// A training session lifecycle event.
///
/// The serialized payload always contains `model_id` and `session_id`
/// merged with the event-specific fields (see [`TrainingEvent::to_message`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingEvent {
    /// One of the `EVENT_TRAINING_*` names.
    pub event_type: String,
    pub model_id: DbId,
    pub session_id: DbId,
    /// Event-specific fields.
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl TrainingEvent {
    pub fn new(event_type: impl Into<String>, model_id: DbId, session_id: DbId) -> Self {
        Self {
            event_type: event_type.into(),
            model_id,
            session_id,
            payload: Value::Object(Map::new()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn progress(model_id: DbId, session_id: DbId, payload: Value) -> Self {
        Self::new(EVENT_TRAINING_PROGRESS, model_id, session_id).with_payload(payload)
    }

    pub fn completed(model_id: DbId, session_id: DbId, payload: Value) -> Self {
        Self::new(EVENT_TRAINING_COMPLETED, model_id, session_id).with_payload(payload)
    }

    pub fn failed(model_id: DbId, session_id: DbId, error: &str) -> Self {
        Self::new(EVENT_TRAINING_FAILED, model_id, session_id)
            .with_payload(serde_json::json!({ "error": error }))
    }

    pub fn stopped(model_id: DbId, session_id: DbId) -> Self {
        Self::new(EVENT_TRAINING_STOPPED, model_id, session_id)
    }

    /// Flat wire message: `{type, modelId fields..., payload fields...}`.
    ///
    /// Non-object payloads are placed under a `data` key.
    pub fn to_message(&self) -> Value {
        let mut msg = Map::new();
        msg.insert("type".into(), Value::String(self.event_type.clone()));
        msg.insert("model_id".into(), Value::from(self.model_id));
        msg.insert("session_id".into(), Value::from(self.session_id));
        match &self.payload {
            Value::Object(fields) => {
                for (k, v) in fields {
                    msg.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            Value::Null => {}
            other => {
                msg.insert("data".into(), other.clone());
            }
        }
        msg.insert("timestamp".into(), Value::String(self.timestamp.to_rfc3339()));
        Value::Object(msg)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus, shared as `Arc<EventBus>`.
pub struct EventBus {
    sender: broadcast::Sender<TrainingEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest messages are dropped and slow
    /// receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped if nobody listens.
    pub fn publish(&self, event: TrainingEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Training event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrainingEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(TrainingEvent::progress(7, 3, json!({"epoch": 1, "loss": 0.9})));

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.event_type, EVENT_TRAINING_PROGRESS);
        assert_eq!(received.model_id, 7);
        assert_eq!(received.session_id, 3);
        assert_eq!(received.payload["epoch"], 1);
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(TrainingEvent::stopped(1, 1));

        assert_eq!(rx1.recv().await.unwrap().event_type, EVENT_TRAINING_STOPPED);
        assert_eq!(rx2.recv().await.unwrap().event_type, EVENT_TRAINING_STOPPED);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(TrainingEvent::completed(1, 2, json!({})));
    }

    #[test]
    fn message_merges_ids_and_payload() {
        let msg = TrainingEvent::failed(4, 9, "dataset missing").to_message();
        assert_eq!(msg["type"], EVENT_TRAINING_FAILED);
        assert_eq!(msg["model_id"], 4);
        assert_eq!(msg["session_id"], 9);
        assert_eq!(msg["error"], "dataset missing");
        assert!(msg["timestamp"].is_string());
    }

    #[test]
    fn payload_cannot_override_ids() {
        let msg = TrainingEvent::progress(4, 9, json!({"model_id": 99})).to_message();
        assert_eq!(msg["model_id"], 4);
    }

    #[test]
    fn scalar_payload_goes_under_data() {
        let msg = TrainingEvent::progress(1, 1, json!(5)).to_message();
        assert_eq!(msg["data"], 5);
    }
}
