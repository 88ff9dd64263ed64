use chrono::{DateTime, Utc};
use common::MessageId;
use serde::{Deserialize, Serialize};

/// A message staged for publication to the broker.
///
/// Outbox messages are written in the same transaction as the state change
/// they announce. The relay publishes them at least once; `published_at`
/// moves from `None` to a timestamp exactly once and is never reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Unique identifier for this message.
    pub id: MessageId,

    /// The kind of entity the message is about (e.g., "Saga").
    pub aggregate_type: String,

    /// The entity the message is about; relay ordering is per aggregate.
    pub aggregate_id: String,

    /// The message type (e.g., "saga.step.execute", "SagaCompleted").
    pub event_type: String,

    /// The message body as JSON.
    pub payload: serde_json::Value,

    /// When the message was staged.
    pub created_at: DateTime<Utc>,

    /// The relay will not pick the message up before this instant.
    pub available_at: DateTime<Utc>,

    /// When the relay confirmed publication.
    pub published_at: Option<DateTime<Utc>>,

    /// Number of failed publish attempts.
    pub retry_count: u32,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,

    /// When the message was handed to the dead-letter sink.
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Creates a message that is immediately available to the relay.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            created_at: now,
            available_at: now,
            published_at: None,
            retry_count: 0,
            last_error: None,
            dead_lettered_at: None,
        }
    }

    /// Delays relay of this message until `at`.
    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = at;
        self
    }

    /// Returns true while the message still awaits publication.
    pub fn is_pending(&self) -> bool {
        self.published_at.is_none() && self.dead_lettered_at.is_none()
    }

    /// Returns true if the relay may pick the message up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.available_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_message_is_due_immediately() {
        let message = OutboxMessage::new("Saga", "order-1", "SagaStarted", serde_json::json!({}));
        assert!(message.is_pending());
        assert!(message.is_due(Utc::now() + Duration::milliseconds(1)));
        assert_eq!(message.retry_count, 0);
    }

    #[test]
    fn delayed_message_is_not_due_early() {
        let later = Utc::now() + Duration::seconds(30);
        let message = OutboxMessage::new("Saga", "order-1", "SagaStarted", serde_json::json!({}))
            .available_at(later);
        assert!(!message.is_due(Utc::now()));
        assert!(message.is_due(later));
    }

    #[test]
    fn published_message_is_not_pending() {
        let mut message =
            OutboxMessage::new("Saga", "order-1", "SagaStarted", serde_json::json!({}));
        message.published_at = Some(Utc::now());
        assert!(!message.is_pending());
        assert!(!message.is_due(Utc::now()));
    }
}
