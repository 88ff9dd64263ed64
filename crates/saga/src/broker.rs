//! Broker-side publishers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use saga_store::OutboxMessage;

use crate::messages::StepCommand;
use crate::relay::{MessagePublisher, PublishError};

#[derive(Debug, Default)]
struct BrokerState {
    published: Vec<OutboxMessage>,
    /// Index of the first message not yet handed out by `take_commands`.
    delivered: usize,
    fail_next: u32,
    rejected: HashSet<String>,
}

/// In-process broker for tests and standalone runs.
///
/// Keeps every accepted message. Failure injection mimics an unreachable
/// broker (`fail_next`) or one that refuses a message type outright.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every message accepted so far, in publish order.
    pub fn published(&self) -> Vec<OutboxMessage> {
        self.state().published.clone()
    }

    /// Messages accepted for `aggregate_id`, in publish order.
    pub fn published_for(&self, aggregate_id: &str) -> Vec<OutboxMessage> {
        self.state()
            .published
            .iter()
            .filter(|message| message.aggregate_id == aggregate_id)
            .cloned()
            .collect()
    }

    /// Makes the next `count` publish calls fail transiently.
    pub fn fail_next(&self, count: u32) {
        self.state().fail_next = count;
    }

    /// Rejects every message of `event_type` from now on.
    pub fn reject_event_type(&self, event_type: impl Into<String>) {
        self.state().rejected.insert(event_type.into());
    }

    /// Drains the step commands published since the last call.
    ///
    /// Plays the role of the worker-side subscription.
    pub fn take_commands(&self) -> Vec<StepCommand> {
        let mut state = self.state();
        let start = state.delivered;
        state.delivered = state.published.len();
        state.published[start..]
            .iter()
            .filter_map(|message| match StepCommand::from_outbox(message)? {
                Ok(command) => Some(command),
                Err(err) => {
                    tracing::warn!(message_id = %message.id, error = %err, "undecodable step command");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        let mut state = self.state();
        if state.rejected.contains(&message.event_type) {
            return Err(PublishError::Rejected(format!(
                "event type '{}' is not accepted",
                message.event_type
            )));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(PublishError::Transient("broker unavailable".to_string()));
        }
        state.published.push(message.clone());
        Ok(())
    }
}

/// Publisher that only logs messages.
///
/// Used by the standalone server when no broker is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl MessagePublisher for TracingPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        tracing::info!(
            message_id = %message.id,
            aggregate_id = %message.aggregate_id,
            event_type = %message.event_type,
            payload = %message.payload,
            "message published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::ProcessId;
    use serde_json::{Map, json};

    use super::*;
    use crate::messages::{CommandKind, RESULT_TOPIC};

    fn command(step: &str) -> StepCommand {
        StepCommand {
            process_id: ProcessId::from("p-1"),
            process_type: "Test".to_string(),
            step_name: step.to_string(),
            action: step.to_string(),
            kind: CommandKind::Execute,
            attempt: 1,
            data: Map::new(),
            reply_to: RESULT_TOPIC.to_string(),
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_take_commands_drains_once() {
        let broker = InMemoryBroker::new();
        broker.publish(&command("A").to_outbox().unwrap()).await.unwrap();
        broker
            .publish(&OutboxMessage::new("Saga", "p-1", "SagaStarted", json!({})))
            .await
            .unwrap();

        let commands = broker.take_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].step_name, "A");
        assert!(broker.take_commands().is_empty());

        broker.publish(&command("B").to_outbox().unwrap()).await.unwrap();
        assert_eq!(broker.take_commands()[0].step_name, "B");
        assert_eq!(broker.published().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let broker = InMemoryBroker::new();
        let message = OutboxMessage::new("Saga", "p-1", "SagaStarted", json!({}));

        broker.fail_next(1);
        assert!(matches!(
            broker.publish(&message).await,
            Err(PublishError::Transient(_))
        ));
        assert!(broker.publish(&message).await.is_ok());

        broker.reject_event_type("SagaStarted");
        assert!(matches!(
            broker.publish(&message).await,
            Err(PublishError::Rejected(_))
        ));
        assert_eq!(broker.published_for("p-1").len(), 1);
    }
}
