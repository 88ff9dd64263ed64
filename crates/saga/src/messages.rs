//! Wire contract between the orchestrator and step workers.

use chrono::{DateTime, Utc};
use common::ProcessId;
use saga_store::OutboxMessage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outbox event type of a step execution command.
pub const EXECUTE_EVENT_TYPE: &str = "saga.step.execute";

/// Outbox event type of a compensation command.
pub const COMPENSATE_EVENT_TYPE: &str = "saga.step.compensate";

/// Topic workers reply to with a [`StepResult`].
pub const RESULT_TOPIC: &str = "saga.step.result";

/// Aggregate type used for every outbox message the engine writes.
pub const SAGA_AGGREGATE_TYPE: &str = "Saga";

/// Separates the parts of an idempotency key. Reserved in process IDs and
/// step names.
pub const KEY_SEPARATOR: char = ':';

/// Whether a command runs a step or undoes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Execute,
    Compensate,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Execute => "execute",
            CommandKind::Compensate => "compensate",
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            CommandKind::Execute => EXECUTE_EVENT_TYPE,
            CommandKind::Compensate => COMPENSATE_EVENT_TYPE,
        }
    }
}

/// A command asking a worker to run (or undo) one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCommand {
    pub process_id: ProcessId,
    pub process_type: String,
    pub step_name: String,
    /// The registered action: the step itself, or its compensation.
    pub action: String,
    pub kind: CommandKind,
    /// 1-based dispatch attempt, echoed back in the result.
    pub attempt: u32,
    pub data: Map<String, Value>,
    pub reply_to: String,
    pub deadline: Option<DateTime<Utc>>,
}

impl StepCommand {
    /// Wraps the command in an outbox message keyed by its process.
    pub fn to_outbox(&self) -> Result<OutboxMessage, serde_json::Error> {
        Ok(OutboxMessage::new(
            SAGA_AGGREGATE_TYPE,
            self.process_id.as_str(),
            self.kind.event_type(),
            serde_json::to_value(self)?,
        ))
    }

    /// Decodes a command from a published outbox message.
    ///
    /// Returns `None` for messages that are not step commands.
    pub fn from_outbox(message: &OutboxMessage) -> Option<Result<Self, serde_json::Error>> {
        match message.event_type.as_str() {
            EXECUTE_EVENT_TYPE | COMPENSATE_EVENT_TYPE => {
                Some(serde_json::from_value(message.payload.clone()))
            }
            _ => None,
        }
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// A failure reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        };
        write!(f, "{kind} failure: {}", self.message)
    }
}

/// Outcome of a step or compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success {
        #[serde(default)]
        payload: Map<String, Value>,
    },
    Failure {
        error: StepFailure,
    },
}

/// A worker's reply to a [`StepCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub process_id: ProcessId,
    pub step_name: String,
    pub kind: CommandKind,
    pub attempt: u32,
    pub outcome: StepOutcome,
}

impl StepResult {
    /// Successful reply to `command` carrying `payload`.
    pub fn success(command: &StepCommand, payload: Map<String, Value>) -> Self {
        Self::reply(command, StepOutcome::Success { payload })
    }

    /// Failed reply to `command`.
    pub fn failure(command: &StepCommand, error: StepFailure) -> Self {
        Self::reply(command, StepOutcome::Failure { error })
    }

    fn reply(command: &StepCommand, outcome: StepOutcome) -> Self {
        Self {
            process_id: command.process_id.clone(),
            step_name: command.step_name.clone(),
            kind: command.kind,
            attempt: command.attempt,
            outcome,
        }
    }

    /// Deduplication key: `processId:stepName:kind:attempt`.
    ///
    /// Process IDs and step names never contain [`KEY_SEPARATOR`], so the
    /// key is unambiguous.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.process_id,
            self.step_name,
            self.kind.as_str(),
            self.attempt
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StepOutcome::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(kind: CommandKind) -> StepCommand {
        StepCommand {
            process_id: ProcessId::from("order-42"),
            process_type: "OrderFulfillment".to_string(),
            step_name: "ReserveInventory".to_string(),
            action: "ReserveInventory".to_string(),
            kind,
            attempt: 2,
            data: Map::new(),
            reply_to: RESULT_TOPIC.to_string(),
            deadline: None,
        }
    }

    #[test]
    fn idempotency_key_includes_kind_and_attempt() {
        let execute = StepResult::success(&command(CommandKind::Execute), Map::new());
        let compensate = StepResult::success(&command(CommandKind::Compensate), Map::new());
        assert_eq!(
            execute.idempotency_key(),
            "order-42:ReserveInventory:execute:2"
        );
        assert_eq!(
            compensate.idempotency_key(),
            "order-42:ReserveInventory:compensate:2"
        );
    }

    #[test]
    fn result_wire_format() {
        let result = StepResult::failure(
            &command(CommandKind::Execute),
            StepFailure::permanent("out of stock"),
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["process_id"], json!("order-42"));
        assert_eq!(value["kind"], json!("execute"));
        assert_eq!(value["outcome"]["status"], json!("failure"));
        assert_eq!(value["outcome"]["error"]["kind"], json!("permanent"));
    }

    #[test]
    fn success_payload_defaults_to_empty() {
        let result: StepResult = serde_json::from_value(json!({
            "process_id": "order-42",
            "step_name": "ReserveInventory",
            "kind": "compensate",
            "attempt": 1,
            "outcome": {"status": "success"}
        }))
        .unwrap();
        assert!(result.is_success());
    }

    #[test]
    fn command_travels_through_outbox() {
        let original = command(CommandKind::Compensate);
        let message = original.to_outbox().unwrap();
        assert_eq!(message.event_type, COMPENSATE_EVENT_TYPE);
        assert_eq!(message.aggregate_id, "order-42");

        let decoded = StepCommand::from_outbox(&message).unwrap().unwrap();
        assert_eq!(decoded, original);

        let other = OutboxMessage::new("Saga", "order-42", "SagaStarted", json!({}));
        assert!(StepCommand::from_outbox(&other).is_none());
    }
}
