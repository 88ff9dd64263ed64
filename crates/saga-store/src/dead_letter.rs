use chrono::{DateTime, Utc};
use common::{MessageId, ProcessId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::OutboxMessage;

/// What ran out of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// An outbox message the relay could not publish.
    OutboxPublish,
    /// A compensating action that kept failing.
    Compensation,
}

impl DeadLetterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterKind::OutboxPublish => "outbox_publish",
            DeadLetterKind::Compensation => "compensation",
        }
    }
}

impl std::str::FromStr for DeadLetterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outbox_publish" => Ok(DeadLetterKind::OutboxPublish),
            "compensation" => Ok(DeadLetterKind::Compensation),
            other => Err(format!("unknown dead-letter kind '{other}'")),
        }
    }
}

/// A record awaiting manual remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub kind: DeadLetterKind,
    /// Process ID for compensations, the message's aggregate for outbox entries.
    pub aggregate_id: String,
    pub step: Option<String>,
    pub message_id: Option<MessageId>,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Dead-letters an outbox message that exhausted its publish retries.
    pub fn outbox(message: &OutboxMessage, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: DeadLetterKind::OutboxPublish,
            aggregate_id: message.aggregate_id.clone(),
            step: None,
            message_id: Some(message.id),
            payload: message.payload.clone(),
            error: error.into(),
            attempts,
            created_at: Utc::now(),
        }
    }

    /// Dead-letters a compensation that exhausted its retries.
    pub fn compensation(
        process_id: &ProcessId,
        step: impl Into<String>,
        payload: serde_json::Value,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: DeadLetterKind::Compensation,
            aggregate_id: process_id.to_string(),
            step: Some(step.into()),
            message_id: None,
            payload,
            error: error.into(),
            attempts,
            created_at: Utc::now(),
        }
    }
}
