//! Saga lifecycle events.
//!
//! Published through the outbox alongside step commands so downstream
//! consumers can follow a saga without reading its state.

use chrono::{DateTime, Utc};
use common::ProcessId;
use saga_store::OutboxMessage;
use serde::{Deserialize, Serialize};

use crate::messages::SAGA_AGGREGATE_TYPE;

/// Events that can occur during saga execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// Saga execution started.
    SagaStarted(SagaStartedData),

    /// A step completed successfully.
    StepCompleted(StepData),

    /// A step attempt failed.
    StepFailed(StepFailedData),

    /// A failed step attempt will be dispatched again.
    StepRetryScheduled(RetryData),

    /// Compensation started after a step failure or an abort.
    CompensationStarted(CompensationData),

    /// A compensating action was applied (or the step had none).
    CompensationStepCompleted(StepData),

    /// A compensation attempt failed.
    CompensationStepFailed(StepFailedData),

    /// Saga completed successfully.
    SagaCompleted(SagaFinishedData),

    /// Every completed step was compensated.
    SagaCompensated(SagaFinishedData),

    /// At least one compensation was abandoned.
    SagaFailed(SagaFailedData),
}

impl SagaEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::StepRetryScheduled(_) => "StepRetryScheduled",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaCompensated(_) => "SagaCompensated",
            SagaEvent::SagaFailed(_) => "SagaFailed",
        }
    }

    /// Wraps the event in an outbox message for `process_id`.
    pub fn to_outbox(&self, process_id: &ProcessId) -> Result<OutboxMessage, serde_json::Error> {
        Ok(OutboxMessage::new(
            SAGA_AGGREGATE_TYPE,
            process_id.as_str(),
            self.event_type(),
            serde_json::to_value(self)?,
        ))
    }
}

/// Data for SagaStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub process_type: String,
    pub first_step: String,
    pub started_at: DateTime<Utc>,
}

/// Data for step completion events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub step_name: String,
    pub attempt: u32,
}

/// Data for failure events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_name: String,
    pub attempt: u32,
    pub error: String,
}

/// Data for StepRetryScheduled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryData {
    pub step_name: String,
    pub next_attempt: u32,
    pub retry_at: DateTime<Utc>,
}

/// Data for CompensationStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationData {
    /// The step that triggered compensation.
    pub from_step: String,
    pub reason: String,
}

/// Data for SagaCompleted and SagaCompensated events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFinishedData {
    pub finished_at: DateTime<Utc>,
}

/// Data for SagaFailed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_started(
        process_type: impl Into<String>,
        first_step: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            process_type: process_type.into(),
            first_step: first_step.into(),
            started_at: at,
        })
    }

    pub fn step_completed(step_name: impl Into<String>, attempt: u32) -> Self {
        SagaEvent::StepCompleted(StepData {
            step_name: step_name.into(),
            attempt,
        })
    }

    pub fn step_failed(step_name: impl Into<String>, attempt: u32, error: impl Into<String>) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step_name: step_name.into(),
            attempt,
            error: error.into(),
        })
    }

    pub fn step_retry_scheduled(
        step_name: impl Into<String>,
        next_attempt: u32,
        retry_at: DateTime<Utc>,
    ) -> Self {
        SagaEvent::StepRetryScheduled(RetryData {
            step_name: step_name.into(),
            next_attempt,
            retry_at,
        })
    }

    pub fn compensation_started(from_step: impl Into<String>, reason: impl Into<String>) -> Self {
        SagaEvent::CompensationStarted(CompensationData {
            from_step: from_step.into(),
            reason: reason.into(),
        })
    }

    pub fn compensation_step_completed(step_name: impl Into<String>, attempt: u32) -> Self {
        SagaEvent::CompensationStepCompleted(StepData {
            step_name: step_name.into(),
            attempt,
        })
    }

    pub fn compensation_step_failed(
        step_name: impl Into<String>,
        attempt: u32,
        error: impl Into<String>,
    ) -> Self {
        SagaEvent::CompensationStepFailed(StepFailedData {
            step_name: step_name.into(),
            attempt,
            error: error.into(),
        })
    }

    pub fn saga_completed(at: DateTime<Utc>) -> Self {
        SagaEvent::SagaCompleted(SagaFinishedData { finished_at: at })
    }

    pub fn saga_compensated(at: DateTime<Utc>) -> Self {
        SagaEvent::SagaCompensated(SagaFinishedData { finished_at: at })
    }

    pub fn saga_failed(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        SagaEvent::SagaFailed(SagaFailedData {
            reason: reason.into(),
            failed_at: at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type() {
        let now = Utc::now();
        assert_eq!(
            SagaEvent::saga_started("OrderFulfillment", "ReserveInventory", now).event_type(),
            "SagaStarted"
        );
        assert_eq!(
            SagaEvent::step_failed("ChargePayment", 1, "card declined").event_type(),
            "StepFailed"
        );
        assert_eq!(
            SagaEvent::compensation_step_failed("ReserveInventory", 3, "timeout").event_type(),
            "CompensationStepFailed"
        );
        assert_eq!(SagaEvent::saga_compensated(now).event_type(), "SagaCompensated");
    }

    #[test]
    fn test_wire_format() {
        let event = SagaEvent::step_completed("ReserveInventory", 2);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "StepCompleted");
        assert_eq!(value["data"]["step_name"], "ReserveInventory");
        assert_eq!(value["data"]["attempt"], 2);

        let decoded: SagaEvent = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_to_outbox() {
        let process_id = ProcessId::from("order-7");
        let message = SagaEvent::saga_failed("compensation abandoned", Utc::now())
            .to_outbox(&process_id)
            .unwrap();
        assert_eq!(message.aggregate_type, "Saga");
        assert_eq!(message.aggregate_id, "order-7");
        assert_eq!(message.event_type, "SagaFailed");
        assert_eq!(message.payload["data"]["reason"], "compensation abandoned");
    }
}
