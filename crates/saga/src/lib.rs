//! Saga orchestration engine.
//!
//! A saga is a registered sequence of steps executed by external workers.
//! The [`Orchestrator`] dispatches one step at a time through the outbox,
//! applies each worker reply at most once, and on failure runs the
//! compensating actions of completed steps in reverse order.
//!
//! Around it:
//! - [`OutboxRelay`] publishes staged messages at least once.
//! - [`IdempotentReceiver`] deduplicates redelivered replies.
//! - [`Orchestrator::recover_stalled`] expires work whose reply never came.
//! - [`engine::spawn`] runs all of it on a bounded worker pool.

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod messages;
pub mod orchestrator;
pub mod receiver;
pub mod recovery;
pub mod registry;
pub mod relay;
pub mod retry;

pub use broker::{InMemoryBroker, TracingPublisher};
pub use config::{ConfigError, EngineConfig, FailurePolicy, RecoveryConfig, RelayConfig};
pub use engine::{EngineHandle, EngineTasks};
pub use error::{Result, SagaError};
pub use events::SagaEvent;
pub use executor::{ExecutorHost, Invocation, ScriptedExecutor, StepExecutor};
pub use messages::{
    COMPENSATE_EVENT_TYPE, CommandKind, EXECUTE_EVENT_TYPE, FailureKind, KEY_SEPARATOR,
    RESULT_TOPIC, StepCommand, StepFailure, StepOutcome, StepResult,
};
pub use orchestrator::{Orchestrator, StartRequest, Transition};
pub use receiver::{Delivery, IdempotentReceiver};
pub use recovery::RecoveryReport;
pub use registry::{RegistryManifest, SagaDefinition, StepDescriptor, StepRegistry};
pub use relay::{MessagePublisher, OutboxRelay, PublishError, RelayReport};
pub use retry::{Backoff, RetryPolicy};
