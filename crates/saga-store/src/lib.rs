pub mod dead_letter;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod process;
pub mod store;

pub use common::{MessageId, ProcessId};
pub use dead_letter::{DeadLetterKind, DeadLetterRecord};
pub use error::{Result, StoreError};
pub use idempotency::{IdempotencyRecord, IdempotencyStatus};
pub use memory::InMemorySagaStore;
pub use outbox::OutboxMessage;
pub use postgres::PostgresSagaStore;
pub use process::{
    CompensationRecord, CompensationStatus, ProcessState, ProcessStatus, StepExecution,
    StepStatus, TransitionError,
};
pub use store::{
    DeadLetterSink, IdempotencyStore, OutboxClaim, OutboxStore, ProcessStateStore, ProcessUnit,
    SagaStore,
};
