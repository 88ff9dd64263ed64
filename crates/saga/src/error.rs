//! Saga error types.

use common::ProcessId;
use saga_store::{ProcessStatus, StoreError, TransitionError};
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A process with this ID has already been started.
    #[error("Process already exists: {0}")]
    AlreadyExists(ProcessId),

    /// No process exists with this ID.
    #[error("Process not found: {0}")]
    NotFound(ProcessId),

    /// No saga definition is registered for the process type.
    #[error("Unknown process type: {0}")]
    UnknownProcessType(String),

    /// A saga definition names a step that was never registered.
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// A saga definition was rejected at registration time.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// A caller-supplied process ID was rejected.
    #[error("Invalid process id '{0}': {1}")]
    InvalidProcessId(ProcessId, String),

    /// The process is not in a status that allows the operation.
    #[error("Process {process_id} is {status}")]
    InvalidState {
        process_id: ProcessId,
        status: ProcessStatus,
    },

    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Another delivery of the same message holds the idempotency key.
    #[error("Message {0} is already being processed")]
    InProgress(String),

    /// The process state machine rejected a mutation.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Any other store failure.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine stopped before the request was handled.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(process_id) => SagaError::NotFound(process_id),
            err if err.is_unavailable() => SagaError::StoreUnavailable(err.to_string()),
            err => SagaError::Store(err),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_saga_errors() {
        let id = ProcessId::from("p-1");
        assert!(matches!(
            SagaError::from(StoreError::NotFound(id.clone())),
            SagaError::NotFound(_)
        ));
        assert!(matches!(
            SagaError::from(StoreError::Unavailable("down".into())),
            SagaError::StoreUnavailable(_)
        ));
        assert!(matches!(
            SagaError::from(StoreError::LockTimeout(id)),
            SagaError::Store(StoreError::LockTimeout(_))
        ));
    }
}
