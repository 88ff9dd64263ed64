use common::ProcessId;
use thiserror::Error;

use crate::process::TransitionError;

/// Errors that can occur when interacting with the saga stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No process state exists for the given ID.
    #[error("Process not found: {0}")]
    NotFound(ProcessId),

    /// The per-process lock could not be acquired in time.
    #[error("Timed out waiting for the lock on process {0}")]
    LockTimeout(ProcessId),

    /// The backing store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A persisted row could not be mapped back into a domain value.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// A state transition rejected by the process state machine.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true when the error means the store itself could not be
    /// reached, as opposed to a logical failure of the request.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
