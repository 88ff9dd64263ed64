use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, ProcessId};

use crate::{DeadLetterRecord, OutboxMessage, ProcessState, ProcessStatus, Result};

/// A unit of work on one process, holding that process's exclusive lock.
///
/// Writes are buffered and applied atomically by [`ProcessUnit::commit`].
/// Dropping a unit without committing discards every buffered write and
/// releases the lock, which is how a rolled-back transaction looks to the
/// caller.
#[async_trait]
pub trait ProcessUnit: Send {
    /// The process state as loaded under the lock, `None` if it does not exist yet.
    fn state(&self) -> Option<&ProcessState>;

    /// Buffers an upsert of the process state.
    fn save(&mut self, state: ProcessState);

    /// Buffers an outbox message to be inserted with the state write.
    fn append_outbox(&mut self, message: OutboxMessage);

    /// Buffers a dead-letter record to be inserted with the state write.
    fn dead_letter(&mut self, record: DeadLetterRecord);

    /// Applies all buffered writes atomically and releases the lock.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// A buffered change to one claimed outbox message.
pub(crate) enum ClaimUpdate {
    Published(DateTime<Utc>),
    Failed {
        error: String,
        retry_at: DateTime<Utc>,
    },
    DeadLettered(DeadLetterRecord),
}

/// Durable storage for saga process state.
#[async_trait]
pub trait ProcessStateStore: Send + Sync {
    /// Opens a unit of work holding the exclusive lock on `process_id`.
    ///
    /// Locks are scoped per process; units for different processes never
    /// wait on each other. Waiting is bounded and fails with
    /// `StoreError::LockTimeout`.
    async fn begin(&self, process_id: &ProcessId) -> Result<Box<dyn ProcessUnit>>;

    /// Upserts a process state outside of a unit of work.
    async fn save(&self, state: &ProcessState) -> Result<()>;

    /// Loads a process state, failing with `StoreError::NotFound` if absent.
    async fn load(&self, process_id: &ProcessId) -> Result<ProcessState>;

    /// Finds processes in `status`, optionally only those not updated since `updated_before`.
    async fn find_by_status(
        &self,
        status: ProcessStatus,
        updated_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ProcessState>>;
}

/// A batch of outbox messages claimed by one relay worker.
///
/// Claimed rows are invisible to other relay workers until the claim is
/// committed or dropped. Updates are buffered; dropping the claim without
/// committing leaves every message unpublished.
#[async_trait]
pub trait OutboxClaim: Send {
    /// The claimed messages. Messages of one aggregate appear in creation
    /// order.
    fn messages(&self) -> &[OutboxMessage];

    /// Buffers marking `id` as published.
    fn mark_published(&mut self, id: MessageId, at: DateTime<Utc>);

    /// Buffers a failed attempt for `id`, rescheduling it for `retry_at`.
    fn mark_failed(&mut self, id: MessageId, error: &str, retry_at: DateTime<Utc>);

    /// Buffers moving `id` to the dead-letter sink.
    fn dead_letter(&mut self, id: MessageId, record: DeadLetterRecord);

    /// Applies all buffered updates atomically and releases the claim.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Durable staging area for outbound messages.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Appends a message outside of a process unit of work.
    async fn append(&self, message: OutboxMessage) -> Result<()>;

    /// Claims up to `batch_size` due messages with skip-locked semantics.
    ///
    /// An aggregate's pending messages are claimed in creation order, from
    /// its oldest one up to the first that is not due, and only when no other
    /// claim holds that oldest one. Messages for one aggregate are therefore
    /// relayed in creation order.
    async fn claim_unpublished(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn OutboxClaim>>;

    /// Fetches a message by ID.
    async fn get_message(&self, id: MessageId) -> Result<Option<OutboxMessage>>;

    /// Counts messages still awaiting publication.
    async fn pending_count(&self) -> Result<u64>;

    /// Retention job: deletes messages published before `older_than`.
    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Durable key→result cache guarding against duplicate processing.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claims `key` if it is absent or expired.
    ///
    /// Returns false if another execution holds or has completed the key.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Marks `key` completed with `result`.
    async fn store_result(&self, key: &str, result: &serde_json::Value, ttl: Duration)
    -> Result<()>;

    /// Returns the cached result of a completed, unexpired key.
    async fn get_result(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Drops a `processing` claim so a redelivery can run the handler again.
    async fn release(&self, key: &str) -> Result<()>;

    /// Deletes expired keys.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Durable sink for work that exhausted its retries.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Persists a record; returns only once it is durable.
    async fn send(&self, record: DeadLetterRecord) -> Result<()>;

    /// Lists the most recent records, newest first.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>>;
}

/// Everything the saga engine needs from a storage backend.
pub trait SagaStore:
    ProcessStateStore + OutboxStore + IdempotencyStore + DeadLetterSink + Clone + 'static
{
}

impl<T> SagaStore for T where
    T: ProcessStateStore + OutboxStore + IdempotencyStore + DeadLetterSink + Clone + 'static
{
}
