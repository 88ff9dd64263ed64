use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, ProcessId};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::idempotency::expires_at;
use crate::store::ClaimUpdate;
use crate::{
    DeadLetterRecord, DeadLetterSink, IdempotencyRecord, IdempotencyStatus, IdempotencyStore,
    OutboxClaim, OutboxMessage, OutboxStore, ProcessState, ProcessStateStore, ProcessStatus,
    ProcessUnit, Result, StoreError,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Tables {
    processes: HashMap<ProcessId, ProcessState>,
    outbox: Vec<OutboxMessage>,
    idempotency: HashMap<String, IdempotencyRecord>,
    dead_letters: Vec<DeadLetterRecord>,
}

type LockMap = Arc<StdMutex<HashMap<ProcessId, Arc<Mutex<()>>>>>;

fn lock_sync<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory saga store for testing and single-node development.
///
/// Implements the same contracts as the PostgreSQL store: per-process
/// locks, atomic units of work, skip-locked outbox claims and
/// compare-and-set idempotency keys.
#[derive(Clone)]
pub struct InMemorySagaStore {
    tables: Arc<RwLock<Tables>>,
    process_locks: LockMap,
    claimed: Arc<StdMutex<HashSet<MessageId>>>,
    unavailable: Arc<AtomicBool>,
    lock_timeout: Duration,
}

impl Default for InMemorySagaStore {
    fn default() -> Self {
        Self {
            tables: Arc::default(),
            process_locks: Arc::default(),
            claimed: Arc::default(),
            unavailable: Arc::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl InMemorySagaStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that gives up waiting for a process lock after `timeout`.
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            lock_timeout: timeout,
            ..Self::default()
        }
    }

    /// Simulates an outage: every operation fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns every outbox message, published or not, in insertion order.
    pub async fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.tables.read().await.outbox.clone()
    }

    /// Returns the number of stored processes.
    pub async fn process_count(&self) -> usize {
        self.tables.read().await.processes.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

/// Holds (or waits for) one process lock and prunes the lock map on drop.
struct ProcessLockHandle {
    process_id: ProcessId,
    lock: Arc<Mutex<()>>,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ProcessLockHandle {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock_sync(&self.locks);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.process_id);
        }
    }
}

struct InMemoryProcessUnit {
    store: InMemorySagaStore,
    _lock: ProcessLockHandle,
    loaded: Option<ProcessState>,
    staged: Option<ProcessState>,
    outbox: Vec<OutboxMessage>,
    dead_letters: Vec<DeadLetterRecord>,
}

#[async_trait]
impl ProcessUnit for InMemoryProcessUnit {
    fn state(&self) -> Option<&ProcessState> {
        self.staged.as_ref().or(self.loaded.as_ref())
    }

    fn save(&mut self, state: ProcessState) {
        self.staged = Some(state);
    }

    fn append_outbox(&mut self, message: OutboxMessage) {
        self.outbox.push(message);
    }

    fn dead_letter(&mut self, record: DeadLetterRecord) {
        self.dead_letters.push(record);
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let unit = *self;
        unit.store.check_available()?;

        let mut tables = unit.store.tables.write().await;
        if let Some(state) = unit.staged {
            tables.processes.insert(state.process_id.clone(), state);
        }
        tables.outbox.extend(unit.outbox);
        tables.dead_letters.extend(unit.dead_letters);
        Ok(())
    }
}

#[async_trait]
impl ProcessStateStore for InMemorySagaStore {
    async fn begin(&self, process_id: &ProcessId) -> Result<Box<dyn ProcessUnit>> {
        self.check_available()?;

        let lock = lock_sync(&self.process_locks)
            .entry(process_id.clone())
            .or_default()
            .clone();
        let mut handle = ProcessLockHandle {
            process_id: process_id.clone(),
            lock: lock.clone(),
            locks: self.process_locks.clone(),
            guard: None,
        };

        let guard = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                metrics::counter!("process_lock_timeouts_total").increment(1);
                StoreError::LockTimeout(process_id.clone())
            })?;
        handle.guard = Some(guard);

        let loaded = self.tables.read().await.processes.get(process_id).cloned();
        Ok(Box::new(InMemoryProcessUnit {
            store: self.clone(),
            _lock: handle,
            loaded,
            staged: None,
            outbox: Vec::new(),
            dead_letters: Vec::new(),
        }))
    }

    async fn save(&self, state: &ProcessState) -> Result<()> {
        self.check_available()?;
        self.tables
            .write()
            .await
            .processes
            .insert(state.process_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, process_id: &ProcessId) -> Result<ProcessState> {
        self.check_available()?;
        self.tables
            .read()
            .await
            .processes
            .get(process_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(process_id.clone()))
    }

    async fn find_by_status(
        &self,
        status: ProcessStatus,
        updated_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ProcessState>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        let mut found: Vec<_> = tables
            .processes
            .values()
            .filter(|state| state.status == status)
            .filter(|state| updated_before.is_none_or(|cutoff| state.updated_at < cutoff))
            .cloned()
            .collect();
        found.sort_by_key(|state| state.updated_at);
        Ok(found)
    }
}

struct InMemoryOutboxClaim {
    store: InMemorySagaStore,
    messages: Vec<OutboxMessage>,
    updates: Vec<(MessageId, ClaimUpdate)>,
}

impl Drop for InMemoryOutboxClaim {
    fn drop(&mut self) {
        let mut claimed = lock_sync(&self.store.claimed);
        for message in &self.messages {
            claimed.remove(&message.id);
        }
    }
}

#[async_trait]
impl OutboxClaim for InMemoryOutboxClaim {
    fn messages(&self) -> &[OutboxMessage] {
        &self.messages
    }

    fn mark_published(&mut self, id: MessageId, at: DateTime<Utc>) {
        self.updates.push((id, ClaimUpdate::Published(at)));
    }

    fn mark_failed(&mut self, id: MessageId, error: &str, retry_at: DateTime<Utc>) {
        self.updates.push((
            id,
            ClaimUpdate::Failed {
                error: error.to_string(),
                retry_at,
            },
        ));
    }

    fn dead_letter(&mut self, id: MessageId, record: DeadLetterRecord) {
        self.updates.push((id, ClaimUpdate::DeadLettered(record)));
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.store.check_available()?;
        let updates = std::mem::take(&mut self.updates);

        let mut tables = self.store.tables.write().await;
        for (id, update) in updates {
            let Some(index) = tables.outbox.iter().position(|m| m.id == id) else {
                continue;
            };
            match update {
                ClaimUpdate::Published(at) => {
                    let message = &mut tables.outbox[index];
                    if message.published_at.is_none() {
                        message.published_at = Some(at);
                    }
                }
                ClaimUpdate::Failed { error, retry_at } => {
                    let message = &mut tables.outbox[index];
                    message.retry_count += 1;
                    message.last_error = Some(error);
                    message.available_at = retry_at;
                }
                ClaimUpdate::DeadLettered(record) => {
                    let message = &mut tables.outbox[index];
                    message.retry_count += 1;
                    message.last_error = Some(record.error.clone());
                    message.dead_lettered_at = Some(record.created_at);
                    tables.dead_letters.push(record);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemorySagaStore {
    async fn append(&self, message: OutboxMessage) -> Result<()> {
        self.check_available()?;
        self.tables.write().await.outbox.push(message);
        Ok(())
    }

    async fn claim_unpublished(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn OutboxClaim>> {
        self.check_available()?;

        let tables = self.tables.read().await;
        let mut pending: Vec<&OutboxMessage> =
            tables.outbox.iter().filter(|m| m.is_pending()).collect();
        pending.sort_by_key(|m| m.created_at);

        let mut claimed = lock_sync(&self.claimed);
        let mut blocked = HashSet::new();
        let mut batch = Vec::new();
        for message in pending {
            if batch.len() >= batch_size {
                break;
            }
            if blocked.contains(message.aggregate_id.as_str()) {
                continue;
            }
            // An aggregate is claimed in order up to its first held or
            // not yet due message.
            if claimed.contains(&message.id) || message.available_at > now {
                blocked.insert(message.aggregate_id.as_str());
                continue;
            }
            claimed.insert(message.id);
            batch.push(message.clone());
        }
        drop(claimed);
        metrics::counter!("outbox_claimed_total").increment(batch.len() as u64);

        Ok(Box::new(InMemoryOutboxClaim {
            store: self.clone(),
            messages: batch,
            updates: Vec::new(),
        }))
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables.outbox.iter().find(|m| m.id == id).cloned())
    }

    async fn pending_count(&self) -> Result<u64> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables.outbox.iter().filter(|m| m.is_pending()).count() as u64)
    }

    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let before = tables.outbox.len();
        tables
            .outbox
            .retain(|m| m.published_at.is_none_or(|at| at >= older_than));
        Ok((before - tables.outbox.len()) as u64)
    }
}

#[async_trait]
impl IdempotencyStore for InMemorySagaStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let now = Utc::now();
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables.idempotency.get(key)
            && !existing.is_expired(now)
        {
            return Ok(false);
        }

        tables.idempotency.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                status: IdempotencyStatus::Processing,
                result: None,
                expires_at: expires_at(now, ttl),
            },
        );
        Ok(true)
    }

    async fn store_result(
        &self,
        key: &str,
        result: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        self.check_available()?;
        let now = Utc::now();
        self.tables.write().await.idempotency.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                status: IdempotencyStatus::Completed,
                result: Some(result.clone()),
                expires_at: expires_at(now, ttl),
            },
        );
        Ok(())
    }

    async fn get_result(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.check_available()?;
        let now = Utc::now();
        let tables = self.tables.read().await;
        Ok(tables
            .idempotency
            .get(key)
            .filter(|r| r.status == IdempotencyStatus::Completed && !r.is_expired(now))
            .and_then(|r| r.result.clone()))
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        if tables
            .idempotency
            .get(key)
            .is_some_and(|r| r.status == IdempotencyStatus::Processing)
        {
            tables.idempotency.remove(key);
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.check_available()?;
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        let before = tables.idempotency.len();
        tables.idempotency.retain(|_, r| !r.is_expired(now));
        Ok((before - tables.idempotency.len()) as u64)
    }
}

#[async_trait]
impl DeadLetterSink for InMemorySagaStore {
    async fn send(&self, record: DeadLetterRecord) -> Result<()> {
        self.check_available()?;
        self.tables.write().await.dead_letters.push(record);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables.dead_letters.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    fn create_process(id: &str) -> ProcessState {
        ProcessState::new(ProcessId::from(id), "TestSaga", Map::new(), Utc::now())
    }

    fn create_message(aggregate_id: &str, event_type: &str) -> OutboxMessage {
        OutboxMessage::new("Saga", aggregate_id, event_type, json!({"test": true}))
    }

    #[tokio::test]
    async fn commit_writes_state_and_outbox_together() {
        let store = InMemorySagaStore::new();
        let id = ProcessId::from("p-1");

        let mut unit = store.begin(&id).await.unwrap();
        assert!(unit.state().is_none());
        unit.save(create_process("p-1"));
        unit.append_outbox(create_message("p-1", "SagaStarted"));
        unit.commit().await.unwrap();

        assert_eq!(store.load(&id).await.unwrap().process_id(), &id);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropped_unit_rolls_back() {
        let store = InMemorySagaStore::new();
        let id = ProcessId::from("p-1");

        let mut unit = store.begin(&id).await.unwrap();
        unit.save(create_process("p-1"));
        unit.append_outbox(create_message("p-1", "SagaStarted"));
        drop(unit);

        assert!(matches!(
            store.load(&id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.outbox_messages().await.is_empty());
    }

    #[tokio::test]
    async fn lock_is_exclusive_per_process() {
        let store = InMemorySagaStore::with_lock_timeout(Duration::from_millis(50));
        let id = ProcessId::from("p-1");

        let held = store.begin(&id).await.unwrap();
        let blocked = store.begin(&id).await;
        assert!(matches!(blocked, Err(StoreError::LockTimeout(_))));

        // Unrelated processes are not blocked.
        assert!(store.begin(&ProcessId::from("p-2")).await.is_ok());

        drop(held);
        assert!(store.begin(&id).await.is_ok());
    }

    #[tokio::test]
    async fn lock_map_is_pruned_after_release() {
        let store = InMemorySagaStore::new();
        let unit = store.begin(&ProcessId::from("p-1")).await.unwrap();
        assert_eq!(lock_sync(&store.process_locks).len(), 1);
        drop(unit);
        assert!(lock_sync(&store.process_locks).is_empty());
    }

    #[tokio::test]
    async fn find_by_status_respects_cutoff() {
        let store = InMemorySagaStore::new();
        store.save(&create_process("p-1")).await.unwrap();
        store.save(&create_process("p-2")).await.unwrap();

        let running = store
            .find_by_status(ProcessStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(running.len(), 2);

        let stale = store
            .find_by_status(
                ProcessStatus::Running,
                Some(Utc::now() - chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        assert!(stale.is_empty());

        let compensating = store
            .find_by_status(ProcessStatus::Compensating, None)
            .await
            .unwrap();
        assert!(compensating.is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_do_not_overlap() {
        let store = InMemorySagaStore::new();
        store.append(create_message("a", "E1")).await.unwrap();
        store.append(create_message("b", "E2")).await.unwrap();

        let first = store.claim_unpublished(1, Utc::now()).await.unwrap();
        let second = store.claim_unpublished(10, Utc::now()).await.unwrap();

        assert_eq!(first.messages().len(), 1);
        assert_eq!(second.messages().len(), 1);
        assert_ne!(first.messages()[0].id, second.messages()[0].id);
    }

    #[tokio::test]
    async fn aggregate_backlog_is_claimed_in_order() {
        let store = InMemorySagaStore::new();
        let first = create_message("a", "E1");
        let mut second = create_message("a", "E2");
        second.created_at = first.created_at + chrono::Duration::milliseconds(1);
        second.available_at = second.created_at;
        let mut third = create_message("a", "E3");
        third.created_at = second.created_at + chrono::Duration::milliseconds(1);
        third.available_at = third.created_at;
        store.append(third.clone()).await.unwrap();
        store.append(second.clone()).await.unwrap();
        store.append(first.clone()).await.unwrap();

        let now = Utc::now() + chrono::Duration::seconds(1);
        let claim = store.claim_unpublished(10, now).await.unwrap();
        let ids: Vec<_> = claim.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
    }

    #[tokio::test]
    async fn aggregate_claim_stops_at_first_unavailable_message() {
        let store = InMemorySagaStore::new();
        let now = Utc::now();
        let first = create_message("a", "E1");
        let mut second = create_message("a", "E2");
        second.created_at = first.created_at + chrono::Duration::milliseconds(1);
        second.available_at = now + chrono::Duration::seconds(30);
        let mut third = create_message("a", "E3");
        third.created_at = second.created_at + chrono::Duration::milliseconds(1);
        third.available_at = third.created_at;
        store.append(first.clone()).await.unwrap();
        store.append(second.clone()).await.unwrap();
        store.append(third.clone()).await.unwrap();

        let now = now + chrono::Duration::seconds(1);
        let held = store.claim_unpublished(1, now).await.unwrap();
        assert_eq!(held.messages()[0].id, first.id);

        // The head is held by another claim, so nothing behind it is eligible.
        let claim = store.claim_unpublished(10, now).await.unwrap();
        assert!(claim.messages().is_empty());
        drop(claim);
        drop(held);

        // The second message is not due yet, so the third waits behind it.
        let claim = store.claim_unpublished(10, now).await.unwrap();
        let ids: Vec<_> = claim.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id]);
    }

    #[tokio::test]
    async fn dropped_claim_leaves_messages_unpublished() {
        let store = InMemorySagaStore::new();
        let message = create_message("a", "E1");
        store.append(message.clone()).await.unwrap();

        let mut claim = store.claim_unpublished(10, Utc::now()).await.unwrap();
        claim.mark_published(message.id, Utc::now());
        drop(claim);

        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert!(stored.published_at.is_none());

        let claim = store.claim_unpublished(10, Utc::now()).await.unwrap();
        assert_eq!(claim.messages().len(), 1);
    }

    #[tokio::test]
    async fn published_at_is_set_once() {
        let store = InMemorySagaStore::new();
        let message = create_message("a", "E1");
        store.append(message.clone()).await.unwrap();

        let first_at = Utc::now();
        let mut claim = store.claim_unpublished(10, first_at).await.unwrap();
        claim.mark_published(message.id, first_at);
        claim.mark_published(message.id, first_at + chrono::Duration::seconds(5));
        claim.commit().await.unwrap();

        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.published_at, Some(first_at));
    }

    #[tokio::test]
    async fn failed_attempt_reschedules_message() {
        let store = InMemorySagaStore::new();
        let message = create_message("a", "E1");
        store.append(message.clone()).await.unwrap();

        let now = Utc::now();
        let retry_at = now + chrono::Duration::seconds(30);
        let mut claim = store.claim_unpublished(10, now).await.unwrap();
        claim.mark_failed(message.id, "broker down", retry_at);
        claim.commit().await.unwrap();

        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("broker down"));
        assert!(
            store
                .claim_unpublished(10, now)
                .await
                .unwrap()
                .messages()
                .is_empty()
        );
        assert_eq!(
            store
                .claim_unpublished(10, retry_at)
                .await
                .unwrap()
                .messages()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn dead_lettered_message_is_kept() {
        let store = InMemorySagaStore::new();
        let message = create_message("a", "E1");
        store.append(message.clone()).await.unwrap();

        let mut claim = store.claim_unpublished(10, Utc::now()).await.unwrap();
        claim.dead_letter(message.id, DeadLetterRecord::outbox(&message, "rejected", 1));
        claim.commit().await.unwrap();

        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert!(stored.dead_lettered_at.is_some());
        assert!(stored.published_at.is_none());
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(store.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purge_only_removes_old_published_messages() {
        let store = InMemorySagaStore::new();
        let published = create_message("a", "E1");
        let pending = create_message("b", "E2");
        store.append(published.clone()).await.unwrap();
        store.append(pending.clone()).await.unwrap();

        let now = Utc::now();
        let mut claim = store.claim_unpublished(1, now).await.unwrap();
        claim.mark_published(published.id, now);
        claim.commit().await.unwrap();

        let purged = store
            .purge_published(now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_message(pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn idempotency_key_is_compare_and_set() {
        let store = InMemorySagaStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire("k1", ttl).await.unwrap());
        assert!(!store.try_acquire("k1", ttl).await.unwrap());
        assert!(store.get_result("k1").await.unwrap().is_none());

        store
            .store_result("k1", &json!({"ok": true}), ttl)
            .await
            .unwrap();
        assert!(!store.try_acquire("k1", ttl).await.unwrap());
        assert_eq!(
            store.get_result("k1").await.unwrap(),
            Some(json!({"ok": true}))
        );
    }

    #[tokio::test]
    async fn expired_key_can_be_reacquired() {
        let store = InMemorySagaStore::new();
        assert!(store.try_acquire("k1", Duration::ZERO).await.unwrap());
        assert!(store.try_acquire("k1", Duration::from_secs(60)).await.unwrap());

        store
            .store_result("k2", &json!(1), Duration::ZERO)
            .await
            .unwrap();
        assert!(store.get_result("k2").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn release_only_drops_processing_keys() {
        let store = InMemorySagaStore::new();
        let ttl = Duration::from_secs(60);

        store.try_acquire("k1", ttl).await.unwrap();
        store.release("k1").await.unwrap();
        assert!(store.try_acquire("k1", ttl).await.unwrap());

        store.store_result("k2", &json!(1), ttl).await.unwrap();
        store.release("k2").await.unwrap();
        assert!(!store.try_acquire("k2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_operation() {
        let store = InMemorySagaStore::new();
        store.set_unavailable(true);

        let err = store
            .try_acquire("k1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.begin(&ProcessId::from("p-1")).await.is_err());
        assert!(store.pending_count().await.is_err());

        store.set_unavailable(false);
        assert!(store.try_acquire("k1", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn dead_letters_are_listed_newest_first() {
        let store = InMemorySagaStore::new();
        let id = ProcessId::from("p-1");
        for step in ["A", "B", "C"] {
            store
                .send(DeadLetterRecord::compensation(&id, step, json!({}), "boom", 5))
                .await
                .unwrap();
        }

        let listed = store.list(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].step.as_deref(), Some("C"));
        assert_eq!(listed[1].step.as_deref(), Some("B"));
    }
}
