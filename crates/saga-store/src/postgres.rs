use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, ProcessId};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::idempotency::expires_at;
use crate::store::ClaimUpdate;
use crate::{
    DeadLetterKind, DeadLetterRecord, DeadLetterSink, IdempotencyStore, OutboxClaim,
    OutboxMessage, OutboxStore, ProcessState, ProcessStateStore, ProcessStatus, ProcessUnit,
    Result, StoreError,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

const OUTBOX_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, created_at, \
     available_at, published_at, retry_count, last_error, dead_lettered_at";

/// PostgreSQL-backed saga store.
///
/// Process locks are transaction-scoped advisory locks keyed by a hash of
/// the process ID, so they are released on commit, rollback or a dropped
/// connection. Outbox claims use `FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets how long `begin` waits for a process lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_state(row: PgRow) -> Result<ProcessState> {
        let status: String = row.try_get("status")?;
        let data: serde_json::Value = row.try_get("data")?;
        let history: serde_json::Value = row.try_get("history")?;

        Ok(ProcessState {
            process_id: ProcessId::from(row.try_get::<String, _>("process_id")?),
            process_type: row.try_get("process_type")?,
            current_step: row.try_get("current_step")?,
            status: status.parse().map_err(StoreError::InvalidData)?,
            data: serde_json::from_value(data)?,
            history: serde_json::from_value(history)?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_message(row: PgRow) -> Result<OutboxMessage> {
        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            available_at: row.try_get("available_at")?,
            published_at: row.try_get("published_at")?,
            retry_count: to_u32(row.try_get("retry_count")?)?,
            last_error: row.try_get("last_error")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
        })
    }

    fn row_to_dead_letter(row: PgRow) -> Result<DeadLetterRecord> {
        let kind: String = row.try_get("kind")?;
        Ok(DeadLetterRecord {
            id: row.try_get("id")?,
            kind: kind
                .parse::<DeadLetterKind>()
                .map_err(StoreError::InvalidData)?,
            aggregate_id: row.try_get("aggregate_id")?,
            step: row.try_get("step")?,
            message_id: row
                .try_get::<Option<Uuid>, _>("message_id")?
                .map(MessageId::from_uuid),
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            attempts: to_u32(row.try_get("attempts")?)?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn to_u32(value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::InvalidData(format!("negative counter {value}")))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn map_lock_error(err: sqlx::Error, process_id: &ProcessId) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE)
    {
        metrics::counter!("process_lock_timeouts_total").increment(1);
        return StoreError::LockTimeout(process_id.clone());
    }
    StoreError::Database(err)
}

async fn upsert_state(conn: &mut PgConnection, state: &ProcessState) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO process_states
            (process_id, process_type, current_step, status, data, history, started_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (process_id) DO UPDATE SET
            current_step = EXCLUDED.current_step,
            status = EXCLUDED.status,
            data = EXCLUDED.data,
            history = EXCLUDED.history,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(state.process_id.as_str())
    .bind(&state.process_type)
    .bind(state.current_step.as_deref())
    .bind(state.status.as_str())
    .bind(serde_json::to_value(&state.data)?)
    .bind(serde_json::to_value(&state.history)?)
    .bind(state.started_at)
    .bind(state.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_outbox(conn: &mut PgConnection, message: &OutboxMessage) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outbox (id, aggregate_type, aggregate_id, event_type, payload, created_at, available_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(message.id.as_uuid())
    .bind(&message.aggregate_type)
    .bind(&message.aggregate_id)
    .bind(&message.event_type)
    .bind(&message.payload)
    .bind(message.created_at)
    .bind(message.available_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_dead_letter(conn: &mut PgConnection, record: &DeadLetterRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO dead_letters (id, kind, aggregate_id, step, message_id, payload, error, attempts, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(record.id)
    .bind(record.kind.as_str())
    .bind(&record.aggregate_id)
    .bind(record.step.as_deref())
    .bind(record.message_id.map(|id| id.as_uuid()))
    .bind(&record.payload)
    .bind(&record.error)
    .bind(to_i32(record.attempts))
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

struct PostgresProcessUnit {
    tx: Transaction<'static, Postgres>,
    loaded: Option<ProcessState>,
    staged: Option<ProcessState>,
    outbox: Vec<OutboxMessage>,
    dead_letters: Vec<DeadLetterRecord>,
}

#[async_trait]
impl ProcessUnit for PostgresProcessUnit {
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
        let PostgresProcessUnit {
            mut tx,
            staged,
            outbox,
            dead_letters,
            ..
        } = *self;

        if let Some(state) = &staged {
            upsert_state(&mut *tx, state).await?;
        }
        for message in &outbox {
            insert_outbox(&mut *tx, message).await?;
        }
        for record in &dead_letters {
            insert_dead_letter(&mut *tx, record).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessStateStore for PostgresSagaStore {
    #[tracing::instrument(skip(self))]
    async fn begin(&self, process_id: &ProcessId) -> Result<Box<dyn ProcessUnit>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(process_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_lock_error(e, process_id))?;

        let loaded = sqlx::query(
            r#"
            SELECT process_id, process_type, current_step, status, data, history, started_at, updated_at
            FROM process_states
            WHERE process_id = $1
            "#,
        )
        .bind(process_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(Self::row_to_state)
        .transpose()?;

        Ok(Box::new(PostgresProcessUnit {
            tx,
            loaded,
            staged: None,
            outbox: Vec::new(),
            dead_letters: Vec::new(),
        }))
    }

    async fn save(&self, state: &ProcessState) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_state(&mut *conn, state).await
    }

    async fn load(&self, process_id: &ProcessId) -> Result<ProcessState> {
        let row = sqlx::query(
            r#"
            SELECT process_id, process_type, current_step, status, data, history, started_at, updated_at
            FROM process_states
            WHERE process_id = $1
            "#,
        )
        .bind(process_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(process_id.clone()))?;

        Self::row_to_state(row)
    }

    async fn find_by_status(
        &self,
        status: ProcessStatus,
        updated_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ProcessState>> {
        let rows = sqlx::query(
            r#"
            SELECT process_id, process_type, current_step, status, data, history, started_at, updated_at
            FROM process_states
            WHERE status = $1 AND ($2::timestamptz IS NULL OR updated_at < $2)
            ORDER BY updated_at ASC
            "#,
        )
        .bind(status.as_str())
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_state).collect()
    }
}

struct PostgresOutboxClaim {
    tx: Transaction<'static, Postgres>,
    messages: Vec<OutboxMessage>,
    updates: Vec<(MessageId, ClaimUpdate)>,
}

#[async_trait]
impl OutboxClaim for PostgresOutboxClaim {
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

    async fn commit(self: Box<Self>) -> Result<()> {
        let PostgresOutboxClaim {
            mut tx, updates, ..
        } = *self;

        for (id, update) in updates {
            match update {
                ClaimUpdate::Published(at) => {
                    sqlx::query(
                        "UPDATE outbox SET published_at = $2 WHERE id = $1 AND published_at IS NULL",
                    )
                    .bind(id.as_uuid())
                    .bind(at)
                    .execute(&mut *tx)
                    .await?;
                }
                ClaimUpdate::Failed { error, retry_at } => {
                    sqlx::query(
                        r#"
                        UPDATE outbox
                        SET retry_count = retry_count + 1, last_error = $2, available_at = $3
                        WHERE id = $1
                        "#,
                    )
                    .bind(id.as_uuid())
                    .bind(&error)
                    .bind(retry_at)
                    .execute(&mut *tx)
                    .await?;
                }
                ClaimUpdate::DeadLettered(record) => {
                    sqlx::query(
                        r#"
                        UPDATE outbox
                        SET retry_count = retry_count + 1, last_error = $2, dead_lettered_at = $3
                        WHERE id = $1
                        "#,
                    )
                    .bind(id.as_uuid())
                    .bind(&record.error)
                    .bind(record.created_at)
                    .execute(&mut *tx)
                    .await?;
                    insert_dead_letter(&mut *tx, &record).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresSagaStore {
    async fn append(&self, message: OutboxMessage) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_outbox(&mut *conn, &message).await
    }

    #[tracing::instrument(skip(self))]
    async fn claim_unpublished(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn OutboxClaim>> {
        let mut tx = self.pool.begin().await?;

        // A message is eligible only when no earlier pending message exists
        // for its aggregate, locked or not.
        let sql = format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox o
            WHERE o.published_at IS NULL
              AND o.dead_lettered_at IS NULL
              AND o.available_at <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM outbox earlier
                  WHERE earlier.aggregate_id = o.aggregate_id
                    AND earlier.published_at IS NULL
                    AND earlier.dead_lettered_at IS NULL
                    AND (earlier.created_at, earlier.seq) < (o.created_at, o.seq)
              )
            ORDER BY o.created_at ASC, o.seq ASC
            LIMIT $2
            FOR UPDATE OF o SKIP LOCKED
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await?;

        let mut messages = rows
            .into_iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>>>()?;

        // Later rows of a claimed aggregate cannot be claimed elsewhere while
        // its head is pending, so they are taken in order up to the first
        // one that is not due.
        if !messages.is_empty() && messages.len() < batch_size {
            let aggregates: Vec<String> =
                messages.iter().map(|m| m.aggregate_id.clone()).collect();
            let heads: Vec<Uuid> = messages.iter().map(|m| m.id.as_uuid()).collect();
            let sql = format!(
                r#"
                SELECT {OUTBOX_COLUMNS}
                FROM outbox
                WHERE aggregate_id = ANY($1)
                  AND published_at IS NULL
                  AND dead_lettered_at IS NULL
                  AND NOT (id = ANY($2))
                ORDER BY aggregate_id, created_at ASC, seq ASC
                FOR UPDATE
                "#
            );
            let rows = sqlx::query(&sql)
                .bind(&aggregates)
                .bind(&heads)
                .fetch_all(&mut *tx)
                .await?;

            let mut blocked = HashSet::new();
            for row in rows {
                if messages.len() >= batch_size {
                    break;
                }
                let message = Self::row_to_message(row)?;
                if blocked.contains(&message.aggregate_id) {
                    continue;
                }
                if message.available_at > now {
                    blocked.insert(message.aggregate_id);
                    continue;
                }
                messages.push(message);
            }
        }
        metrics::counter!("outbox_claimed_total").increment(messages.len() as u64);

        Ok(Box::new(PostgresOutboxClaim {
            tx,
            messages,
            updates: Vec::new(),
        }))
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_message)
            .transpose()
    }

    async fn pending_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox WHERE published_at IS NULL AND dead_lettered_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM outbox WHERE published_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IdempotencyStore for PostgresSagaStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let acquired = sqlx::query(
            r#"
            INSERT INTO idempotency (key, status, result, expires_at)
            VALUES ($1, 'processing', NULL, $2)
            ON CONFLICT (key) DO UPDATE SET
                status = 'processing',
                result = NULL,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency.expires_at <= $3
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(expires_at(now, ttl))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn store_result(
        &self,
        key: &str,
        result: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency (key, status, result, expires_at)
            VALUES ($1, 'completed', $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                status = 'completed',
                result = EXCLUDED.result,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(result)
        .bind(expires_at(Utc::now(), ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_result(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let result: Option<Option<serde_json::Value>> = sqlx::query_scalar(
            r#"
            SELECT result FROM idempotency
            WHERE key = $1 AND status = 'completed' AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(result.flatten())
    }

    async fn release(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM idempotency WHERE key = $1 AND status = 'processing'")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DeadLetterSink for PostgresSagaStore {
    async fn send(&self, record: DeadLetterRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_dead_letter(&mut *conn, &record).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, aggregate_id, step, message_id, payload, error, attempts, created_at
            FROM dead_letters
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_dead_letter).collect()
    }
}
