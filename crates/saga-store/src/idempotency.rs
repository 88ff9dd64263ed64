use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// A handler holds the key and is running.
    Processing,
    /// The handler finished; `result` holds its reply.
    Completed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Processing => "processing",
            IdempotencyStatus::Completed => "completed",
        }
    }
}

/// A claimed or completed idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    pub result: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Expired records are treated as absent by `try_acquire`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Converts a TTL into an expiry instant relative to `now`.
pub fn expires_at(now: DateTime<Utc>, ttl: std::time::Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64)
}
