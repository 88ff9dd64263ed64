//! Engine configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::retry::{Backoff, RetryPolicy};

/// Errors raised while reading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A mandatory variable is not set.
    #[error("{0} must be set")]
    Missing(&'static str),

    /// A variable is set to a value that cannot be parsed.
    #[error("Invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// What the idempotent receiver does when its store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Process the message without the duplicate check.
    FailOpen,
    /// Reject the message; the broker redelivers it later.
    FailClosed,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-open" | "fail_open" => Ok(FailurePolicy::FailOpen),
            "fail-closed" | "fail_closed" => Ok(FailurePolicy::FailClosed),
            other => Err(format!("unknown failure policy '{other}'")),
        }
    }
}

/// Outbox relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Upper bound on a single publish call.
    pub publish_timeout: Duration,
    /// Failed publish attempts tolerated before a message is dead-lettered.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            publish_timeout: Duration::from_secs(5),
            max_retries: 10,
            backoff: Backoff {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(300),
                multiplier: 2,
            },
        }
    }
}

/// Recovery sweep settings.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub interval: Duration,
    /// Only processes idle for at least this long are inspected.
    pub staleness_threshold: Duration,
    /// Published outbox rows older than this are deleted.
    pub outbox_retention: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(60),
            outbox_retention: Duration::from_secs(7 * 86_400),
        }
    }
}

/// Orchestration engine configuration.
///
/// Reads from environment variables:
/// - `SAGA_IDEMPOTENCY_POLICY`: `fail-open` or `fail-closed` (required)
/// - `SAGA_IDEMPOTENCY_TTL_SECS`: lifetime of a recorded result (default: `86400`)
/// - `SAGA_IDEMPOTENCY_LEASE_SECS`: how long a claimed key blocks redelivery
///   while its handler runs (default: `30`)
/// - `SAGA_STEP_MAX_ATTEMPTS`: attempts per step on transient failure (default: `3`)
/// - `SAGA_COMPENSATION_MAX_ATTEMPTS`: attempts per compensation (default: `5`)
/// - `SAGA_RETRY_INITIAL_MS` / `SAGA_RETRY_MAX_MS`: step backoff (default: `100` / `30000`)
/// - `SAGA_STEP_TIMEOUT_SECS`: default step deadline (default: `300`)
/// - `SAGA_RELAY_BATCH_SIZE`: outbox rows per poll (default: `100`)
/// - `SAGA_RELAY_POLL_INTERVAL_MS`: relay idle sleep (default: `500`)
/// - `SAGA_RELAY_PUBLISH_TIMEOUT_MS`: per-publish timeout (default: `5000`)
/// - `SAGA_RELAY_MAX_RETRIES`: publish failures before dead-lettering (default: `10`)
/// - `SAGA_RECOVERY_INTERVAL_SECS`: recovery sweep period (default: `30`)
/// - `SAGA_RECOVERY_STALENESS_SECS`: recovery idle threshold (default: `60`)
/// - `SAGA_OUTBOX_RETENTION_SECS`: published outbox row lifetime (default: `604800`)
/// - `SAGA_WORKERS`: worker pool size (default: `4`)
/// - `SAGA_QUEUE_CAPACITY`: inbound queue bound (default: `1024`)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub idempotency_policy: FailurePolicy,
    pub idempotency_ttl: Duration,
    /// Expiry of a key claimed for processing. A handler that dies without
    /// recording a result stops blocking redelivery once it passes.
    pub processing_lease: Duration,
    pub step_retry: RetryPolicy,
    pub compensation_retry: RetryPolicy,
    pub default_step_timeout: Duration,
    pub relay: RelayConfig,
    pub recovery: RecoveryConfig,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl EngineConfig {
    /// Creates a configuration with default tuning.
    ///
    /// The idempotency failure policy has no default and must be chosen.
    pub fn new(idempotency_policy: FailurePolicy) -> Self {
        Self {
            idempotency_policy,
            idempotency_ttl: Duration::from_secs(86_400),
            processing_lease: Duration::from_secs(30),
            step_retry: RetryPolicy::new(3, Backoff::default()),
            compensation_retry: RetryPolicy::new(5, Backoff::default()),
            default_step_timeout: Duration::from_secs(300),
            relay: RelayConfig::default(),
            recovery: RecoveryConfig::default(),
            workers: 4,
            queue_capacity: 1024,
        }
    }

    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let policy_raw =
            lookup("SAGA_IDEMPOTENCY_POLICY").ok_or(ConfigError::Missing("SAGA_IDEMPOTENCY_POLICY"))?;
        let policy = policy_raw
            .parse::<FailurePolicy>()
            .map_err(|_| ConfigError::Invalid {
                name: "SAGA_IDEMPOTENCY_POLICY",
                value: policy_raw.clone(),
            })?;

        let mut config = Self::new(policy);
        let env = Lookup(&lookup);

        if let Some(secs) = env.parse::<u64>("SAGA_IDEMPOTENCY_TTL_SECS")? {
            config.idempotency_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("SAGA_IDEMPOTENCY_LEASE_SECS")? {
            config.processing_lease = Duration::from_secs(secs);
        }
        if let Some(attempts) = env.parse::<u32>("SAGA_STEP_MAX_ATTEMPTS")? {
            config.step_retry.max_attempts = attempts.max(1);
        }
        if let Some(attempts) = env.parse::<u32>("SAGA_COMPENSATION_MAX_ATTEMPTS")? {
            config.compensation_retry.max_attempts = attempts.max(1);
        }
        if let Some(ms) = env.parse::<u64>("SAGA_RETRY_INITIAL_MS")? {
            config.step_retry.backoff.initial = Duration::from_millis(ms);
            config.compensation_retry.backoff.initial = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("SAGA_RETRY_MAX_MS")? {
            config.step_retry.backoff.max = Duration::from_millis(ms);
            config.compensation_retry.backoff.max = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse::<u64>("SAGA_STEP_TIMEOUT_SECS")? {
            config.default_step_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = env.parse::<usize>("SAGA_RELAY_BATCH_SIZE")? {
            config.relay.batch_size = size.max(1);
        }
        if let Some(ms) = env.parse::<u64>("SAGA_RELAY_POLL_INTERVAL_MS")? {
            config.relay.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("SAGA_RELAY_PUBLISH_TIMEOUT_MS")? {
            config.relay.publish_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = env.parse::<u32>("SAGA_RELAY_MAX_RETRIES")? {
            config.relay.max_retries = retries;
        }
        if let Some(secs) = env.parse::<u64>("SAGA_RECOVERY_INTERVAL_SECS")? {
            config.recovery.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("SAGA_RECOVERY_STALENESS_SECS")? {
            config.recovery.staleness_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("SAGA_OUTBOX_RETENTION_SECS")? {
            config.recovery.outbox_retention = Duration::from_secs(secs);
        }
        if let Some(workers) = env.parse::<usize>("SAGA_WORKERS")? {
            config.workers = workers.max(1);
        }
        if let Some(capacity) = env.parse::<usize>("SAGA_QUEUE_CAPACITY")? {
            config.queue_capacity = capacity.max(1);
        }

        Ok(config)
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, name: &'static str) -> Result<Option<T>, ConfigError> {
        match (self.0)(name) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Invalid { name, value }),
        }
    }
}
