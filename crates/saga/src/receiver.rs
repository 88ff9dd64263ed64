//! Idempotent receiver guarding inbound message handlers.

use std::future::Future;
use std::time::Duration;

use saga_store::IdempotencyStore;
use serde::{Serialize, de::DeserializeOwned};

use crate::config::FailurePolicy;
use crate::error::{Result, SagaError};

/// How a delivery was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<T> {
    /// The handler ran for this delivery.
    Processed(T),
    /// An earlier delivery already ran the handler; this is its cached result.
    Duplicate(T),
}

impl<T> Delivery<T> {
    pub fn into_inner(self) -> T {
        match self {
            Delivery::Processed(value) | Delivery::Duplicate(value) => value,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Delivery::Duplicate(_))
    }
}

/// Runs a handler at most once per idempotency key.
///
/// The key is claimed with a compare-and-set before the handler runs and
/// completed with the handler's result afterwards. The claim only lasts
/// `lease`; the recorded result lasts `ttl`. A failed handler releases the
/// claim so the broker's redelivery can try again, and a crashed one stops
/// blocking redelivery once the lease runs out.
#[derive(Clone)]
pub struct IdempotentReceiver<S> {
    store: S,
    policy: FailurePolicy,
    lease: Duration,
    ttl: Duration,
}

impl<S: IdempotencyStore> IdempotentReceiver<S> {
    pub fn new(store: S, policy: FailurePolicy, lease: Duration, ttl: Duration) -> Self {
        Self {
            store,
            policy,
            lease,
            ttl,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    #[tracing::instrument(skip(self, handler))]
    pub async fn receive<T, F, Fut>(&self, key: &str, handler: F) -> Result<Delivery<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let acquired = match self.store.try_acquire(key, self.lease).await {
            Ok(acquired) => acquired,
            Err(err) if err.is_unavailable() => {
                return match self.policy {
                    FailurePolicy::FailClosed => {
                        tracing::warn!(error = %err, "idempotency store unavailable, rejecting delivery");
                        Err(SagaError::StoreUnavailable(err.to_string()))
                    }
                    FailurePolicy::FailOpen => {
                        tracing::warn!(error = %err, "idempotency store unavailable, processing without duplicate check");
                        handler().await.map(Delivery::Processed)
                    }
                };
            }
            Err(err) => return Err(err.into()),
        };

        if !acquired {
            metrics::counter!("idempotent_duplicates_total").increment(1);
            return match self.store.get_result(key).await? {
                Some(cached) => {
                    tracing::debug!("duplicate delivery answered from cache");
                    Ok(Delivery::Duplicate(serde_json::from_value(cached)?))
                }
                None => Err(SagaError::InProgress(key.to_string())),
            };
        }

        match handler().await {
            Ok(value) => {
                let cached = serde_json::to_value(&value)?;
                self.store.store_result(key, &cached, self.ttl).await?;
                Ok(Delivery::Processed(value))
            }
            Err(err) => {
                if let Err(release_err) = self.store.release(key).await {
                    tracing::warn!(error = %release_err, "failed to release idempotency key");
                }
                Err(err)
            }
        }
    }
}
