//! Outbox relay.
//!
//! Claims due outbox rows, publishes them and records the outcome in one
//! commit per batch. A crash between publishing and committing leaves the
//! rows unpublished, so they are sent again: delivery is at least once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use saga_store::{DeadLetterRecord, OutboxMessage, OutboxStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::RelayConfig;
use crate::error::Result;

/// Errors returned by a [`MessagePublisher`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The broker could not take the message right now; retried with backoff.
    #[error("Transient publish failure: {0}")]
    Transient(String),

    /// The broker refused the message; retrying will not help.
    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// The broker boundary.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes `message`, returning once the broker has accepted it.
    async fn publish(&self, message: &OutboxMessage) -> std::result::Result<(), PublishError>;
}

#[async_trait]
impl<P: MessagePublisher + ?Sized> MessagePublisher for Arc<P> {
    async fn publish(&self, message: &OutboxMessage) -> std::result::Result<(), PublishError> {
        (**self).publish(message).await
    }
}

/// Outcome of one relay batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub claimed: usize,
    pub published: usize,
    /// Failed attempts rescheduled with backoff.
    pub failed: usize,
    pub dead_lettered: usize,
}

/// Publishes outbox messages through a [`MessagePublisher`].
pub struct OutboxRelay<S, P> {
    store: S,
    publisher: P,
    config: RelayConfig,
}

impl<S: OutboxStore, P: MessagePublisher> OutboxRelay<S, P> {
    pub fn new(store: S, publisher: P, config: RelayConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Claims up to `batch_size` due messages and publishes them.
    #[tracing::instrument(skip(self))]
    pub async fn poll_and_publish(&self, batch_size: usize) -> Result<RelayReport> {
        let started = Instant::now();
        let mut claim = self.store.claim_unpublished(batch_size, Utc::now()).await?;
        let messages = claim.messages().to_vec();
        let mut report = RelayReport {
            claimed: messages.len(),
            ..RelayReport::default()
        };
        if messages.is_empty() {
            return Ok(report);
        }

        // Aggregates with a rescheduled message publish nothing more this
        // batch; their later rows stay pending behind it.
        let mut held = HashSet::new();
        for message in &messages {
            if held.contains(message.aggregate_id.as_str()) {
                continue;
            }
            match self.publish_bounded(message).await {
                Ok(()) => {
                    claim.mark_published(message.id, Utc::now());
                    report.published += 1;
                }
                Err(PublishError::Rejected(reason)) => {
                    tracing::error!(
                        message_id = %message.id,
                        event_type = %message.event_type,
                        %reason,
                        "message rejected by broker, dead-lettering"
                    );
                    let record = DeadLetterRecord::outbox(
                        message,
                        format!("rejected: {reason}"),
                        message.retry_count + 1,
                    );
                    claim.dead_letter(message.id, record);
                    report.dead_lettered += 1;
                }
                Err(err) => {
                    let attempts = message.retry_count + 1;
                    if attempts > self.config.max_retries {
                        tracing::error!(
                            message_id = %message.id,
                            event_type = %message.event_type,
                            attempts,
                            error = %err,
                            "publish retries exhausted, dead-lettering"
                        );
                        claim.dead_letter(message.id, DeadLetterRecord::outbox(message, err.to_string(), attempts));
                        report.dead_lettered += 1;
                    } else {
                        let retry_at = self.config.backoff.retry_at(Utc::now(), attempts);
                        tracing::warn!(
                            message_id = %message.id,
                            attempts,
                            %retry_at,
                            error = %err,
                            "publish failed, rescheduled"
                        );
                        claim.mark_failed(message.id, &err.to_string(), retry_at);
                        held.insert(message.aggregate_id.as_str());
                        report.failed += 1;
                    }
                }
            }
        }

        claim.commit().await?;

        metrics::counter!("outbox_published_total").increment(report.published as u64);
        metrics::counter!("outbox_publish_failures_total")
            .increment((report.failed + report.dead_lettered) as u64);
        metrics::counter!("dead_letters_total").increment(report.dead_lettered as u64);
        metrics::histogram!("outbox_relay_batch_seconds").record(started.elapsed().as_secs_f64());

        tracing::debug!(
            claimed = report.claimed,
            published = report.published,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "relay batch committed"
        );
        Ok(report)
    }

    async fn publish_bounded(&self, message: &OutboxMessage) -> std::result::Result<(), PublishError> {
        match tokio::time::timeout(self.config.publish_timeout, self.publisher.publish(message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PublishError::Transient(format!(
                "publish timed out after {:?}",
                self.config.publish_timeout
            ))),
        }
    }

    /// Polls until `shutdown` flips to true.
    ///
    /// Full batches without failures are followed immediately by another
    /// poll so a backlog drains without waiting for the interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(batch_size = self.config.batch_size, "outbox relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            loop {
                match self.poll_and_publish(self.config.batch_size).await {
                    Ok(report)
                        if report.claimed == self.config.batch_size
                            && report.failed == 0
                            && !*shutdown.borrow() => {}
                    Ok(_) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "relay poll failed");
                        break;
                    }
                }
            }
        }

        tracing::info!("outbox relay stopped");
    }
}
