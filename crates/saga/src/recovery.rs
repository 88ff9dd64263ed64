//! Recovery sweep for dispatched work whose result never arrived.
//!
//! A step or compensation pending past its deadline is treated as a
//! transient failure of that attempt: it is retried while attempts remain,
//! otherwise the usual failure path runs. An expired step stays unresolved:
//! if its success arrives later it is recorded as completed and compensated
//! when the saga rolls back. Late compensation results are ignored since the
//! compensation is dispatched again.

use chrono::{DateTime, Utc};
use common::ProcessId;
use saga_store::{ProcessStatus, SagaStore};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::messages::{CommandKind, StepFailure, StepOutcome, StepResult};
use crate::orchestrator::{Effects, Orchestrator};

const DEADLINE_EXCEEDED: &str = "deadline exceeded without a result";

/// Outcome of one recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Stale processes examined.
    pub inspected: usize,
    /// Executions expired and handed to the failure path.
    pub expired: usize,
}

impl<S: SagaStore> Orchestrator<S> {
    /// Expires overdue steps and compensations of stale processes.
    #[tracing::instrument(skip(self))]
    pub async fn recover_stalled(&self) -> Result<RecoveryReport> {
        let now = Utc::now();
        let staleness = chrono::Duration::from_std(self.config.recovery.staleness_threshold)
            .unwrap_or(chrono::Duration::zero());
        let cutoff = now - staleness;

        let mut report = RecoveryReport::default();
        for status in [ProcessStatus::Running, ProcessStatus::Compensating] {
            for candidate in self.store.find_by_status(status, Some(cutoff)).await? {
                report.inspected += 1;
                match self.expire_overdue(candidate.process_id()).await {
                    Ok(true) => report.expired += 1,
                    Ok(false) => {}
                    Err(err) => tracing::warn!(
                        process_id = %candidate.process_id(),
                        error = %err,
                        "recovery skipped process"
                    ),
                }
            }
        }

        if report.expired > 0 {
            tracing::info!(inspected = report.inspected, expired = report.expired, "recovery sweep finished");
        }
        Ok(report)
    }

    /// Runs the sweep every recovery interval until `shutdown` flips to true.
    ///
    /// Each pass also purges expired idempotency keys and published outbox
    /// rows past their retention.
    pub async fn run_recovery(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.recovery.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            if let Err(err) = self.recover_stalled().await {
                tracing::warn!(error = %err, "recovery sweep failed");
            }
            match self.store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "expired idempotency keys purged"),
                Err(err) => tracing::warn!(error = %err, "idempotency purge failed"),
            }
            if let Err(err) = self.purge_published_outbox().await {
                tracing::warn!(error = %err, "outbox purge failed");
            }
        }

        tracing::info!("recovery loop stopped");
    }

    /// Deletes published outbox rows older than the retention window.
    pub async fn purge_published_outbox(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.recovery.outbox_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.purge_published(cutoff).await?;
        if purged > 0 {
            tracing::debug!(purged, "published outbox rows purged");
        }
        Ok(purged)
    }

    async fn expire_overdue(&self, process_id: &ProcessId) -> Result<bool> {
        let mut unit = self.store.begin(process_id).await?;
        let Some(mut state) = unit.state().cloned() else {
            return Ok(false);
        };

        // Re-checked under the lock: a result may have landed since the scan.
        let now = Utc::now();
        let overdue = match state.status() {
            ProcessStatus::Running => state
                .in_flight()
                .filter(|execution| execution.is_overdue(now))
                .map(|execution| (execution.step.clone(), execution.attempt, CommandKind::Execute)),
            ProcessStatus::Compensating => {
                state.compensation_in_flight().and_then(|(_, execution)| {
                    let record = execution.compensation.as_ref()?;
                    record
                        .deadline
                        .is_some_and(|deadline| deadline <= now)
                        .then(|| (execution.step.clone(), record.attempt, CommandKind::Compensate))
                })
            }
            _ => None,
        };
        let Some((step_name, attempt, kind)) = overdue else {
            return Ok(false);
        };

        let expired = StepResult {
            process_id: process_id.clone(),
            step_name,
            kind,
            attempt,
            outcome: StepOutcome::Failure {
                error: StepFailure::transient(DEADLINE_EXCEEDED),
            },
        };

        let before = state.status();
        let mut effects = Effects::default();
        let applied = match kind {
            CommandKind::Execute => {
                let index = state.history().len().saturating_sub(1);
                let applied =
                    self.apply_step_result(&mut state, unit.as_mut(), &expired, now, &mut effects)?;
                if applied {
                    state.mark_unresolved(index)?;
                }
                applied
            }
            CommandKind::Compensate => self.apply_compensation_result(
                &mut state,
                unit.as_mut(),
                &expired,
                now,
                &mut effects,
            )?,
        };
        if !applied {
            return Ok(false);
        }

        unit.save(state.clone());
        unit.commit().await?;
        effects.record(before, &state);

        tracing::warn!(
            %process_id,
            step = %expired.step_name,
            attempt,
            kind = kind.as_str(),
            "expired overdue execution"
        );
        Ok(true)
    }
}
