//! Saga orchestrator.
//!
//! Advances sagas one step at a time and drives compensation. Every
//! mutation happens inside a process unit of work: the state write, the
//! outbox messages it announces and any dead-letter records commit
//! together or not at all.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::ProcessId;
use saga_store::{DeadLetterRecord, ProcessState, ProcessStatus, ProcessUnit, SagaStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::config::EngineConfig;
use crate::error::{Result, SagaError};
use crate::events::SagaEvent;
use crate::messages::{
    CommandKind, KEY_SEPARATOR, RESULT_TOPIC, StepCommand, StepFailure, StepOutcome, StepResult,
};
use crate::receiver::{Delivery, IdempotentReceiver};
use crate::registry::StepRegistry;

const LATE_SUCCESS_REASON: &str = "step succeeded after being closed without a reply";

/// Request to start a new saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Caller-assigned ID; a UUID is generated when absent.
    #[serde(default)]
    pub process_id: Option<ProcessId>,
    pub process_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl StartRequest {
    pub fn new(process_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            process_id: None,
            process_type: process_type.into(),
            data,
        }
    }

    pub fn with_id(mut self, process_id: impl Into<ProcessId>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }
}

/// What handling one step result did to its process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub process_id: ProcessId,
    pub status: ProcessStatus,
    pub current_step: Option<String>,
    /// False when the result was stale and ignored.
    pub applied: bool,
}

impl Transition {
    fn of(state: &ProcessState, applied: bool) -> Self {
        Self {
            process_id: state.process_id().clone(),
            status: state.status(),
            current_step: state.current_step().map(str::to_string),
            applied,
        }
    }
}

/// Side effects to report once a unit of work has committed.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub(crate) retries: u64,
    pub(crate) dead_letters: u64,
}

impl Effects {
    pub(crate) fn record(self, before: ProcessStatus, state: &ProcessState) {
        if self.retries > 0 {
            metrics::counter!("saga_step_retries_total").increment(self.retries);
        }
        if self.dead_letters > 0 {
            metrics::counter!("dead_letters_total").increment(self.dead_letters);
        }
        let after = state.status();
        if before == after || !after.is_terminal() {
            return;
        }
        let duration = (state.updated_at() - state.started_at()).num_milliseconds() as f64 / 1000.0;
        metrics::histogram!("saga_duration_seconds").record(duration);
        match after {
            ProcessStatus::Completed => metrics::counter!("saga_completed_total").increment(1),
            ProcessStatus::Compensated => metrics::counter!("saga_compensated_total").increment(1),
            ProcessStatus::Failed => metrics::counter!("saga_failed_total").increment(1),
            ProcessStatus::Running | ProcessStatus::Compensating => {}
        }
    }
}

/// Drives saga instances through their registered steps.
///
/// Holds no per-process state of its own; any number of orchestrators can
/// share one store.
pub struct Orchestrator<S: SagaStore> {
    pub(crate) store: S,
    registry: Arc<StepRegistry>,
    pub(crate) config: Arc<EngineConfig>,
    receiver: IdempotentReceiver<S>,
}

impl<S: SagaStore> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<S: SagaStore> Orchestrator<S> {
    pub fn new(store: S, registry: StepRegistry, config: EngineConfig) -> Self {
        let receiver = IdempotentReceiver::new(
            store.clone(),
            config.idempotency_policy,
            config.processing_lease,
            config.idempotency_ttl,
        );
        Self {
            store,
            registry: Arc::new(registry),
            config: Arc::new(config),
            receiver,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a saga and dispatches its first step.
    #[tracing::instrument(skip(self, request), fields(process_type = %request.process_type))]
    pub async fn start(&self, request: StartRequest) -> Result<ProcessState> {
        let definition = self.registry.saga(&request.process_type)?;
        let first_step = definition.first_step().ok_or_else(|| {
            SagaError::InvalidDefinition(format!("saga '{}' has no steps", request.process_type))
        })?;

        let process_id = request.process_id.unwrap_or_default();
        if process_id.as_str().contains(KEY_SEPARATOR) {
            return Err(SagaError::InvalidProcessId(
                process_id,
                format!("'{KEY_SEPARATOR}' is reserved"),
            ));
        }
        if process_id.as_str().trim().is_empty() {
            return Err(SagaError::InvalidProcessId(process_id, "empty".to_string()));
        }
        let mut unit = self.store.begin(&process_id).await?;
        if unit.state().is_some() {
            return Err(SagaError::AlreadyExists(process_id));
        }

        let now = Utc::now();
        let mut state =
            ProcessState::new(process_id.clone(), &request.process_type, request.data, now);
        unit.append_outbox(
            SagaEvent::saga_started(&request.process_type, first_step, now).to_outbox(&process_id)?,
        );
        self.dispatch_step(&mut state, unit.as_mut(), first_step, 1, now, now)?;

        unit.save(state.clone());
        unit.commit().await?;

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(%process_id, step = first_step, "saga started");
        Ok(state)
    }

    /// Applies a worker's reply, at most once per idempotency key.
    #[tracing::instrument(
        skip(self, result),
        fields(process_id = %result.process_id, step = %result.step_name, attempt = result.attempt)
    )]
    pub async fn handle_event(&self, result: StepResult) -> Result<Delivery<Transition>> {
        let key = result.idempotency_key();
        self.receiver.receive(&key, || self.apply_result(result)).await
    }

    /// Fails a running saga from outside and starts compensating it.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self, process_id: &ProcessId, reason: &str) -> Result<ProcessState> {
        let mut unit = self.store.begin(process_id).await?;
        let mut state = unit
            .state()
            .cloned()
            .ok_or_else(|| SagaError::NotFound(process_id.clone()))?;
        if state.status() != ProcessStatus::Running {
            return Err(SagaError::InvalidState {
                process_id: process_id.clone(),
                status: state.status(),
            });
        }

        let before = state.status();
        let now = Utc::now();
        let from_step = match state.in_flight().map(|e| (e.step.clone(), e.attempt)) {
            Some((step, attempt)) => {
                // The command is already out; a success reported later is still compensated.
                state.abandon_in_flight(reason, now)?;
                unit.append_outbox(
                    SagaEvent::step_failed(&step, attempt, reason).to_outbox(process_id)?,
                );
                step
            }
            None => state.current_step().unwrap_or_default().to_string(),
        };
        self.begin_compensation(&mut state, unit.as_mut(), &from_step, reason, now)?;

        unit.save(state.clone());
        unit.commit().await?;
        Effects::default().record(before, &state);

        tracing::warn!(%process_id, reason, "saga aborted");
        Ok(state)
    }

    /// Loads a saga's current state.
    pub async fn get_process(&self, process_id: &ProcessId) -> Result<ProcessState> {
        Ok(self.store.load(process_id).await?)
    }

    async fn apply_result(&self, result: StepResult) -> Result<Transition> {
        let mut unit = self.store.begin(&result.process_id).await?;
        let mut state = unit
            .state()
            .cloned()
            .ok_or_else(|| SagaError::NotFound(result.process_id.clone()))?;

        let before = state.status();
        let now = Utc::now();
        let mut effects = Effects::default();
        let applied = match result.kind {
            CommandKind::Execute => {
                self.apply_step_result(&mut state, unit.as_mut(), &result, now, &mut effects)?
            }
            CommandKind::Compensate => self.apply_compensation_result(
                &mut state,
                unit.as_mut(),
                &result,
                now,
                &mut effects,
            )?,
        };

        if !applied {
            tracing::info!(status = %state.status(), "stale step result ignored");
            return Ok(Transition::of(&state, false));
        }

        unit.save(state.clone());
        unit.commit().await?;
        effects.record(before, &state);
        Ok(Transition::of(&state, true))
    }

    /// Returns false when `result` does not answer the step in flight.
    pub(crate) fn apply_step_result(
        &self,
        state: &mut ProcessState,
        unit: &mut dyn ProcessUnit,
        result: &StepResult,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<bool> {
        if let StepOutcome::Success { payload } = &result.outcome
            && let Some(index) = state.unresolved_execution(&result.step_name, result.attempt)
        {
            self.apply_late_success(state, unit, index, result, payload, now)?;
            return Ok(true);
        }
        if state.status() != ProcessStatus::Running {
            return Ok(false);
        }
        let matches_in_flight = state
            .in_flight()
            .is_some_and(|e| e.step == result.step_name && e.attempt == result.attempt);
        if !matches_in_flight {
            return Ok(false);
        }

        let process_id = state.process_id().clone();
        match &result.outcome {
            StepOutcome::Success { payload } => {
                state.complete_step(payload.clone(), now)?;
                unit.append_outbox(
                    SagaEvent::step_completed(&result.step_name, result.attempt)
                        .to_outbox(&process_id)?,
                );

                let definition = self.registry.saga(state.process_type())?;
                match definition.next_after(&result.step_name) {
                    Some(next) => self.dispatch_step(state, unit, next, 1, now, now)?,
                    None => {
                        state.transition_to(ProcessStatus::Completed, now)?;
                        unit.append_outbox(SagaEvent::saga_completed(now).to_outbox(&process_id)?);
                        tracing::info!(%process_id, "saga completed");
                    }
                }
            }
            StepOutcome::Failure { error } => {
                self.handle_step_failure(state, unit, &result.step_name, result.attempt, error, now, effects)?;
            }
        }
        Ok(true)
    }

    /// Accepts a success for an execution that was closed without a reply.
    ///
    /// The step took effect after all, so it is recorded as completed. A
    /// running saga keeps going and a compensating one reaches it in its
    /// walk; a compensated or failed saga reopens compensation for it.
    fn apply_late_success(
        &self,
        state: &mut ProcessState,
        unit: &mut dyn ProcessUnit,
        index: usize,
        result: &StepResult,
        payload: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let process_id = state.process_id().clone();
        let step = result.step_name.as_str();
        state.settle_late_success(index, payload.clone(), now)?;
        unit.append_outbox(SagaEvent::step_completed(step, result.attempt).to_outbox(&process_id)?);
        tracing::warn!(
            %process_id,
            step,
            attempt = result.attempt,
            status = %state.status(),
            "step succeeded after being closed without a reply"
        );

        match state.status() {
            ProcessStatus::Compensated | ProcessStatus::Failed => {
                state.reopen_compensation(now)?;
                unit.append_outbox(
                    SagaEvent::compensation_started(step, LATE_SUCCESS_REASON)
                        .to_outbox(&process_id)?,
                );
                self.drive_compensation(state, unit, now)
            }
            ProcessStatus::Running | ProcessStatus::Compensating | ProcessStatus::Completed => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_step_failure(
        &self,
        state: &mut ProcessState,
        unit: &mut dyn ProcessUnit,
        step: &str,
        attempt: u32,
        failure: &StepFailure,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<()> {
        let process_id = state.process_id().clone();
        state.fail_step(&failure.message, now)?;
        unit.append_outbox(
            SagaEvent::step_failed(step, attempt, &failure.message).to_outbox(&process_id)?,
        );

        if failure.is_transient() && self.config.step_retry.should_retry(attempt) {
            let retry_at = self.config.step_retry.backoff.retry_at(now, attempt);
            unit.append_outbox(
                SagaEvent::step_retry_scheduled(step, attempt + 1, retry_at)
                    .to_outbox(&process_id)?,
            );
            self.dispatch_step(state, unit, step, attempt + 1, now, retry_at)?;
            effects.retries += 1;
            tracing::warn!(%process_id, step, attempt, error = %failure.message, "step failed, retrying");
            return Ok(());
        }

        tracing::warn!(%process_id, step, attempt, error = %failure.message, "step failed, compensating");
        self.begin_compensation(state, unit, step, &failure.message, now)
    }

    fn begin_compensation(
        &self,
        state: &mut ProcessState,
        unit: &mut dyn ProcessUnit,
        from_step: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        state.transition_to(ProcessStatus::Compensating, now)?;
        unit.append_outbox(
            SagaEvent::compensation_started(from_step, reason).to_outbox(state.process_id())?,
        );
        self.drive_compensation(state, unit, now)
    }

    /// Dispatches the next compensation, or finishes the saga when none remain.
    ///
    /// Completed steps are visited from the most recent backwards. Steps
    /// registered without a compensating action are closed immediately.
    fn drive_compensation(
        &self,
        state: &mut ProcessState,
        unit: &mut dyn ProcessUnit,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let process_id = state.process_id().clone();
        while let Some(index) = state.next_compensation_target() {
            let step = state.history()[index].step.clone();
            match self.registry.step(&step)?.compensation.clone() {
                Some(action) => {
                    return self.dispatch_compensation(state, unit, index, &action, 1, now, now);
                }
                None => {
                    state.skip_compensation(index, now)?;
                    unit.append_outbox(
                        SagaEvent::compensation_step_completed(&step, 0).to_outbox(&process_id)?,
                    );
                }
            }
        }

        if state.has_abandoned_compensation() {
            let reason = "one or more compensations were abandoned";
            state.transition_to(ProcessStatus::Failed, now)?;
            unit.append_outbox(SagaEvent::saga_failed(reason, now).to_outbox(&process_id)?);
            tracing::error!(%process_id, reason, "saga failed");
        } else {
            state.transition_to(ProcessStatus::Compensated, now)?;
            unit.append_outbox(SagaEvent::saga_compensated(now).to_outbox(&process_id)?);
            tracing::info!(%process_id, "saga compensated");
        }
        Ok(())
    }

    /// Returns false when `result` does not answer the compensation in flight.
    pub(crate) fn apply_compensation_result(
        &self,
        state: &mut ProcessState,
        unit: &mut dyn ProcessUnit,
        result: &StepResult,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<bool> {
        if state.status() != ProcessStatus::Compensating {
            return Ok(false);
        }
        let Some((index, action)) = state.compensation_in_flight().and_then(|(index, e)| {
            let record = e.compensation.as_ref()?;
            (e.step == result.step_name && record.attempt == result.attempt)
                .then(|| (index, record.action.clone().unwrap_or_default()))
        }) else {
            return Ok(false);
        };

        let process_id = state.process_id().clone();
        let step = result.step_name.as_str();
        let attempt = result.attempt;
        match &result.outcome {
            StepOutcome::Success { .. } => {
                state.complete_compensation(index, now)?;
                unit.append_outbox(
                    SagaEvent::compensation_step_completed(step, attempt).to_outbox(&process_id)?,
                );
                tracing::info!(%process_id, step, %action, "compensation applied");
                self.drive_compensation(state, unit, now)?;
            }
            StepOutcome::Failure { error } => {
                unit.append_outbox(
                    SagaEvent::compensation_step_failed(step, attempt, &error.message)
                        .to_outbox(&process_id)?,
                );

                // Compensations must eventually apply, so every failure is retried.
                if self.config.compensation_retry.should_retry(attempt) {
                    state.record_compensation_error(index, &error.message, now)?;
                    let retry_at = self.config.compensation_retry.backoff.retry_at(now, attempt);
                    self.dispatch_compensation(state, unit, index, &action, attempt + 1, now, retry_at)?;
                    effects.retries += 1;
                    tracing::warn!(%process_id, step, %action, attempt, error = %error.message, "compensation failed, retrying");
                } else {
                    state.abandon_compensation(index, &error.message, now)?;
                    unit.dead_letter(DeadLetterRecord::compensation(
                        &process_id,
                        step,
                        json!({ "action": action, "data": state.data() }),
                        &error.message,
                        attempt,
                    ));
                    effects.dead_letters += 1;
                    tracing::error!(%process_id, step, %action, attempts = attempt, error = %error.message, "compensation abandoned");
                    self.drive_compensation(state, unit, now)?;
                }
            }
        }
        Ok(true)
    }

    /// Appends a pending execution and stages its command in the outbox.
    pub(crate) fn dispatch_step(
        &self,
        state: &mut ProcessState,
        unit: &mut dyn ProcessUnit,
        step: &str,
        attempt: u32,
        now: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        let deadline = self.deadline_for(step, available_at)?;
        state.begin_step(step, attempt, now, Some(deadline))?;

        let command = self.command(state, step, step, CommandKind::Execute, attempt, deadline);
        unit.append_outbox(command.to_outbox()?.available_at(available_at));
        tracing::debug!(process_id = %state.process_id(), step, attempt, "step dispatched");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_compensation(
        &self,
        state: &mut ProcessState,
        unit: &mut dyn ProcessUnit,
        index: usize,
        action: &str,
        attempt: u32,
        now: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        let step = state.history()[index].step.clone();
        let deadline = self.deadline_for(&step, available_at)?;
        state.begin_compensation(index, action, attempt, now, Some(deadline))?;

        let command =
            self.command(state, &step, action, CommandKind::Compensate, attempt, deadline);
        unit.append_outbox(command.to_outbox()?.available_at(available_at));
        tracing::debug!(process_id = %state.process_id(), step, action, attempt, "compensation dispatched");
        Ok(())
    }

    fn deadline_for(&self, step: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let timeout = self
            .registry
            .step(step)?
            .timeout
            .unwrap_or(self.config.default_step_timeout);
        Ok(chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| from.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    fn command(
        &self,
        state: &ProcessState,
        step: &str,
        action: &str,
        kind: CommandKind,
        attempt: u32,
        deadline: DateTime<Utc>,
    ) -> StepCommand {
        StepCommand {
            process_id: state.process_id().clone(),
            process_type: state.process_type().to_string(),
            step_name: step.to_string(),
            action: action.to_string(),
            kind,
            attempt,
            data: state.data().clone(),
            reply_to: RESULT_TOPIC.to_string(),
            deadline: Some(deadline),
        }
    }
}
