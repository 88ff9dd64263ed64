//! Saga process state and its step history.

use chrono::{DateTime, Utc};
use common::ProcessId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The status of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Running ──┬──► Completed
///           └──► Compensating ──┬──► Compensated
///                               └──► Failed
/// ```
///
/// [`ProcessState::reopen_compensation`] is the one way back out of
/// `Compensated` or `Failed`: a step closed without a reply later reported
/// success and its effect still has to be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Steps are being dispatched and executed.
    Running,

    /// A step failed and completed steps are being undone.
    Compensating,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A compensation exhausted its retries (terminal, needs manual remediation).
    Failed,

    /// Every completed step was compensated (terminal state).
    Compensated,
}

impl ProcessStatus {
    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ProcessStatus) -> bool {
        matches!(
            (self, next),
            (ProcessStatus::Running, ProcessStatus::Running)
                | (ProcessStatus::Running, ProcessStatus::Completed)
                | (ProcessStatus::Running, ProcessStatus::Compensating)
                | (ProcessStatus::Compensating, ProcessStatus::Compensated)
                | (ProcessStatus::Compensating, ProcessStatus::Failed)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::Compensated
        )
    }

    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Compensating => "compensating",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Compensated => "compensated",
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ProcessStatus::Running),
            "compensating" => Ok(ProcessStatus::Compensating),
            "completed" => Ok(ProcessStatus::Completed),
            "failed" => Ok(ProcessStatus::Failed),
            "compensated" => Ok(ProcessStatus::Compensated),
            other => Err(format!("unknown process status '{other}'")),
        }
    }
}

/// Status of a single dispatched step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

/// Status of the compensation of a completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    Completed,
    Failed,
}

/// Tracks the compensation of one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// The compensating action, `None` when the step has nothing to undo.
    pub action: Option<String>,
    pub status: CompensationStatus,
    /// Current dispatch attempt, starting at 1.
    pub attempt: u32,
    pub dispatched_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last error reported by the compensating action.
    pub error: Option<String>,
}

/// One dispatched attempt of a saga step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    /// When the recovery sweep considers this attempt lost.
    pub deadline: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Map<String, Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub compensation: Option<CompensationRecord>,
    /// Closed without a reply from the worker (abort or deadline), so the
    /// step may still have taken effect.
    #[serde(default)]
    pub unresolved: bool,
}

impl StepExecution {
    /// Returns true while waiting for the step's result.
    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }

    /// Returns true if the deadline of this attempt has passed at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// Errors raised when a mutation would violate the process state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: ProcessStatus,
        to: ProcessStatus,
    },

    #[error("Step '{0}' is still in flight")]
    StepInFlight(String),

    #[error("No step is in flight")]
    NoStepInFlight,

    #[error("No step execution at history index {0}")]
    NoSuchExecution(usize),

    #[error("Step execution at history index {0} is not completed and cannot be compensated")]
    NotCompensable(usize),

    #[error("Operation requires status {expected}, process is {actual}")]
    WrongStatus {
        expected: ProcessStatus,
        actual: ProcessStatus,
    },
}

/// Persisted state of one saga instance.
///
/// The history is append-only: executions are closed in place but never
/// removed or reordered. All mutations go through methods that enforce the
/// status state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub(crate) process_id: ProcessId,
    pub(crate) process_type: String,
    pub(crate) current_step: Option<String>,
    pub(crate) status: ProcessStatus,
    pub(crate) data: Map<String, Value>,
    pub(crate) history: Vec<StepExecution>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl ProcessState {
    /// Creates a new running process with no history.
    pub fn new(
        process_id: ProcessId,
        process_type: impl Into<String>,
        data: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            process_id,
            process_type: process_type.into(),
            current_step: None,
            status: ProcessStatus::Running,
            data,
            history: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn history(&self) -> &[StepExecution] {
        &self.history
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns the step attempt currently awaiting a result, if any.
    pub fn in_flight(&self) -> Option<&StepExecution> {
        self.history.last().filter(|execution| execution.is_pending())
    }

    /// Returns the history index and execution whose compensation is awaiting a result.
    pub fn compensation_in_flight(&self) -> Option<(usize, &StepExecution)> {
        self.history.iter().enumerate().rev().find(|(_, execution)| {
            execution
                .compensation
                .as_ref()
                .is_some_and(|c| c.status == CompensationStatus::Pending)
        })
    }

    /// Returns the names of completed steps in execution order.
    pub fn completed_steps(&self) -> Vec<&str> {
        self.history
            .iter()
            .filter(|execution| execution.status == StepStatus::Completed)
            .map(|execution| execution.step.as_str())
            .collect()
    }

    /// Returns the index of the next completed step to compensate.
    ///
    /// Walks the history from the most recent entry backwards, so repeated
    /// calls yield completed steps in strict reverse order. Pending and
    /// failed executions are never returned.
    pub fn next_compensation_target(&self) -> Option<usize> {
        self.history
            .iter()
            .enumerate()
            .rev()
            .find(|(_, execution)| {
                execution.status == StepStatus::Completed && execution.compensation.is_none()
            })
            .map(|(index, _)| index)
    }

    /// Returns true if any compensation was abandoned after exhausting retries.
    pub fn has_abandoned_compensation(&self) -> bool {
        self.history.iter().any(|execution| {
            execution
                .compensation
                .as_ref()
                .is_some_and(|c| c.status == CompensationStatus::Failed)
        })
    }

    /// Moves the process to `next`, enforcing the status state machine.
    pub fn transition_to(
        &mut self,
        next: ProcessStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Appends a pending execution for `step` and makes it the current step.
    pub fn begin_step(
        &mut self,
        step: impl Into<String>,
        attempt: u32,
        now: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), TransitionError> {
        self.require_status(ProcessStatus::Running)?;
        if let Some(in_flight) = self.in_flight() {
            return Err(TransitionError::StepInFlight(in_flight.step.clone()));
        }

        let step = step.into();
        self.current_step = Some(step.clone());
        self.history.push(StepExecution {
            step,
            attempt,
            status: StepStatus::Pending,
            started_at: now,
            deadline,
            completed_at: None,
            result: Map::new(),
            error: None,
            compensation: None,
            unresolved: false,
        });
        self.updated_at = now;
        Ok(())
    }

    /// Closes the in-flight execution as completed and merges its output into `data`.
    pub fn complete_step(
        &mut self,
        payload: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let execution = self.in_flight_mut()?;
        execution.status = StepStatus::Completed;
        execution.completed_at = Some(now);
        execution.result = payload.clone();

        self.data.extend(payload);
        self.updated_at = now;
        Ok(())
    }

    /// Closes the in-flight execution as failed.
    pub fn fail_step(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let execution = self.in_flight_mut()?;
        execution.status = StepStatus::Failed;
        execution.completed_at = Some(now);
        execution.error = Some(error.into());
        self.updated_at = now;
        Ok(())
    }

    /// Closes the in-flight execution as failed without having heard from the worker.
    pub fn abandon_in_flight(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.fail_step(reason, now)?;
        if let Some(execution) = self.history.last_mut() {
            execution.unresolved = true;
        }
        Ok(())
    }

    /// Flags the failed execution at `index` as closed without a reply.
    pub fn mark_unresolved(&mut self, index: usize) -> Result<(), TransitionError> {
        let execution = self
            .history
            .get_mut(index)
            .filter(|execution| execution.status == StepStatus::Failed)
            .ok_or(TransitionError::NoSuchExecution(index))?;
        execution.unresolved = true;
        Ok(())
    }

    /// Returns the index of the unresolved execution of `step` at `attempt`.
    pub fn unresolved_execution(&self, step: &str, attempt: u32) -> Option<usize> {
        self.history.iter().position(|execution| {
            execution.unresolved
                && execution.status == StepStatus::Failed
                && execution.step == step
                && execution.attempt == attempt
        })
    }

    /// Records that an unresolved execution did take effect.
    ///
    /// The execution becomes completed, its output is merged into `data`,
    /// and it is picked up by the compensation walk like any completed step.
    pub fn settle_late_success(
        &mut self,
        index: usize,
        payload: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let execution = self
            .history
            .get_mut(index)
            .filter(|execution| execution.unresolved && execution.status == StepStatus::Failed)
            .ok_or(TransitionError::NoSuchExecution(index))?;
        execution.status = StepStatus::Completed;
        execution.completed_at = Some(now);
        execution.result = payload.clone();
        execution.error = None;
        execution.unresolved = false;

        self.data.extend(payload);
        self.updated_at = now;
        Ok(())
    }

    /// Moves a compensated or failed process back to compensating.
    ///
    /// Only valid while some completed step has not been compensated yet.
    pub fn reopen_compensation(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !matches!(self.status, ProcessStatus::Compensated | ProcessStatus::Failed)
            || self.next_compensation_target().is_none()
        {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                to: ProcessStatus::Compensating,
            });
        }
        self.status = ProcessStatus::Compensating;
        self.updated_at = now;
        Ok(())
    }

    /// Marks the compensation of the execution at `index` as dispatched.
    ///
    /// Called again for each retry; the attempt counter and deadline are
    /// replaced while the record stays pending.
    pub fn begin_compensation(
        &mut self,
        index: usize,
        action: impl Into<String>,
        attempt: u32,
        now: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), TransitionError> {
        self.require_status(ProcessStatus::Compensating)?;
        let execution = self.compensable_mut(index)?;
        let error = execution
            .compensation
            .as_ref()
            .and_then(|record| record.error.clone());
        execution.compensation = Some(CompensationRecord {
            action: Some(action.into()),
            status: CompensationStatus::Pending,
            attempt,
            dispatched_at: now,
            deadline,
            completed_at: None,
            error,
        });
        self.updated_at = now;
        Ok(())
    }

    /// Records that the step at `index` has no compensating action.
    pub fn skip_compensation(
        &mut self,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.require_status(ProcessStatus::Compensating)?;
        let execution = self.compensable_mut(index)?;
        execution.compensation = Some(CompensationRecord {
            action: None,
            status: CompensationStatus::Completed,
            attempt: 0,
            dispatched_at: now,
            deadline: None,
            completed_at: Some(now),
            error: None,
        });
        self.updated_at = now;
        Ok(())
    }

    /// Closes the pending compensation at `index` as applied.
    pub fn complete_compensation(
        &mut self,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let record = self.pending_compensation_mut(index)?;
        record.status = CompensationStatus::Completed;
        record.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Records a failed compensation attempt, leaving it pending for a retry.
    pub fn record_compensation_error(
        &mut self,
        index: usize,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let record = self.pending_compensation_mut(index)?;
        record.error = Some(error.into());
        self.updated_at = now;
        Ok(())
    }

    /// Gives up on the compensation at `index` after its retries ran out.
    pub fn abandon_compensation(
        &mut self,
        index: usize,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let record = self.pending_compensation_mut(index)?;
        record.status = CompensationStatus::Failed;
        record.completed_at = Some(now);
        record.error = Some(error.into());
        self.updated_at = now;
        Ok(())
    }

    fn require_status(&self, expected: ProcessStatus) -> Result<(), TransitionError> {
        if self.status != expected {
            return Err(TransitionError::WrongStatus {
                expected,
                actual: self.status,
            });
        }
        Ok(())
    }

    fn in_flight_mut(&mut self) -> Result<&mut StepExecution, TransitionError> {
        self.history
            .last_mut()
            .filter(|execution| execution.is_pending())
            .ok_or(TransitionError::NoStepInFlight)
    }

    fn compensable_mut(&mut self, index: usize) -> Result<&mut StepExecution, TransitionError> {
        let execution = self
            .history
            .get_mut(index)
            .ok_or(TransitionError::NoSuchExecution(index))?;
        if execution.status != StepStatus::Completed {
            return Err(TransitionError::NotCompensable(index));
        }
        Ok(execution)
    }

    fn pending_compensation_mut(
        &mut self,
        index: usize,
    ) -> Result<&mut CompensationRecord, TransitionError> {
        self.history
            .get_mut(index)
            .and_then(|execution| execution.compensation.as_mut())
            .filter(|record| record.status == CompensationStatus::Pending)
            .ok_or(TransitionError::NoSuchExecution(index))
    }
}
