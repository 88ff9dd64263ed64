//! Worker-side step execution.
//!
//! Step implementations live outside the engine. They receive
//! [`StepCommand`]s from the broker and reply with [`StepResult`]s; the
//! [`ExecutorHost`] does the translation so an implementation only deals
//! with its own inputs and outputs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common::ProcessId;
use serde_json::{Map, Value};

use crate::messages::{CommandKind, StepCommand, StepFailure, StepResult};

/// A set of step actions and their compensations.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs `action`, returning the fields to merge into the saga data.
    async fn execute(
        &self,
        process_id: &ProcessId,
        action: &str,
        data: &Map<String, Value>,
    ) -> Result<Map<String, Value>, StepFailure>;

    /// Undoes a completed step. Must be idempotent: undoing twice is a no-op.
    async fn compensate(
        &self,
        process_id: &ProcessId,
        action: &str,
        data: &Map<String, Value>,
    ) -> Result<(), StepFailure>;
}

/// Turns commands into results using a [`StepExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorHost<E> {
    executor: E,
}

impl<E: StepExecutor> ExecutorHost<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    #[tracing::instrument(
        skip(self, command),
        fields(process_id = %command.process_id, action = %command.action, attempt = command.attempt)
    )]
    pub async fn handle(&self, command: &StepCommand) -> StepResult {
        let outcome = match command.kind {
            CommandKind::Execute => self
                .executor
                .execute(&command.process_id, &command.action, &command.data)
                .await,
            CommandKind::Compensate => self
                .executor
                .compensate(&command.process_id, &command.action, &command.data)
                .await
                .map(|()| Map::new()),
        };

        match outcome {
            Ok(payload) => StepResult::success(command, payload),
            Err(failure) => {
                tracing::debug!(%failure, "action failed");
                StepResult::failure(command, failure)
            }
        }
    }
}

/// One call made to a [`ScriptedExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub process_id: ProcessId,
    pub action: String,
    pub kind: CommandKind,
}

#[derive(Debug, Default)]
struct Script {
    outputs: HashMap<String, Map<String, Value>>,
    permanent_failures: HashMap<String, String>,
    /// Remaining transient failures per action.
    transient_failures: HashMap<String, u32>,
    /// Remaining failures per compensating action.
    compensation_failures: HashMap<String, u32>,
    invocations: Vec<Invocation>,
}

/// Executor whose behavior is scripted per action.
///
/// Actions without a script succeed with an empty payload.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<Script>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the payload `action` returns on success.
    pub fn set_output(&self, action: &str, payload: Map<String, Value>) {
        self.script().outputs.insert(action.to_string(), payload);
    }

    /// Makes every execution of `action` fail permanently.
    pub fn set_fail_permanently(&self, action: &str, message: &str) {
        self.script()
            .permanent_failures
            .insert(action.to_string(), message.to_string());
    }

    /// Makes the next `count` executions of `action` fail transiently.
    pub fn set_transient_failures(&self, action: &str, count: u32) {
        self.script()
            .transient_failures
            .insert(action.to_string(), count);
    }

    /// Makes the next `count` runs of compensating `action` fail.
    pub fn set_compensation_failures(&self, action: &str, count: u32) {
        self.script()
            .compensation_failures
            .insert(action.to_string(), count);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.script().invocations.clone()
    }

    pub fn invocation_count(&self, action: &str, kind: CommandKind) -> usize {
        self.script()
            .invocations
            .iter()
            .filter(|invocation| invocation.action == action && invocation.kind == kind)
            .count()
    }

    fn log(script: &mut Script, process_id: &ProcessId, action: &str, kind: CommandKind) {
        script.invocations.push(Invocation {
            process_id: process_id.clone(),
            action: action.to_string(),
            kind,
        });
    }

    fn take_failure(counts: &mut HashMap<String, u32>, action: &str) -> bool {
        match counts.get_mut(action) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        process_id: &ProcessId,
        action: &str,
        _data: &Map<String, Value>,
    ) -> Result<Map<String, Value>, StepFailure> {
        let mut script = self.script();
        Self::log(&mut script, process_id, action, CommandKind::Execute);

        if let Some(message) = script.permanent_failures.get(action) {
            return Err(StepFailure::permanent(message.clone()));
        }
        if Self::take_failure(&mut script.transient_failures, action) {
            return Err(StepFailure::transient(format!("{action} temporarily unavailable")));
        }
        Ok(script.outputs.get(action).cloned().unwrap_or_default())
    }

    async fn compensate(
        &self,
        process_id: &ProcessId,
        action: &str,
        _data: &Map<String, Value>,
    ) -> Result<(), StepFailure> {
        let mut script = self.script();
        Self::log(&mut script, process_id, action, CommandKind::Compensate);

        if Self::take_failure(&mut script.compensation_failures, action) {
            return Err(StepFailure::transient(format!("{action} failed")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::messages::{RESULT_TOPIC, StepOutcome};

    fn command(action: &str, kind: CommandKind) -> StepCommand {
        StepCommand {
            process_id: ProcessId::from("p-1"),
            process_type: "Test".to_string(),
            step_name: "Step".to_string(),
            action: action.to_string(),
            kind,
            attempt: 1,
            data: Map::new(),
            reply_to: RESULT_TOPIC.to_string(),
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_host_replies_with_scripted_output() {
        let executor = ScriptedExecutor::new();
        let mut payload = Map::new();
        payload.insert("reservation_id".to_string(), json!("r-1"));
        executor.set_output("Reserve", payload.clone());
        let host = ExecutorHost::new(executor.clone());

        let result = host.handle(&command("Reserve", CommandKind::Execute)).await;
        assert_eq!(result.outcome, StepOutcome::Success { payload });
        assert_eq!(result.step_name, "Step");
        assert_eq!(executor.invocation_count("Reserve", CommandKind::Execute), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_run_out() {
        let executor = ScriptedExecutor::new();
        executor.set_transient_failures("Charge", 2);
        let host = ExecutorHost::new(executor.clone());
        let command = command("Charge", CommandKind::Execute);

        assert!(!host.handle(&command).await.is_success());
        assert!(!host.handle(&command).await.is_success());
        assert!(host.handle(&command).await.is_success());
    }

    #[tokio::test]
    async fn test_permanent_failure_and_compensation_failures() {
        let executor = ScriptedExecutor::new();
        executor.set_fail_permanently("Ship", "no carrier");
        executor.set_compensation_failures("Release", 1);
        let host = ExecutorHost::new(executor.clone());

        let shipped = host.handle(&command("Ship", CommandKind::Execute)).await;
        assert!(matches!(
            shipped.outcome,
            StepOutcome::Failure { ref error } if !error.is_transient() && error.message == "no carrier"
        ));

        let release = command("Release", CommandKind::Compensate);
        assert!(!host.handle(&release).await.is_success());
        assert!(host.handle(&release).await.is_success());
        assert_eq!(executor.invocation_count("Release", CommandKind::Compensate), 2);
    }
}
