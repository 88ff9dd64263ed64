//! Engine runtime: worker pool, relay and recovery tasks.
//!
//! Inbound work (start requests, step results, aborts) goes through a
//! bounded queue consumed by a fixed number of workers. The relay and the
//! recovery sweep run as their own tasks. All of them stop on one shutdown
//! signal.

use std::sync::Arc;

use common::ProcessId;
use futures_util::future::join_all;
use saga_store::{ProcessState, SagaStore};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{Result, SagaError};
use crate::messages::StepResult;
use crate::orchestrator::{Orchestrator, StartRequest, Transition};
use crate::receiver::Delivery;
use crate::relay::{MessagePublisher, OutboxRelay};

type Reply<T> = oneshot::Sender<Result<T>>;

enum Inbound {
    Start {
        request: StartRequest,
        reply: Reply<ProcessState>,
    },
    StepResult {
        result: StepResult,
        reply: Reply<Delivery<Transition>>,
    },
    Abort {
        process_id: ProcessId,
        reason: String,
        reply: Reply<ProcessState>,
    },
}

impl Inbound {
    async fn process<S: SagaStore>(self, orchestrator: &Orchestrator<S>) {
        // A dropped reply means the caller gave up; the work still counts.
        match self {
            Inbound::Start { request, reply } => {
                let _ = reply.send(orchestrator.start(request).await);
            }
            Inbound::StepResult { result, reply } => {
                let _ = reply.send(orchestrator.handle_event(result).await);
            }
            Inbound::Abort {
                process_id,
                reason,
                reply,
            } => {
                let _ = reply.send(orchestrator.abort(&process_id, &reason).await);
            }
        }
    }

    fn reject(self) {
        match self {
            Inbound::Start { reply, .. } | Inbound::Abort { reply, .. } => {
                let _ = reply.send(Err(SagaError::ShuttingDown));
            }
            Inbound::StepResult { reply, .. } => {
                let _ = reply.send(Err(SagaError::ShuttingDown));
            }
        }
    }
}

/// Submits work to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<Inbound>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl EngineHandle {
    /// Starts a saga through the worker pool.
    pub async fn start(&self, request: StartRequest) -> Result<ProcessState> {
        self.call(|reply| Inbound::Start { request, reply }).await
    }

    /// Hands a worker's reply to the worker pool.
    pub async fn submit_result(&self, result: StepResult) -> Result<Delivery<Transition>> {
        self.call(|reply| Inbound::StepResult { result, reply }).await
    }

    pub async fn abort(&self, process_id: ProcessId, reason: impl Into<String>) -> Result<ProcessState> {
        let reason = reason.into();
        self.call(|reply| Inbound::Abort {
            process_id,
            reason,
            reply,
        })
        .await
    }

    /// Signals every engine task to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Inbound) -> Result<T> {
        if self.is_shutting_down() {
            return Err(SagaError::ShuttingDown);
        }
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| SagaError::ShuttingDown)?;
        response.await.map_err(|_| SagaError::ShuttingDown)?
    }
}

/// Join handles of the engine's background tasks.
pub struct EngineTasks {
    handles: Vec<JoinHandle<()>>,
}

impl EngineTasks {
    /// Waits until every task has stopped.
    pub async fn join(self) {
        for outcome in join_all(self.handles).await {
            if let Err(err) = outcome {
                tracing::error!(error = %err, "engine task panicked");
            }
        }
    }
}

/// Starts the worker pool, the outbox relay and the recovery loop.
///
/// Must be called from within a tokio runtime.
pub fn spawn<S, P>(orchestrator: Orchestrator<S>, publisher: P) -> (EngineHandle, EngineTasks)
where
    S: SagaStore,
    P: MessagePublisher + 'static,
{
    let config = orchestrator.config().clone();
    let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
    let (shutdown, _) = watch::channel(false);
    let queue = Arc::new(Mutex::new(receiver));

    let mut handles = Vec::with_capacity(config.workers + 2);
    for worker_id in 0..config.workers.max(1) {
        handles.push(tokio::spawn(run_worker(
            worker_id,
            orchestrator.clone(),
            queue.clone(),
            shutdown.subscribe(),
        )));
    }

    let relay = OutboxRelay::new(orchestrator.store().clone(), publisher, config.relay.clone());
    let relay_shutdown = shutdown.subscribe();
    handles.push(tokio::spawn(async move { relay.run(relay_shutdown).await }));

    let recovery_shutdown = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        orchestrator.run_recovery(recovery_shutdown).await
    }));

    tracing::info!(workers = config.workers.max(1), queue_capacity = config.queue_capacity, "engine started");
    (
        EngineHandle {
            sender,
            shutdown: Arc::new(shutdown),
        },
        EngineTasks { handles },
    )
}

async fn run_worker<S: SagaStore>(
    worker_id: usize,
    orchestrator: Orchestrator<S>,
    queue: Arc<Mutex<mpsc::Receiver<Inbound>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                item = queue.recv() => item,
            }
        };
        let Some(item) = next else {
            break;
        };
        item.process(&orchestrator).await;
    }

    // Close the queue so new submissions fail fast, then answer what is left.
    let mut queue = queue.lock().await;
    queue.close();
    let mut rejected = 0usize;
    while let Ok(item) = queue.try_recv() {
        item.reject();
        rejected += 1;
    }
    tracing::info!(worker_id, rejected, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use saga_store::{InMemorySagaStore, ProcessStatus};
    use serde_json::Map;

    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::{EngineConfig, FailurePolicy};
    use crate::registry::{StepDescriptor, StepRegistry};

    fn orchestrator(workers: usize) -> Orchestrator<InMemorySagaStore> {
        let mut registry = StepRegistry::new();
        registry.register_step(StepDescriptor::new("A")).unwrap();
        registry.define_saga("Test", ["A"]).unwrap();
        let mut config = EngineConfig::new(FailurePolicy::FailClosed);
        config.workers = workers;
        config.relay.poll_interval = Duration::from_millis(10);
        Orchestrator::new(InMemorySagaStore::new(), registry, config)
    }

    #[tokio::test]
    async fn test_requests_flow_through_workers() {
        let (handle, tasks) = spawn(orchestrator(2), InMemoryBroker::new());

        let state = handle
            .start(StartRequest::new("Test", Map::new()).with_id("p-1"))
            .await
            .unwrap();
        assert_eq!(state.status(), ProcessStatus::Running);

        let aborted = handle.abort(ProcessId::from("p-1"), "stop").await.unwrap();
        assert_eq!(aborted.status(), ProcessStatus::Compensated);

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(2), tasks.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_submissions_after_shutdown_are_refused() {
        let (handle, tasks) = spawn(orchestrator(1), InMemoryBroker::new());
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(2), tasks.join())
            .await
            .unwrap();

        let refused = handle.start(StartRequest::new("Test", Map::new())).await;
        assert!(matches!(refused, Err(SagaError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_queued_items_are_answered_on_shutdown() {
        let (sender, receiver) = mpsc::channel(8);
        let (shutdown, _) = watch::channel(false);
        let handle = EngineHandle {
            sender,
            shutdown: Arc::new(shutdown),
        };
        let queue = Arc::new(Mutex::new(receiver));

        // Queue a request before any worker runs, then signal shutdown.
        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.start(StartRequest::new("Test", Map::new())).await }
        });
        while handle.sender.capacity() == 8 {
            tokio::task::yield_now().await;
        }
        let worker_shutdown = handle.shutdown.subscribe();
        handle.shutdown();
        run_worker(0, orchestrator(1), queue, worker_shutdown).await;

        let answer = pending.await.unwrap();
        assert!(matches!(answer, Err(SagaError::ShuttingDown)));
    }
}
