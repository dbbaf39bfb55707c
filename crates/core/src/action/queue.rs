//! Ordered hand-off from decision logic to action execution.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{ActionAtom, ActionBody, ActionNode};
use crate::error::{ExecutionError, QueueClosed};
use crate::types::Event;

/// Who produced a queued action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A strategy fired on a scene event.
    Strategy { strategy_id: String },
    /// A strategy was activated after an LLM decision on a conversational turn.
    Activation { strategy_id: String },
    /// A blueprint walker reached an action node.
    Blueprint { bp_id: String, instance_id: uuid::Uuid },
}

#[derive(Debug, Clone)]
pub struct QueuedAction {
    pub node: ActionNode,
    pub event: Event,
    pub origin: Origin,
}

/// Outcome of one queued action, reported back by the consumer.
#[derive(Debug, Clone)]
pub struct ActionReport {
    pub origin: Origin,
    pub node_id: String,
    pub result: Result<Map<String, Value>, ExecutionError>,
}

/// Producer side of the action queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ActionQueue {
    tx: mpsc::Sender<QueuedAction>,
}

impl ActionQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<QueuedAction>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Waits only for queue capacity, never for execution.
    pub async fn enqueue(&self, action: QueuedAction) -> Result<(), QueueClosed> {
        tracing::debug!(node_id = %action.node.node_id, origin = ?action.origin, "action enqueued");
        self.tx.send(action).await.map_err(|_| QueueClosed)
    }
}

/// Runs one atom. What "running" means is up to the implementation.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute_atom(&self, atom: &ActionAtom, event: &Event) -> Result<Map<String, Value>, ExecutionError>;
}

/// Execute a node to completion. Programs run frontier by frontier; atoms
/// in the same frontier run concurrently. The first failing atom stops the
/// program.
pub async fn run_action(
    node: ActionNode,
    event: Event,
    executor: Arc<dyn ActionExecutor>,
) -> Result<Map<String, Value>, ExecutionError> {
    match node.body {
        ActionBody::Atomic(atom) => executor.execute_atom(&atom, &event).await,
        ActionBody::Program(mut program) => {
            let event = Arc::new(event);
            loop {
                let frontier = program.ready_to_execute();
                if frontier.is_empty() {
                    break;
                }
                let mut tasks = JoinSet::new();
                for atom in frontier {
                    let executor = executor.clone();
                    let event = event.clone();
                    tasks.spawn(async move {
                        let result = executor.execute_atom(&atom, &event).await;
                        (atom.atom_id, result)
                    });
                }
                while let Some(joined) = tasks.join_next().await {
                    let (atom_id, result) = joined.map_err(|e| ExecutionError {
                        atom: program.program_id.clone(),
                        reason: e.to_string(),
                    })?;
                    program.complete(&atom_id, result?);
                }
            }
            if !program.is_finished() {
                tracing::warn!(program_id = %program.program_id, "program drained with atoms never scheduled");
            }
            Ok(program.results())
        }
    }
}

/// Drain the queue until cancelled or every producer is gone. Actions run
/// one at a time, in queue order. Reports go to `reports` when given.
pub fn spawn_consumer(
    mut receiver: mpsc::Receiver<QueuedAction>,
    executor: Arc<dyn ActionExecutor>,
    reports: Option<mpsc::Sender<ActionReport>>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let action = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("action consumer shutting down");
                    return;
                }
                next = receiver.recv() => match next {
                    Some(action) => action,
                    None => return,
                },
            };

            let node_id = action.node.node_id.clone();
            let origin = action.origin.clone();
            let result = run_action(action.node, action.event, executor.clone()).await;
            if let Err(e) = &result {
                tracing::warn!(node_id = %node_id, error = %e, "action execution failed");
            }
            if let Some(reports) = &reports
                && reports.send(ActionReport { origin, node_id, result }).await.is_err()
            {
                tracing::debug!("action report receiver dropped");
            }
        }
    })
}
