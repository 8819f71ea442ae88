//! Observer boundary toward the persistence collaborator.
//!
//! The engine emits every state transition as a discrete event.  Observers
//! are fire-and-forget: the engine does not depend on them to execute
//! correctly and an observer must not fail the run.

use uuid::Uuid;

use crate::state::State;

/// One task-run state transition.
#[derive(Debug)]
pub struct TaskRunUpdate<'a> {
    pub flow_run_id: Uuid,
    pub flow: &'a str,
    pub task: &'a str,
    pub map_index: Option<usize>,
    pub attempt: u32,
    pub state: &'a State,
}

/// One flow-run state transition.
#[derive(Debug)]
pub struct FlowRunUpdate<'a> {
    pub flow_run_id: Uuid,
    pub flow: &'a str,
    pub state: &'a State,
}

/// Receives run-state transitions as they happen.
pub trait RunObserver: Send + Sync {
    fn on_task_update(&self, _update: &TaskRunUpdate<'_>) {}
    fn on_flow_update(&self, _update: &FlowRunUpdate<'_>) {}
}

/// Discards every event.
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Logs every event through `tracing`.
pub struct LogObserver;

impl RunObserver for LogObserver {
    fn on_task_update(&self, update: &TaskRunUpdate<'_>) {
        tracing::info!(
            flow_run_id = %update.flow_run_id,
            flow = update.flow,
            task = update.task,
            map_index = ?update.map_index,
            attempt = update.attempt,
            kind = ?update.state.kind,
            message = update.state.message.as_deref().unwrap_or(""),
            "task state transition"
        );
    }

    fn on_flow_update(&self, update: &FlowRunUpdate<'_>) {
        tracing::info!(
            flow_run_id = %update.flow_run_id,
            flow = update.flow,
            kind = ?update.state.kind,
            "flow state transition"
        );
    }
}
