//! Engine-level error types.

use thiserror::Error;

/// Errors raised while constructing or validating a flow graph.
///
/// All of these are fatal to a run before any task executes.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Two tasks share the same name within one flow.
    #[error("duplicate task name: '{0}'")]
    DuplicateTask(String),

    /// An edge references a task name that doesn't exist in the flow.
    #[error("edge references unknown task '{name}' ({side} side)")]
    UnknownTask {
        name: String,
        side: &'static str,
    },

    /// The edge set contains a path from a task back to itself.
    #[error("flow graph contains a cycle")]
    CyclicGraph,

    /// An edge endpoint no longer resolves to a task in the flow.
    #[error("dangling edge '{upstream}' -> '{downstream}'")]
    DanglingEdge {
        upstream: String,
        downstream: String,
    },
}

/// Errors surfaced by [`Engine::run`](crate::Engine::run).
///
/// Task execution failures are *not* represented here: they are recorded as
/// terminal task-run states and flow only as data into downstream triggers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The flow failed validation before any task was dispatched.
    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// Errors returned by a task's work callable.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable` — counts against the task's retry budget.
/// - `Fatal`     — the task-run is marked failed immediately, budget unused.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("retryable task error: {0}")]
    Retryable(String),

    #[error("fatal task error: {0}")]
    Fatal(String),
}

/// A trigger itself failed to evaluate.
///
/// Trigger logic is assumed deterministic, so this is treated as a bug: the
/// task-run is recorded `Failed` and never retried.
#[derive(Debug, Error, Clone)]
#[error("trigger evaluation failed: {0}")]
pub struct TriggerError(pub String);

/// Errors raised while constructing a schedule.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        expression: String,
        reason: String,
    },

    #[error("schedule interval must be at least one millisecond")]
    IntervalTooShort,
}
