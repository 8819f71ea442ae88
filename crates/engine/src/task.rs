//! Tasks — the nodes of a flow graph.
//!
//! A [`Task`] bundles a unit of user-supplied work (anything implementing
//! [`TaskWork`]) with its execution metadata: retry policy, timeout, trigger
//! and mapped flag.  Tasks are built once, handed to a
//! [`Flow`](crate::Flow), and never mutated afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::TaskError;
use crate::trigger::{AllSuccessful, Trigger};

// ---------------------------------------------------------------------------
// Work trait
// ---------------------------------------------------------------------------

/// Shared context passed to every task attempt within one flow run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// ID of the current flow run.
    pub flow_run_id: Uuid,
    /// Name of the flow being executed.
    pub flow_name: String,
    /// Parameters supplied when the run was initiated.
    pub parameters: Map<String, Value>,
}

/// Inputs assembled for one task attempt.
#[derive(Debug, Clone, Default)]
pub struct TaskInput {
    /// Flow-run parameters (same for every task in the run).
    pub parameters: Map<String, Value>,
    /// Upstream results, keyed by the incoming edges' `key` fields.
    pub upstream: HashMap<String, Value>,
    /// For mapped children: the element this child runs over.
    pub element: Option<Value>,
    /// For mapped children: position of `element` in the upstream collection.
    pub map_index: Option<usize>,
}

/// The contract every unit of work must fulfil.
///
/// The engine dispatches attempts through this trait object; implementations
/// must be safe to call multiple times since failed attempts are retried.
#[async_trait]
pub trait TaskWork: Send + Sync {
    async fn run(&self, input: TaskInput, ctx: &RunContext) -> Result<Value, TaskError>;
}

/// Adapter turning a plain closure into [`TaskWork`].
pub struct FnWork<F> {
    f: F,
}

impl<F> FnWork<F>
where
    F: Fn(TaskInput) -> Result<Value, TaskError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> TaskWork for FnWork<F>
where
    F: Fn(TaskInput) -> Result<Value, TaskError> + Send + Sync,
{
    async fn run(&self, input: TaskInput, _ctx: &RunContext) -> Result<Value, TaskError> {
        (self.f)(input)
    }
}

/// Work that does nothing and returns `null`.
///
/// Useful for control-only tasks and for structural validation of flow
/// definitions whose real work lives elsewhere.
pub struct NoopWork;

#[async_trait]
impl TaskWork for NoopWork {
    async fn run(&self, _input: TaskInput, _ctx: &RunContext) -> Result<Value, TaskError> {
        Ok(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// How failed attempts are retried.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt; `max_retries = N` allows at
    /// most `N + 1` attempts.
    pub max_retries: u32,
    /// Delay between attempts.  `None` falls back to the engine's configured
    /// default retry delay.
    pub retry_delay: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A declared unit of work with retry/timeout/trigger metadata.
pub struct Task {
    name: String,
    work: Arc<dyn TaskWork>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    trigger: Arc<dyn Trigger>,
    is_mapped: bool,
}

impl Task {
    /// Create a task with default metadata: no retries, no timeout, the
    /// `all_successful` trigger, not mapped.
    pub fn new(name: impl Into<String>, work: Arc<dyn TaskWork>) -> Self {
        Self {
            name: name.into(),
            work,
            retry: RetryPolicy::default(),
            timeout: None,
            trigger: Arc::new(AllSuccessful),
            is_mapped: false,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry.retry_delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn Trigger>) -> Self {
        self.trigger = trigger;
        self
    }

    /// Mark the task as fanning out over its mapped incoming edge.
    pub fn mapped(mut self) -> Self {
        self.is_mapped = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn work(&self) -> &Arc<dyn TaskWork> {
        &self.work
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn trigger(&self) -> &Arc<dyn Trigger> {
        &self.trigger
    }

    pub fn is_mapped(&self) -> bool {
        self.is_mapped
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("trigger", &self.trigger.name())
            .field("is_mapped", &self.is_mapped)
            .finish_non_exhaustive()
    }
}
