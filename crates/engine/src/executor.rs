//! The pluggable execution backend.
//!
//! The engine's control loop is executor-agnostic: it hands an assembled
//! [`TaskCall`] to a [`TaskExecutor`] and receives an [`AttemptOutcome`]
//! asynchronously.  The only contract is bounded in-flight concurrency and a
//! per-attempt timeout; a thread pool, a process pool or a cluster of workers
//! are all valid implementations behind this trait.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::TaskError;
use crate::task::{RunContext, TaskInput, TaskWork};

/// One assembled attempt, ready to execute.
pub struct TaskCall {
    pub flow_run_id: Uuid,
    pub task: String,
    pub map_index: Option<usize>,
    pub attempt: u32,
    pub work: Arc<dyn TaskWork>,
    pub input: TaskInput,
    pub ctx: RunContext,
    pub timeout: Option<Duration>,
}

/// How one attempt concluded.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success(Value),
    Failed { message: String, fatal: bool },
    TimedOut,
}

/// The execution backend contract: accept a call plus timeout, report the
/// outcome, and never exceed the configured in-flight concurrency
/// (mapped-task children share the same bound).
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn submit(&self, call: TaskCall) -> AttemptOutcome;
}

/// In-process executor bounded by a tokio semaphore.
///
/// Timeout expiry drops the attempt's future — best-effort cancellation; the
/// executor stops waiting and reports `TimedOut`.
pub struct LocalExecutor {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    in_flight: AtomicUsize,
}

impl LocalExecutor {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
            max_in_flight: max_in_flight.max(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Approximate number of attempts currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TaskExecutor for LocalExecutor {
    async fn submit(&self, call: TaskCall) -> AttemptOutcome {
        let permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            // We never close the semaphore; report rather than panic.
            Err(_) => {
                return AttemptOutcome::Failed {
                    message: "executor shut down".to_owned(),
                    fatal: true,
                }
            }
        };
        self.in_flight.fetch_add(1, Ordering::Relaxed);

        let work = call.work.run(call.input, &call.ctx);
        let outcome = match call.timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => outcome_of(result),
                Err(_) => AttemptOutcome::TimedOut,
            },
            None => outcome_of(work.await),
        };

        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        drop(permit);
        outcome
    }
}

fn outcome_of(result: Result<Value, TaskError>) -> AttemptOutcome {
    match result {
        Ok(value) => AttemptOutcome::Success(value),
        Err(TaskError::Retryable(message)) => AttemptOutcome::Failed {
            message,
            fatal: false,
        },
        Err(TaskError::Fatal(message)) => AttemptOutcome::Failed {
            message,
            fatal: true,
        },
    }
}
