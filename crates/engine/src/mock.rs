//! `MockWork` — a test double for [`TaskWork`].
//!
//! Records every call it receives and produces a programmer-specified
//! outcome, including fail-N-times-then-succeed sequences for retry tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TaskError;
use crate::task::{RunContext, TaskInput, TaskWork};

/// Behaviour injected into [`MockWork`] at construction time.
pub enum MockBehaviour {
    /// Always succeed with the given value.
    ReturnValue(Value),
    /// Fail (retryable) the first `failures` calls, then succeed.
    FailTimes { failures: u32, then: Value },
    /// Always fail with a retryable error.
    AlwaysRetryable(String),
    /// Always fail with a fatal error.
    AlwaysFatal(String),
    /// Sleep, then succeed with the given value.
    Sleep { delay: Duration, then: Value },
}

/// A mock unit of work recording every call.
pub struct MockWork {
    behaviour: MockBehaviour,
    calls: Mutex<Vec<TaskInput>>,
}

impl MockWork {
    pub fn new(behaviour: MockBehaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn returning(value: Value) -> Arc<Self> {
        Self::new(MockBehaviour::ReturnValue(value))
    }

    pub fn failing_times(failures: u32, then: Value) -> Arc<Self> {
        Self::new(MockBehaviour::FailTimes { failures, then })
    }

    pub fn failing_retryable(message: impl Into<String>) -> Arc<Self> {
        Self::new(MockBehaviour::AlwaysRetryable(message.into()))
    }

    pub fn failing_fatal(message: impl Into<String>) -> Arc<Self> {
        Self::new(MockBehaviour::AlwaysFatal(message.into()))
    }

    pub fn sleeping(delay: Duration, then: Value) -> Arc<Self> {
        Self::new(MockBehaviour::Sleep { delay, then })
    }

    /// Number of times this work has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// All inputs seen, in call order.
    pub fn calls(&self) -> Vec<TaskInput> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskWork for MockWork {
    async fn run(&self, input: TaskInput, _ctx: &RunContext) -> Result<Value, TaskError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(input);
            calls.len() as u32
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(value) => Ok(value.clone()),
            MockBehaviour::FailTimes { failures, then } => {
                if call_number <= *failures {
                    Err(TaskError::Retryable(format!(
                        "induced failure {call_number} of {failures}"
                    )))
                } else {
                    Ok(then.clone())
                }
            }
            MockBehaviour::AlwaysRetryable(message) => {
                Err(TaskError::Retryable(message.clone()))
            }
            MockBehaviour::AlwaysFatal(message) => Err(TaskError::Fatal(message.clone())),
            MockBehaviour::Sleep { delay, then } => {
                tokio::time::sleep(*delay).await;
                Ok(then.clone())
            }
        }
    }
}
