//! Run states.
//!
//! A [`State`] is an immutable snapshot of one task-run or flow-run outcome:
//! a kind tag, an opaque JSON payload (result or error data), a free-form
//! message, and the moment it was produced.  The engine never mutates a
//! terminal state in place; every new attempt produces a new value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The lifecycle tag of a [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// Created but not yet eligible to run.
    Pending,
    /// Queued for a future run time.
    Scheduled,
    /// An attempt is in flight.
    Running,
    /// The attempt concluded with a result.
    Success,
    /// All attempts concluded; the last one raised.
    Failed,
    /// Waiting out a retry delay before the next attempt.
    Retrying,
    /// Never dispatched (e.g. engine stop requested).
    Skipped,
    /// The task's trigger disqualified it from running.
    TriggerFailed,
    /// The attempt exceeded its timeout after exhausting retries.
    TimedOut,
    /// Carries a previously computed result that may stand in for a run.
    Cached,
}

impl StateKind {
    /// Terminal kinds never transition again within a run.
    ///
    /// `Retrying` and `Scheduled` always transition further; `Cached` is a
    /// non-terminal result carrier.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StateKind::Success
                | StateKind::Failed
                | StateKind::Skipped
                | StateKind::TriggerFailed
                | StateKind::TimedOut
        )
    }
}

/// One immutable status value for a task-run or flow-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub kind: StateKind,
    /// Result value (on success) or error payload; opaque to the engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl State {
    fn new(kind: StateKind, result: Option<Value>, message: Option<String>) -> Self {
        Self {
            kind,
            result,
            message,
            timestamp: Utc::now(),
        }
    }

    pub fn pending() -> Self {
        Self::new(StateKind::Pending, None, None)
    }

    /// A run slotted for `at` by a schedule.
    pub fn scheduled(at: DateTime<Utc>) -> Self {
        Self::new(
            StateKind::Scheduled,
            None,
            Some(format!("scheduled for {at}")),
        )
    }

    pub fn running() -> Self {
        Self::new(StateKind::Running, None, None)
    }

    pub fn success(result: Value) -> Self {
        Self::new(StateKind::Success, Some(result), None)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(StateKind::Failed, None, Some(message.into()))
    }

    pub fn retrying(message: impl Into<String>) -> Self {
        Self::new(StateKind::Retrying, None, Some(message.into()))
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::new(StateKind::Skipped, None, Some(message.into()))
    }

    pub fn trigger_failed(message: impl Into<String>) -> Self {
        Self::new(StateKind::TriggerFailed, None, Some(message.into()))
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(StateKind::TimedOut, None, Some(message.into()))
    }

    pub fn cached(result: Value) -> Self {
        Self::new(StateKind::Cached, Some(result), None)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    pub fn is_successful(&self) -> bool {
        self.kind == StateKind::Success
    }
}
