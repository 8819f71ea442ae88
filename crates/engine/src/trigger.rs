//! Triggers — predicates over upstream states deciding run eligibility.
//!
//! A trigger sees the terminal states of every upstream task and answers one
//! question: may this task run?  Evaluation is pure and synchronous; a `false`
//! answer records a `TriggerFailed` state for the task-run.  `TriggerFailed`
//! upstream states stay distinguishable from `Failed` ones so downstream
//! triggers can treat a disqualified ancestor differently from a genuinely
//! failed one.

use crate::error::TriggerError;
use crate::state::{State, StateKind};

/// The trigger evaluation contract.
///
/// An empty upstream slice means "no dependencies" and must evaluate to
/// `true` — every built-in honours that.  Built-ins never return `Err`; a
/// user-supplied trigger that does is recorded as a failed task-run and never
/// retried.
pub trait Trigger: Send + Sync {
    fn evaluate(&self, upstream: &[State]) -> Result<bool, TriggerError>;

    /// Short name used in log messages and state messages.
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// True iff every upstream state is `Success`.  The default trigger; both
/// `Failed` and `TriggerFailed` ancestors disqualify.
pub struct AllSuccessful;

impl Trigger for AllSuccessful {
    fn evaluate(&self, upstream: &[State]) -> Result<bool, TriggerError> {
        Ok(upstream.iter().all(State::is_successful))
    }

    fn name(&self) -> &'static str {
        "all_successful"
    }
}

/// True iff every upstream state is terminal, regardless of outcome.
pub struct AllFinished;

impl Trigger for AllFinished {
    fn evaluate(&self, upstream: &[State]) -> Result<bool, TriggerError> {
        Ok(upstream.iter().all(State::is_terminal))
    }

    fn name(&self) -> &'static str {
        "all_finished"
    }
}

/// True iff at least one upstream state is `Success` (vacuously true with no
/// upstream dependencies).
pub struct AnySuccessful;

impl Trigger for AnySuccessful {
    fn evaluate(&self, upstream: &[State]) -> Result<bool, TriggerError> {
        Ok(upstream.is_empty() || upstream.iter().any(State::is_successful))
    }

    fn name(&self) -> &'static str {
        "any_successful"
    }
}

/// Always false: the task only runs through an external override.
pub struct ManualOnly;

impl Trigger for ManualOnly {
    fn evaluate(&self, _upstream: &[State]) -> Result<bool, TriggerError> {
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "manual_only"
    }
}
