//! `engine` crate — the flow DAG model and the execution engine.
//!
//! Users declare a [`Flow`]: named [`Task`]s wired together by [`Edge`]s,
//! each task carrying retry/timeout/trigger metadata and an optional mapped
//! flag.  The [`Engine`] executes one run of that graph with bounded
//! concurrency: triggers gate each task on its upstream [`State`]s, failures
//! are retried per task policy, and mapped tasks fan out into one child run
//! per upstream element.  [`Schedule`]s generate future run times for the
//! [`scheduler`] loop.

pub mod edge;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod flow;
pub mod mock;
pub mod schedule;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod trigger;

pub use edge::Edge;
pub use engine::{Engine, EngineConfig, FlowRun, StopSignal, TaskRun};
pub use error::{EngineError, FlowError, ScheduleError, TaskError, TriggerError};
pub use events::{FlowRunUpdate, LogObserver, NoopObserver, RunObserver, TaskRunUpdate};
pub use executor::{AttemptOutcome, LocalExecutor, TaskCall, TaskExecutor};
pub use flow::Flow;
pub use schedule::{CronSchedule, IntervalSchedule, OneShotSchedule, Schedule};
pub use scheduler::Scheduler;
pub use state::{State, StateKind};
pub use task::{FnWork, NoopWork, RetryPolicy, RunContext, Task, TaskInput, TaskWork};
pub use trigger::{AllFinished, AllSuccessful, AnySuccessful, ManualOnly, Trigger};

#[cfg(test)]
mod engine_tests;
