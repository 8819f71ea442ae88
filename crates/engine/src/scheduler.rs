//! The scheduler loop — glue between [`Schedule`]s and the [`Engine`].
//!
//! Polls a schedule for the next run time, sleeps until it arrives, and
//! initiates a flow run.  Runs execute one at a time; a fire time that passes
//! while a run is still executing fires immediately afterwards.  The loop
//! stops when the schedule is exhausted or the stop signal is raised.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::engine::{Engine, StopSignal};
use crate::error::EngineError;
use crate::flow::Flow;
use crate::schedule::Schedule;

pub struct Scheduler {
    engine: Arc<Engine>,
    stop: StopSignal,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            stop: StopSignal::new(),
        }
    }

    /// Handle for stopping the loop (between runs; an in-flight run is
    /// allowed to finish).
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Drive `flow` according to `schedule` until exhaustion or stop.
    ///
    /// # Errors
    /// Propagates flow validation failures from the first initiated run.
    pub async fn run(
        &self,
        flow: &Flow,
        schedule: &dyn Schedule,
        parameters: Map<String, Value>,
    ) -> Result<(), EngineError> {
        loop {
            if self.stop.is_raised() {
                info!(flow = flow.name(), "scheduler stop requested");
                return Ok(());
            }

            let Some(next) = schedule.next_runs(Utc::now(), 1).into_iter().next() else {
                info!(flow = flow.name(), "schedule exhausted");
                return Ok(());
            };

            info!(flow = flow.name(), run_at = %next, "next scheduled run");
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.stop.wait() => continue,
            }

            let run = self.engine.run(flow, parameters.clone()).await?;
            if run.state.is_successful() {
                info!(flow = flow.name(), run_id = %run.id, "scheduled run succeeded");
            } else {
                warn!(
                    flow = flow.name(),
                    run_id = %run.id,
                    kind = ?run.state.kind,
                    "scheduled run did not succeed"
                );
            }
        }
    }
}
