//! The execution engine.
//!
//! [`Engine::run`] walks one flow's DAG: it validates the graph, tracks a
//! per-task readiness count, evaluates triggers against settled upstream
//! states, dispatches runnable work to the pluggable executor, applies
//! retry/timeout policy, and expands/reduces mapped tasks.
//!
//! Concurrency model: the control loop below is the *only* writer of run
//! bookkeeping.  Attempts execute on the executor and report back over an
//! mpsc channel; retry delays are timers that post back to the same channel.
//! Those two signals are the loop's only suspension points — trigger
//! evaluation and readiness recomputation are synchronous.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Notify};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{FlowRunUpdate, NoopObserver, RunObserver, TaskRunUpdate};
use crate::executor::{AttemptOutcome, LocalExecutor, TaskCall, TaskExecutor};
use crate::flow::Flow;
use crate::state::State;
use crate::task::{RunContext, TaskInput};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the engine, normally filled in from the settings
/// collaborator by the process entry point.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum in-flight attempts, shared across mapped children.
    pub max_concurrency: usize,
    /// Retry delay for tasks that don't set their own.
    pub default_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            default_retry_delay: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Cooperative stop
// ---------------------------------------------------------------------------

/// Cooperative "stop accepting new dispatches" signal.
///
/// Raising it never interrupts in-flight attempts; tasks that have not been
/// dispatched yet are recorded `Skipped` and pending retries are abandoned
/// as `Failed`.
#[derive(Clone)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            raised: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Resolve once the signal has been raised.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

/// The runtime record of one task's execution within a flow run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub task: String,
    /// Position within the mapped fan-out, for child runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_index: Option<usize>,
    /// Number of attempts dispatched so far (0 if never dispatched).
    pub attempts: u32,
    pub state: State,
    /// Child runs of a mapped task, in element order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskRun>,
}

impl TaskRun {
    fn new(task: String, map_index: Option<usize>) -> Self {
        Self {
            task,
            map_index,
            attempts: 0,
            state: State::pending(),
            children: Vec::new(),
        }
    }
}

/// The runtime record of one entire flow run.
#[derive(Debug, Clone, Serialize)]
pub struct FlowRun {
    pub id: Uuid,
    pub flow_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: State,
    pub task_runs: BTreeMap<String, TaskRun>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Executes flow runs against a pluggable executor.
///
/// One engine may run many flows; each call to [`Engine::run`] owns its run
/// bookkeeping exclusively, so concurrent runs of the same flow only share
/// the read-only flow structure and the executor's concurrency bound.
pub struct Engine {
    executor: Arc<dyn TaskExecutor>,
    observer: Arc<dyn RunObserver>,
    config: EngineConfig,
    stop: StopSignal,
}

impl Engine {
    /// Engine with the in-process [`LocalExecutor`] sized from the config.
    pub fn new(config: EngineConfig) -> Self {
        let executor = Arc::new(LocalExecutor::new(config.max_concurrency));
        Self::with_executor(config, executor)
    }

    /// Engine over a caller-supplied execution backend.
    pub fn with_executor(config: EngineConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            executor,
            observer: Arc::new(NoopObserver),
            config,
            stop: StopSignal::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Handle for requesting a cooperative stop.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Execute one run of `flow`.
    ///
    /// # Errors
    /// Returns [`EngineError`] only for flow validation failures; task
    /// execution failures are recorded as terminal task-run states inside
    /// the returned [`FlowRun`].
    #[instrument(skip_all, fields(flow = %flow.name()))]
    pub async fn run(
        &self,
        flow: &Flow,
        parameters: Map<String, Value>,
    ) -> Result<FlowRun, EngineError> {
        // Fail fast before any task executes.
        let order = flow.validate()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, tasks = order.len(), "flow validated, starting run");

        let ctx = RunContext {
            flow_run_id: run_id,
            flow_name: flow.name().to_owned(),
            parameters,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = Runner::new(self, flow, ctx, tx);
        runner.emit_flow(&State::running());

        // Tasks with no upstream edges are ready immediately.
        for name in &order {
            if runner.remaining[name.as_str()] == 0 {
                runner.ready.push_back(name.clone());
            }
        }

        loop {
            runner.drain_ready();
            if runner.open == 0 {
                break;
            }
            // Sole suspension point: attempt completions and retry timers.
            let Some(msg) = rx.recv().await else { break };
            runner.handle(msg);
        }

        let state = runner.final_state();
        runner.emit_flow(&state);
        info!(%run_id, kind = ?state.kind, "flow run finished");

        Ok(FlowRun {
            id: run_id,
            flow_name: flow.name().to_owned(),
            started_at,
            finished_at: Utc::now(),
            state,
            task_runs: runner.runs,
        })
    }
}

// ---------------------------------------------------------------------------
// Per-run control loop state
// ---------------------------------------------------------------------------

/// Messages posted back to the control loop.
enum Msg {
    /// An executor attempt concluded.
    Attempt {
        task: String,
        map_index: Option<usize>,
        attempt: u32,
        outcome: AttemptOutcome,
    },
    /// A retry delay elapsed; dispatch the next attempt.
    Redispatch {
        task: String,
        map_index: Option<usize>,
        attempt: u32,
    },
}

/// All mutable bookkeeping for one flow run; owned by the control loop.
struct Runner<'e> {
    engine: &'e Engine,
    flow: &'e Flow,
    ctx: RunContext,
    runs: BTreeMap<String, TaskRun>,
    /// Results of successful (top-level) task runs, by task name.
    results: HashMap<String, Value>,
    /// Per task: distinct upstream tasks not yet terminal.
    remaining: HashMap<String, usize>,
    /// Top-level task runs not yet terminal.
    open: usize,
    ready: VecDeque<String>,
    tx: mpsc::UnboundedSender<Msg>,
}

impl<'e> Runner<'e> {
    fn new(
        engine: &'e Engine,
        flow: &'e Flow,
        ctx: RunContext,
        tx: mpsc::UnboundedSender<Msg>,
    ) -> Self {
        let mut runner = Self {
            engine,
            flow,
            ctx,
            runs: BTreeMap::new(),
            results: HashMap::new(),
            remaining: HashMap::new(),
            open: flow.task_count(),
            ready: VecDeque::new(),
            tx,
        };
        for name in flow.task_names() {
            runner
                .runs
                .insert(name.to_owned(), TaskRun::new(name.to_owned(), None));
            runner
                .remaining
                .insert(name.to_owned(), flow.upstream_tasks(name).len());
        }
        for name in flow.task_names() {
            runner.emit_task(name, None, 0, &State::pending());
        }
        runner
    }

    fn drain_ready(&mut self) {
        while let Some(name) = self.ready.pop_front() {
            self.start_task(&name);
        }
    }

    /// A task whose upstream states have all settled: evaluate its trigger
    /// and either dispatch it, expand it, or settle it without running.
    fn start_task(&mut self, name: &str) {
        if self.engine.stop.is_raised() {
            self.finalize_task(name, State::skipped("engine stop requested"));
            return;
        }

        let flow = self.flow;
        let task = Arc::clone(flow.task(name).expect("validated flow contains task"));
        let upstream_states: Vec<State> = flow
            .upstream_tasks(name)
            .into_iter()
            .map(|up| self.runs[up].state.clone())
            .collect();

        match task.trigger().evaluate(&upstream_states) {
            Err(err) => {
                warn!(task = name, %err, "trigger evaluation failed");
                self.finalize_task(name, State::failed(err.to_string()));
            }
            Ok(false) => {
                self.finalize_task(
                    name,
                    State::trigger_failed(format!(
                        "trigger '{}' disqualified the run",
                        task.trigger().name()
                    )),
                );
            }
            Ok(true) => {
                let mapped_edge = flow
                    .incoming_edges(name)
                    .find(|edge| edge.mapped)
                    .cloned();
                if task.is_mapped() || mapped_edge.is_some() {
                    match mapped_edge {
                        Some(edge) => self.start_mapped(name, edge.upstream.as_str()),
                        None => self.finalize_task(
                            name,
                            State::failed("mapped task has no mapped incoming edge"),
                        ),
                    }
                } else {
                    self.dispatch(name, None, 1);
                }
            }
        }
    }

    /// Expand a mapped task into one child run per upstream element.
    fn start_mapped(&mut self, name: &str, mapped_upstream: &str) {
        let elements = match self
            .results
            .get(mapped_upstream)
            .map(|value| value.as_array().map(Vec::len))
        {
            None => {
                self.finalize_task(
                    name,
                    State::failed(format!(
                        "mapped upstream '{mapped_upstream}' produced no result"
                    )),
                );
                return;
            }
            Some(None) => {
                self.finalize_task(
                    name,
                    State::failed(format!(
                        "mapped upstream '{mapped_upstream}' result is not an array"
                    )),
                );
                return;
            }
            Some(Some(len)) => len,
        };

        // Vacuous success over an empty collection.
        if elements == 0 {
            let mut state = State::success(Value::Array(Vec::new()));
            state.message = Some("mapped over an empty collection".to_owned());
            self.finalize_task(name, state);
            return;
        }

        info!(task = name, children = elements, "expanding mapped task");
        {
            let record = self.runs.get_mut(name).expect("known task");
            record.children = (0..elements)
                .map(|i| TaskRun::new(name.to_owned(), Some(i)))
                .collect();
            record.state = State::running();
        }
        let running = self.runs[name].state.clone();
        self.emit_task(name, None, 0, &running);

        for index in 0..elements {
            self.dispatch(name, Some(index), 1);
        }
    }

    /// Hand one attempt to the executor and post the outcome back.
    fn dispatch(&mut self, name: &str, map_index: Option<usize>, attempt: u32) {
        let input = self.assemble_input(name, map_index);
        let task = Arc::clone(self.flow.task(name).expect("validated flow contains task"));

        let running = State::running();
        {
            let record = self.record_mut(name, map_index);
            record.attempts = attempt;
            record.state = running.clone();
        }
        self.emit_task(name, map_index, attempt, &running);

        let call = TaskCall {
            flow_run_id: self.ctx.flow_run_id,
            task: name.to_owned(),
            map_index,
            attempt,
            work: Arc::clone(task.work()),
            input,
            ctx: self.ctx.clone(),
            timeout: task.timeout(),
        };

        let executor = Arc::clone(&self.engine.executor);
        let tx = self.tx.clone();
        let task_name = name.to_owned();
        tokio::spawn(async move {
            let outcome = executor.submit(call).await;
            let _ = tx.send(Msg::Attempt {
                task: task_name,
                map_index,
                attempt,
                outcome,
            });
        });
    }

    /// Gather keyed upstream results (and the mapped element, for children)
    /// into the attempt's input.
    fn assemble_input(&self, name: &str, map_index: Option<usize>) -> TaskInput {
        let mut upstream = HashMap::new();
        let mut element = None;

        for edge in self.flow.incoming_edges(name) {
            if edge.mapped {
                if let Some(index) = map_index {
                    element = self
                        .results
                        .get(&edge.upstream)
                        .and_then(|value| value.get(index))
                        .cloned();
                    if let (Some(key), Some(value)) = (&edge.key, &element) {
                        upstream.insert(key.clone(), value.clone());
                    }
                }
                continue;
            }
            if let Some(key) = &edge.key {
                if let Some(value) = self.results.get(&edge.upstream) {
                    upstream.insert(key.clone(), value.clone());
                }
            }
        }

        TaskInput {
            parameters: self.ctx.parameters.clone(),
            upstream,
            element,
            map_index,
        }
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Attempt {
                task,
                map_index,
                attempt,
                outcome,
            } => match outcome {
                AttemptOutcome::Success(value) => {
                    self.complete(&task, map_index, State::success(value));
                }
                AttemptOutcome::TimedOut => {
                    self.maybe_retry(&task, map_index, attempt, "attempt timed out", false, true);
                }
                AttemptOutcome::Failed { message, fatal } => {
                    self.maybe_retry(&task, map_index, attempt, &message, fatal, false);
                }
            },
            Msg::Redispatch {
                task,
                map_index,
                attempt,
            } => {
                if self.engine.stop.is_raised() {
                    self.complete(
                        &task,
                        map_index,
                        State::failed("retry abandoned: engine stop requested"),
                    );
                } else {
                    self.dispatch(&task, map_index, attempt);
                }
            }
        }
    }

    /// Apply the retry policy to a failed or timed-out attempt.
    fn maybe_retry(
        &mut self,
        name: &str,
        map_index: Option<usize>,
        attempt: u32,
        message: &str,
        fatal: bool,
        timed_out: bool,
    ) {
        let task = Arc::clone(self.flow.task(name).expect("validated flow contains task"));
        let allowed = task.retry().max_retries + 1;

        if !fatal && attempt < allowed {
            let delay = task
                .retry()
                .retry_delay
                .unwrap_or(self.engine.config.default_retry_delay);
            warn!(
                task = name,
                ?map_index,
                attempt,
                allowed,
                ?delay,
                message,
                "attempt failed, retrying"
            );
            let retrying = State::retrying(message);
            self.record_mut(name, map_index).state = retrying.clone();
            self.emit_task(name, map_index, attempt, &retrying);

            let tx = self.tx.clone();
            let task_name = name.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Msg::Redispatch {
                    task: task_name,
                    map_index,
                    attempt: attempt + 1,
                });
            });
            return;
        }

        let state = if timed_out {
            State::timed_out(message)
        } else {
            State::failed(message)
        };
        warn!(
            task = name,
            ?map_index,
            attempt,
            kind = ?state.kind,
            message,
            "attempt failed terminally"
        );
        self.complete(name, map_index, state);
    }

    /// Record a terminal state for one attempt target (task or mapped child).
    fn complete(&mut self, name: &str, map_index: Option<usize>, state: State) {
        match map_index {
            None => self.finalize_task(name, state),
            Some(index) => {
                let attempts = {
                    let record = self.record_mut(name, map_index);
                    record.state = state.clone();
                    record.attempts
                };
                self.emit_task(name, Some(index), attempts, &state);
                self.reduce_mapped(name);
            }
        }
    }

    /// Fan-in: once every child is terminal, reduce into the parent state.
    fn reduce_mapped(&mut self, name: &str) {
        let state = {
            let record = &self.runs[name];
            if !record.children.iter().all(|child| child.state.is_terminal()) {
                return;
            }
            let failed = record
                .children
                .iter()
                .filter(|child| !child.state.is_successful())
                .count();
            let total = record.children.len();
            if failed == 0 {
                let results: Vec<Value> = record
                    .children
                    .iter()
                    .map(|child| child.state.result.clone().unwrap_or(Value::Null))
                    .collect();
                let mut state = State::success(Value::Array(results));
                state.message = Some(format!("{total} mapped children succeeded"));
                state
            } else {
                State::failed(format!("{failed} of {total} mapped children did not succeed"))
            }
        };
        self.finalize_task(name, state);
    }

    /// The single place a top-level task-run settles: records the terminal
    /// state, publishes the result, and recomputes downstream readiness.
    fn finalize_task(&mut self, name: &str, state: State) {
        if state.is_successful() {
            self.results
                .insert(name.to_owned(), state.result.clone().unwrap_or(Value::Null));
        }

        let attempts = {
            let record = self.runs.get_mut(name).expect("known task");
            record.state = state.clone();
            record.attempts
        };
        self.emit_task(name, None, attempts, &state);
        self.open -= 1;

        let downstream: Vec<String> = self
            .flow
            .downstream_tasks(name)
            .into_iter()
            .map(str::to_owned)
            .collect();
        for neighbour in downstream {
            let remaining = self
                .remaining
                .get_mut(&neighbour)
                .expect("known downstream task");
            *remaining -= 1;
            if *remaining == 0 {
                self.ready.push_back(neighbour);
            }
        }
    }

    /// Aggregate the terminal flow-run state from every task-run state.
    fn final_state(&self) -> State {
        let total = self.runs.len();
        let task_states: Vec<State> = self.runs.values().map(|run| run.state.clone()).collect();

        if let Some(trigger) = self.flow.run_trigger() {
            return match trigger.evaluate(&task_states) {
                Ok(true) => {
                    let mut state = State::success(Value::Null);
                    state.message =
                        Some(format!("run trigger '{}' passed", trigger.name()));
                    state
                }
                Ok(false) => State::failed(format!(
                    "run trigger '{}' disqualified the flow run",
                    trigger.name()
                )),
                Err(err) => State::failed(err.to_string()),
            };
        }

        let unsuccessful = task_states
            .iter()
            .filter(|state| !state.is_successful())
            .count();
        if unsuccessful == 0 {
            let mut state = State::success(Value::Null);
            state.message = Some(format!("all {total} task runs succeeded"));
            state
        } else {
            State::failed(format!("{unsuccessful} of {total} task runs did not succeed"))
        }
    }

    fn record_mut(&mut self, name: &str, map_index: Option<usize>) -> &mut TaskRun {
        let parent = self.runs.get_mut(name).expect("known task");
        match map_index {
            None => parent,
            Some(index) => &mut parent.children[index],
        }
    }

    fn emit_task(&self, name: &str, map_index: Option<usize>, attempt: u32, state: &State) {
        self.engine.observer.on_task_update(&TaskRunUpdate {
            flow_run_id: self.ctx.flow_run_id,
            flow: &self.ctx.flow_name,
            task: name,
            map_index,
            attempt,
            state,
        });
    }

    fn emit_flow(&self, state: &State) {
        self.engine.observer.on_flow_update(&FlowRunUpdate {
            flow_run_id: self.ctx.flow_run_id,
            flow: &self.ctx.flow_name,
            state,
        });
    }
}
