//! Integration tests for the execution engine.
//!
//! Everything here runs in-process against `MockWork`/`FnWork` and the
//! `LocalExecutor`; timing-sensitive cases run under tokio's paused clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::engine::{Engine, EngineConfig, FlowRun};
use crate::error::{TaskError, TriggerError};
use crate::events::{FlowRunUpdate, RunObserver, TaskRunUpdate};
use crate::flow::Flow;
use crate::mock::MockWork;
use crate::state::{State, StateKind};
use crate::task::{FnWork, RunContext, Task, TaskInput, TaskWork};
use crate::trigger::{AllFinished, AnySuccessful, Trigger};
use crate::Edge;

fn engine() -> Engine {
    Engine::new(EngineConfig {
        max_concurrency: 8,
        default_retry_delay: Duration::from_millis(10),
    })
}

fn no_params() -> Map<String, Value> {
    Map::new()
}

async fn run(flow: &Flow) -> FlowRun {
    engine().run(flow, no_params()).await.expect("valid flow")
}

// ============================================================
// Scenario A: fan-out after success
// ============================================================

#[tokio::test]
async fn downstream_tasks_run_only_after_upstream_succeeds() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = |name: &'static str, log: &Arc<Mutex<Vec<String>>>| {
        let log = Arc::clone(log);
        Arc::new(FnWork::new(move |_input| {
            log.lock().unwrap().push(name.to_owned());
            Ok(json!({ "task": name }))
        }))
    };

    let mut flow = Flow::new("scenario-a");
    flow.add_task(Task::new("a", recorder("a", &log))).unwrap();
    flow.add_task(Task::new("b", recorder("b", &log))).unwrap();
    flow.add_task(Task::new("c", recorder("c", &log))).unwrap();
    flow.add_edge(Edge::new("a", "b")).unwrap();
    flow.add_edge(Edge::new("a", "c")).unwrap();

    let result = run(&flow).await;

    assert!(result.state.is_successful());
    for task in ["a", "b", "c"] {
        assert_eq!(result.task_runs[task].state.kind, StateKind::Success);
    }

    let order = log.lock().unwrap().clone();
    assert_eq!(order.len(), 3);
    assert_eq!(order[0], "a", "b and c must not start before a settles");
}

// ============================================================
// Scenario B: failure disqualifies downstream, independent work continues
// ============================================================

#[tokio::test]
async fn failed_upstream_trigger_fails_downstream_but_not_siblings() {
    let b_work = MockWork::returning(json!("b"));
    let c_work = MockWork::returning(json!("c"));
    let solo_work = MockWork::returning(json!("solo"));

    let mut flow = Flow::new("scenario-b");
    flow.add_task(Task::new("a", MockWork::failing_retryable("no connection")))
        .unwrap();
    flow.add_task(Task::new("b", b_work.clone())).unwrap();
    flow.add_task(Task::new("c", c_work.clone())).unwrap();
    // An independent branch: must still run.
    flow.add_task(Task::new("solo", solo_work.clone())).unwrap();
    flow.add_edge(Edge::new("a", "b")).unwrap();
    flow.add_edge(Edge::new("a", "c")).unwrap();

    let result = run(&flow).await;

    assert_eq!(result.state.kind, StateKind::Failed);
    assert_eq!(result.task_runs["a"].state.kind, StateKind::Failed);
    assert_eq!(result.task_runs["b"].state.kind, StateKind::TriggerFailed);
    assert_eq!(result.task_runs["c"].state.kind, StateKind::TriggerFailed);
    assert_eq!(result.task_runs["solo"].state.kind, StateKind::Success);

    // Disqualified tasks were never dispatched.
    assert_eq!(b_work.call_count(), 0);
    assert_eq!(c_work.call_count(), 0);
    assert_eq!(solo_work.call_count(), 1);
}

// ============================================================
// Retry policy
// ============================================================

#[tokio::test(start_paused = true)]
async fn max_retries_n_yields_exactly_n_plus_one_attempts() {
    let work = MockWork::failing_retryable("flaky dependency");
    let mut flow = Flow::new("retries");
    flow.add_task(
        Task::new("t", work.clone())
            .with_retries(2)
            .with_retry_delay(Duration::from_millis(50)),
    )
    .unwrap();

    let result = run(&flow).await;

    assert_eq!(work.call_count(), 3);
    assert_eq!(result.task_runs["t"].attempts, 3);
    assert_eq!(result.task_runs["t"].state.kind, StateKind::Failed);
    assert_eq!(result.state.kind, StateKind::Failed);
}

#[tokio::test]
async fn fatal_errors_bypass_the_retry_budget() {
    let work = MockWork::failing_fatal("bad credentials");
    let mut flow = Flow::new("fatal");
    flow.add_task(Task::new("t", work.clone()).with_retries(5))
        .unwrap();

    let result = run(&flow).await;

    assert_eq!(work.call_count(), 1);
    assert_eq!(result.task_runs["t"].state.kind, StateKind::Failed);
}

#[tokio::test(start_paused = true)]
async fn timeouts_consume_the_retry_budget_like_failures() {
    let work = MockWork::sleeping(Duration::from_secs(3600), json!("never"));
    let mut flow = Flow::new("timeouts");
    flow.add_task(
        Task::new("slow", work.clone())
            .with_timeout(Duration::from_millis(20))
            .with_retries(1)
            .with_retry_delay(Duration::from_millis(5)),
    )
    .unwrap();

    let result = run(&flow).await;

    assert_eq!(work.call_count(), 2);
    assert_eq!(result.task_runs["slow"].attempts, 2);
    assert_eq!(result.task_runs["slow"].state.kind, StateKind::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn a_retry_that_recovers_ends_in_success() {
    let work = MockWork::failing_times(1, json!("recovered"));
    let mut flow = Flow::new("recovery");
    flow.add_task(
        Task::new("t", work.clone())
            .with_retries(3)
            .with_retry_delay(Duration::from_millis(5)),
    )
    .unwrap();

    let result = run(&flow).await;

    assert_eq!(work.call_count(), 2);
    assert_eq!(result.task_runs["t"].attempts, 2);
    assert!(result.state.is_successful());
}

// ============================================================
// Data passing
// ============================================================

#[tokio::test]
async fn keyed_edges_bind_upstream_results_to_named_inputs() {
    let seen = Arc::new(Mutex::new(None));
    let seen_in_b = Arc::clone(&seen);

    let mut flow = Flow::new("data");
    flow.add_task(Task::new("a", MockWork::returning(json!({ "rows": 3 }))))
        .unwrap();
    flow.add_task(Task::new(
        "b",
        Arc::new(FnWork::new(move |input| {
            *seen_in_b.lock().unwrap() = input.upstream.get("a_out").cloned();
            Ok(json!("done"))
        })),
    ))
    .unwrap();
    flow.add_edge(Edge::keyed("a", "b", "a_out")).unwrap();

    let result = run(&flow).await;

    assert!(result.state.is_successful());
    assert_eq!(seen.lock().unwrap().clone(), Some(json!({ "rows": 3 })));
}

#[tokio::test]
async fn parameters_reach_every_task() {
    let ok = Arc::new(Mutex::new(false));
    let ok_in_task = Arc::clone(&ok);

    let mut flow = Flow::new("params");
    flow.add_task(Task::new(
        "t",
        Arc::new(FnWork::new(move |input: TaskInput| {
            *ok_in_task.lock().unwrap() = input.parameters.get("env") == Some(&json!("prod"));
            Ok(Value::Null)
        })),
    ))
    .unwrap();

    let mut params = Map::new();
    params.insert("env".to_owned(), json!("prod"));
    let result = engine().run(&flow, params).await.unwrap();

    assert!(result.state.is_successful());
    assert!(*ok.lock().unwrap());
}

// ============================================================
// Mapped tasks
// ============================================================

fn doubling_work() -> Arc<FnWork<impl Fn(TaskInput) -> Result<Value, TaskError> + Send + Sync>> {
    Arc::new(FnWork::new(|input: TaskInput| {
        let n = input
            .element
            .as_ref()
            .and_then(Value::as_i64)
            .ok_or_else(|| TaskError::Fatal("element is not a number".to_owned()))?;
        Ok(json!(n * 2))
    }))
}

#[tokio::test]
async fn mapped_task_fans_out_one_child_per_element_and_reduces() {
    let mut flow = Flow::new("mapping");
    flow.add_task(Task::new("a", MockWork::returning(json!([1, 2, 3]))))
        .unwrap();
    flow.add_task(Task::new("d", doubling_work()).mapped()).unwrap();
    flow.add_edge(Edge::mapped("a", "d", Some("n".to_owned())))
        .unwrap();

    let result = run(&flow).await;

    let d = &result.task_runs["d"];
    assert_eq!(d.children.len(), 3);
    assert_eq!(d.state.kind, StateKind::Success);
    assert_eq!(d.state.result, Some(json!([2, 4, 6])));
    for (index, child) in d.children.iter().enumerate() {
        assert_eq!(child.map_index, Some(index));
        assert_eq!(child.state.kind, StateKind::Success);
    }
    assert!(result.state.is_successful());
}

#[tokio::test]
async fn mapping_over_an_empty_collection_is_vacuous_success() {
    let work = MockWork::returning(json!("child"));
    let mut flow = Flow::new("empty-mapping");
    flow.add_task(Task::new("a", MockWork::returning(json!([]))))
        .unwrap();
    flow.add_task(Task::new("d", work.clone()).mapped()).unwrap();
    flow.add_edge(Edge::mapped("a", "d", None)).unwrap();

    let result = run(&flow).await;

    let d = &result.task_runs["d"];
    assert_eq!(d.state.kind, StateKind::Success);
    assert!(d.children.is_empty());
    assert_eq!(work.call_count(), 0);
    assert!(result.state.is_successful());
}

#[tokio::test]
async fn mapping_over_a_non_array_result_fails_the_parent() {
    let mut flow = Flow::new("bad-mapping");
    flow.add_task(Task::new("a", MockWork::returning(json!(42))))
        .unwrap();
    flow.add_task(Task::new("d", MockWork::returning(json!("unused"))).mapped())
        .unwrap();
    flow.add_edge(Edge::mapped("a", "d", None)).unwrap();

    let result = run(&flow).await;
    assert_eq!(result.task_runs["d"].state.kind, StateKind::Failed);
}

// Scenario C: middle child fails once, then recovers on retry.
#[tokio::test(start_paused = true)]
async fn mapped_child_retries_independently_then_parent_succeeds() {
    let attempts: Arc<Mutex<HashMap<usize, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let attempts_in_work = Arc::clone(&attempts);
    let work = Arc::new(FnWork::new(move |input: TaskInput| {
        let index = input.map_index.unwrap();
        let mut attempts = attempts_in_work.lock().unwrap();
        let n = attempts.entry(index).or_insert(0);
        *n += 1;
        if index == 1 && *n == 1 {
            return Err(TaskError::Retryable("transient".to_owned()));
        }
        Ok(input.element.unwrap())
    }));

    let mut flow = Flow::new("scenario-c");
    flow.add_task(Task::new("a", MockWork::returning(json!([1, 2, 3]))))
        .unwrap();
    flow.add_task(
        Task::new("d", work)
            .mapped()
            .with_retries(1)
            .with_retry_delay(Duration::from_millis(5)),
    )
    .unwrap();
    flow.add_edge(Edge::mapped("a", "d", None)).unwrap();

    let result = run(&flow).await;

    let d = &result.task_runs["d"];
    assert_eq!(d.children.len(), 3);
    assert_eq!(d.children[1].attempts, 2);
    assert_eq!(d.children[0].attempts, 1);
    assert_eq!(d.state.kind, StateKind::Success);
    assert_eq!(d.state.result, Some(json!([1, 2, 3])));
    assert!(result.state.is_successful());
}

#[tokio::test(start_paused = true)]
async fn one_exhausted_child_fails_the_mapped_parent() {
    let work = Arc::new(FnWork::new(|input: TaskInput| {
        if input.map_index == Some(1) {
            Err(TaskError::Retryable("always down".to_owned()))
        } else {
            Ok(input.element.unwrap())
        }
    }));

    let mut flow = Flow::new("mapping-failure");
    flow.add_task(Task::new("a", MockWork::returning(json!(["x", "y"]))))
        .unwrap();
    flow.add_task(
        Task::new("d", work)
            .mapped()
            .with_retries(1)
            .with_retry_delay(Duration::from_millis(5)),
    )
    .unwrap();
    flow.add_edge(Edge::mapped("a", "d", None)).unwrap();

    let result = run(&flow).await;

    let d = &result.task_runs["d"];
    assert_eq!(d.state.kind, StateKind::Failed);
    assert_eq!(d.children[1].attempts, 2);
    assert_eq!(result.state.kind, StateKind::Failed);
}

// ============================================================
// Concurrency bound
// ============================================================

struct GaugedWork {
    current: AtomicUsize,
    high_water: AtomicUsize,
}

#[async_trait]
impl TaskWork for GaugedWork {
    async fn run(&self, _input: TaskInput, _ctx: &RunContext) -> Result<Value, TaskError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

#[tokio::test(start_paused = true)]
async fn in_flight_attempts_never_exceed_the_executor_bound() {
    let work = Arc::new(GaugedWork {
        current: AtomicUsize::new(0),
        high_water: AtomicUsize::new(0),
    });

    let mut flow = Flow::new("bounded");
    for i in 0..6 {
        flow.add_task(Task::new(format!("t{i}"), work.clone() as Arc<dyn TaskWork>))
            .unwrap();
    }

    let engine = Engine::new(EngineConfig {
        max_concurrency: 2,
        default_retry_delay: Duration::from_millis(10),
    });
    let result = engine.run(&flow, no_params()).await.unwrap();

    assert!(result.state.is_successful());
    assert!(
        work.high_water.load(Ordering::SeqCst) <= 2,
        "bound exceeded: {}",
        work.high_water.load(Ordering::SeqCst)
    );
}

#[tokio::test(start_paused = true)]
async fn mapped_children_share_the_global_bound() {
    let work = Arc::new(GaugedWork {
        current: AtomicUsize::new(0),
        high_water: AtomicUsize::new(0),
    });

    let mut flow = Flow::new("bounded-mapping");
    flow.add_task(Task::new(
        "a",
        MockWork::returning(json!([0, 1, 2, 3, 4, 5, 6, 7])),
    ))
    .unwrap();
    flow.add_task(Task::new("d", work.clone() as Arc<dyn TaskWork>).mapped())
        .unwrap();
    flow.add_edge(Edge::mapped("a", "d", None)).unwrap();

    let engine = Engine::new(EngineConfig {
        max_concurrency: 3,
        default_retry_delay: Duration::from_millis(10),
    });
    let result = engine.run(&flow, no_params()).await.unwrap();

    assert!(result.state.is_successful());
    assert!(work.high_water.load(Ordering::SeqCst) <= 3);
}

// ============================================================
// Triggers at the flow and task level
// ============================================================

#[tokio::test]
async fn any_successful_trigger_runs_on_mixed_upstream_outcomes() {
    let c_work = MockWork::returning(json!("c"));
    let mut flow = Flow::new("mixed");
    flow.add_task(Task::new("a", MockWork::failing_retryable("down")))
        .unwrap();
    flow.add_task(Task::new("b", MockWork::returning(json!("b"))))
        .unwrap();
    flow.add_task(
        Task::new("c", c_work.clone()).with_trigger(Arc::new(AnySuccessful)),
    )
    .unwrap();
    flow.add_edge(Edge::new("a", "c")).unwrap();
    flow.add_edge(Edge::new("b", "c")).unwrap();

    let result = run(&flow).await;

    assert_eq!(result.task_runs["c"].state.kind, StateKind::Success);
    assert_eq!(c_work.call_count(), 1);
    // The flow as a whole still failed because of `a`.
    assert_eq!(result.state.kind, StateKind::Failed);
}

#[tokio::test]
async fn run_trigger_can_accept_a_flow_with_failures() {
    let mut flow =
        Flow::new("tolerant").with_run_trigger(Arc::new(AllFinished));
    flow.add_task(Task::new("a", MockWork::failing_retryable("down")))
        .unwrap();
    flow.add_task(Task::new("b", MockWork::returning(json!("b"))))
        .unwrap();

    let result = run(&flow).await;
    assert!(result.state.is_successful());
}

struct BrokenTrigger;

impl Trigger for BrokenTrigger {
    fn evaluate(&self, _upstream: &[State]) -> Result<bool, TriggerError> {
        Err(TriggerError("lookup table missing".to_owned()))
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

#[tokio::test]
async fn a_trigger_evaluation_error_fails_the_task_without_retries() {
    let work = MockWork::returning(json!("never"));
    let mut flow = Flow::new("broken-trigger");
    flow.add_task(Task::new("a", MockWork::returning(json!("a"))))
        .unwrap();
    flow.add_task(
        Task::new("b", work.clone())
            .with_trigger(Arc::new(BrokenTrigger))
            .with_retries(3),
    )
    .unwrap();
    flow.add_edge(Edge::new("a", "b")).unwrap();

    let result = run(&flow).await;

    let b = &result.task_runs["b"];
    assert_eq!(b.state.kind, StateKind::Failed);
    assert_eq!(b.attempts, 0);
    assert_eq!(work.call_count(), 0);
}

// ============================================================
// Cooperative stop
// ============================================================

#[tokio::test(start_paused = true)]
async fn stop_signal_lets_in_flight_work_finish_and_skips_the_rest() {
    let a_work = MockWork::sleeping(Duration::from_millis(100), json!("a"));
    let b_work = MockWork::returning(json!("b"));

    let mut flow = Flow::new("stoppable");
    flow.add_task(Task::new("a", a_work.clone())).unwrap();
    flow.add_task(Task::new("b", b_work.clone())).unwrap();
    flow.add_edge(Edge::new("a", "b")).unwrap();
    let flow = Arc::new(flow);

    let engine = Arc::new(engine());
    let stop = engine.stop_signal();

    let handle = {
        let engine = Arc::clone(&engine);
        let flow = Arc::clone(&flow);
        tokio::spawn(async move { engine.run(&flow, Map::new()).await })
    };

    // Let `a` get dispatched, then request a stop while it sleeps.
    tokio::time::sleep(Duration::from_millis(10)).await;
    stop.raise();

    let result = handle.await.unwrap().unwrap();

    assert_eq!(result.task_runs["a"].state.kind, StateKind::Success);
    assert_eq!(result.task_runs["b"].state.kind, StateKind::Skipped);
    assert_eq!(b_work.call_count(), 0);
    assert_eq!(result.state.kind, StateKind::Failed);
}

// ============================================================
// Observer events
// ============================================================

#[derive(Default)]
struct RecordingObserver {
    task_events: Mutex<Vec<(String, Option<usize>, StateKind)>>,
    flow_events: Mutex<Vec<StateKind>>,
}

impl RunObserver for RecordingObserver {
    fn on_task_update(&self, update: &TaskRunUpdate<'_>) {
        self.task_events.lock().unwrap().push((
            update.task.to_owned(),
            update.map_index,
            update.state.kind,
        ));
    }

    fn on_flow_update(&self, update: &FlowRunUpdate<'_>) {
        self.flow_events.lock().unwrap().push(update.state.kind);
    }
}

#[tokio::test]
async fn every_state_transition_is_emitted_to_the_observer() {
    let observer = Arc::new(RecordingObserver::default());
    let mut flow = Flow::new("observed");
    flow.add_task(Task::new("t", MockWork::returning(json!("ok"))))
        .unwrap();

    let engine = Engine::new(EngineConfig::default()).with_observer(observer.clone());
    let result = engine.run(&flow, Map::new()).await.unwrap();
    assert!(result.state.is_successful());

    let flow_events = observer.flow_events.lock().unwrap().clone();
    assert_eq!(flow_events, vec![StateKind::Running, StateKind::Success]);

    let kinds: Vec<StateKind> = observer
        .task_events
        .lock()
        .unwrap()
        .iter()
        .map(|(_, _, kind)| *kind)
        .collect();
    assert_eq!(
        kinds,
        vec![StateKind::Pending, StateKind::Running, StateKind::Success]
    );
}
