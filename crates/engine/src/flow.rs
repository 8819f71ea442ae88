//! Flows — the DAG container.
//!
//! A [`Flow`] owns a set of named [`Task`]s and the [`Edge`]s wiring them
//! together.  Mutation happens only while the flow is being defined; every
//! successful mutation refreshes a cached topology (per-task neighbour sets),
//! so lookups during execution never recompute anything.  Cycle detection is
//! a full Kahn topological sort run on each edge insertion — conservative,
//! not incremental.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::edge::Edge;
use crate::error::FlowError;
use crate::task::Task;
use crate::trigger::Trigger;

/// Cached neighbour/edge lookups, rebuilt on successful mutation.
#[derive(Debug, Default)]
struct Topology {
    /// Incoming edge indices per task.
    incoming: HashMap<String, Vec<usize>>,
    /// Outgoing edge indices per task.
    outgoing: HashMap<String, Vec<usize>>,
}

/// A named DAG of tasks.
pub struct Flow {
    name: String,
    tasks: BTreeMap<String, Arc<Task>>,
    edges: Vec<Edge>,
    run_trigger: Option<Arc<dyn Trigger>>,
    topology: Topology,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: BTreeMap::new(),
            edges: Vec::new(),
            run_trigger: None,
            topology: Topology::default(),
        }
    }

    /// Install a flow-level trigger deciding the terminal run state from the
    /// terminal states of every task-run.  Without one, the run succeeds iff
    /// every task-run succeeded.
    pub fn with_run_trigger(mut self, trigger: Arc<dyn Trigger>) -> Self {
        self.run_trigger = Some(trigger);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_trigger(&self) -> Option<&Arc<dyn Trigger>> {
        self.run_trigger.as_ref()
    }

    pub fn task(&self, name: &str) -> Option<&Arc<Task>> {
        self.tasks.get(name)
    }

    /// Task names in insertion-independent (sorted) order.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Add a task to the flow.
    ///
    /// # Errors
    /// [`FlowError::DuplicateTask`] if a task with the same name exists.
    pub fn add_task(&mut self, task: Task) -> Result<(), FlowError> {
        let name = task.name().to_owned();
        if self.tasks.contains_key(&name) {
            return Err(FlowError::DuplicateTask(name));
        }
        self.topology.incoming.entry(name.clone()).or_default();
        self.topology.outgoing.entry(name.clone()).or_default();
        self.tasks.insert(name, Arc::new(task));
        Ok(())
    }

    /// Add a dependency edge.
    ///
    /// # Errors
    /// - [`FlowError::UnknownTask`] if either endpoint is absent.
    /// - [`FlowError::CyclicGraph`] if inclusion would create a cycle; the
    ///   edge set is left unchanged.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), FlowError> {
        if !self.tasks.contains_key(&edge.upstream) {
            return Err(FlowError::UnknownTask {
                name: edge.upstream,
                side: "upstream",
            });
        }
        if !self.tasks.contains_key(&edge.downstream) {
            return Err(FlowError::UnknownTask {
                name: edge.downstream,
                side: "downstream",
            });
        }

        self.edges.push(edge);
        if let Err(err) = self.topological_order() {
            self.edges.pop();
            return Err(err);
        }

        let index = self.edges.len() - 1;
        let edge = &self.edges[index];
        self.topology
            .incoming
            .entry(edge.downstream.clone())
            .or_default()
            .push(index);
        self.topology
            .outgoing
            .entry(edge.upstream.clone())
            .or_default()
            .push(index);
        Ok(())
    }

    /// Validate the whole flow and return its tasks in topological order.
    ///
    /// Run automatically at the start of every flow run.
    ///
    /// # Errors
    /// [`FlowError::DanglingEdge`] or [`FlowError::CyclicGraph`].
    pub fn validate(&self) -> Result<Vec<String>, FlowError> {
        for edge in &self.edges {
            if !self.tasks.contains_key(&edge.upstream)
                || !self.tasks.contains_key(&edge.downstream)
            {
                return Err(FlowError::DanglingEdge {
                    upstream: edge.upstream.clone(),
                    downstream: edge.downstream.clone(),
                });
            }
        }
        self.topological_order()
    }

    /// Distinct upstream neighbour names of `task`, from the cached topology.
    pub fn upstream_tasks(&self, task: &str) -> Vec<&str> {
        self.neighbours(&self.topology.incoming, task, |e| &e.upstream)
    }

    /// Distinct downstream neighbour names of `task`, from the cached topology.
    pub fn downstream_tasks(&self, task: &str) -> Vec<&str> {
        self.neighbours(&self.topology.outgoing, task, |e| &e.downstream)
    }

    /// Incoming edges of `task`, in insertion order.
    pub fn incoming_edges(&self, task: &str) -> impl Iterator<Item = &Edge> {
        self.topology
            .incoming
            .get(task)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    fn neighbours<'a>(
        &'a self,
        side: &'a HashMap<String, Vec<usize>>,
        task: &str,
        pick: fn(&'a Edge) -> &'a String,
    ) -> Vec<&'a str> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for &index in side.get(task).map(Vec::as_slice).unwrap_or_default() {
            let name = pick(&self.edges[index]).as_str();
            if seen.insert(name) {
                names.push(name);
            }
        }
        names
    }

    /// Kahn's algorithm over the current task/edge sets.
    fn topological_order(&self) -> Result<Vec<String>, FlowError> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();

        for name in self.tasks.keys() {
            adjacency.entry(name.as_str()).or_default();
            in_degree.entry(name.as_str()).or_insert(0);
        }

        for edge in &self.edges {
            adjacency
                .entry(edge.upstream.as_str())
                .or_default()
                .push(edge.downstream.as_str());
            *in_degree.entry(edge.downstream.as_str()).or_insert(0) += 1;
        }

        // Seed with root tasks; BTreeMap iteration keeps this deterministic.
        let mut queue: VecDeque<&str> = self
            .tasks
            .keys()
            .filter(|name| in_degree[name.as_str()] == 0)
            .map(String::as_str)
            .collect();

        let mut sorted = Vec::with_capacity(self.tasks.len());
        while let Some(name) = queue.pop_front() {
            sorted.push(name.to_owned());
            if let Some(downstream) = adjacency.get(name) {
                for &neighbour in downstream {
                    let degree = in_degree.entry(neighbour).or_insert(0);
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(neighbour);
                    }
                }
            }
        }

        // Unvisited tasks mean a cycle.
        if sorted.len() != self.tasks.len() {
            return Err(FlowError::CyclicGraph);
        }
        Ok(sorted)
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("edges", &self.edges)
            .finish_non_exhaustive()
    }
}
