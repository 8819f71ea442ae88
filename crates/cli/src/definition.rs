//! Structural flow definitions.
//!
//! A JSON flow definition describes the shape of a DAG — task names with
//! retry metadata plus edges — without the work callables, which only exist
//! in code.  Good enough for `driftflow check`: building the [`Flow`] runs
//! the full duplicate/unknown-task/cycle validation.

use std::sync::Arc;

use serde::Deserialize;

use engine::{Edge, Flow, FlowError, NoopWork, Task};

#[derive(Debug, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub mapped: bool,
}

#[derive(Debug, Deserialize)]
pub struct EdgeDefinition {
    pub upstream: String,
    pub downstream: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub mapped: bool,
}

impl FlowDefinition {
    /// Build a structural [`Flow`] with no-op work attached to every task.
    pub fn build(&self) -> Result<Flow, FlowError> {
        let mut flow = Flow::new(&self.name);
        for task in &self.tasks {
            let mut built =
                Task::new(&task.name, Arc::new(NoopWork)).with_retries(task.max_retries);
            if task.mapped {
                built = built.mapped();
            }
            flow.add_task(built)?;
        }
        for edge in &self.edges {
            flow.add_edge(Edge {
                upstream: edge.upstream.clone(),
                downstream: edge.downstream.clone(),
                key: edge.key.clone(),
                mapped: edge.mapped,
            })?;
        }
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_builds_and_validates() {
        let definition: FlowDefinition = serde_json::from_str(
            r#"{
                "name": "etl",
                "tasks": [
                    { "name": "extract" },
                    { "name": "transform", "max_retries": 2, "mapped": true },
                    { "name": "load" }
                ],
                "edges": [
                    { "upstream": "extract", "downstream": "transform", "key": "rows", "mapped": true },
                    { "upstream": "transform", "downstream": "load" }
                ]
            }"#,
        )
        .unwrap();

        let flow = definition.build().unwrap();
        let order = flow.validate().unwrap();
        assert_eq!(order, vec!["extract", "transform", "load"]);
    }

    #[test]
    fn cyclic_definition_is_rejected() {
        let definition: FlowDefinition = serde_json::from_str(
            r#"{
                "name": "broken",
                "tasks": [{ "name": "a" }, { "name": "b" }],
                "edges": [
                    { "upstream": "a", "downstream": "b" },
                    { "upstream": "b", "downstream": "a" }
                ]
            }"#,
        )
        .unwrap();

        assert!(matches!(definition.build(), Err(FlowError::CyclicGraph)));
    }
}
