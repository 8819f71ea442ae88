//! Dependency edges.

use serde::{Deserialize, Serialize};

/// A directed dependency between two tasks.
///
/// Without a `key` the edge is control-only: it orders execution but passes
/// no data.  With a `key` the upstream task's result is bound to the named
/// input slot of the downstream task.  With `mapped` set, the downstream task
/// fans out into one child run per element of the upstream result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub upstream: String,
    pub downstream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub mapped: bool,
}

impl Edge {
    /// A control-only edge: ordering, no data.
    pub fn new(upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
            key: None,
            mapped: false,
        }
    }

    /// A data edge binding the upstream result to input slot `key`.
    pub fn keyed(
        upstream: impl Into<String>,
        downstream: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(upstream, downstream)
        }
    }

    /// Fan the downstream task out over the upstream result.
    ///
    /// Each element is bound to `key` when one is given, and is always
    /// available as the child input's `element`.
    pub fn mapped(
        upstream: impl Into<String>,
        downstream: impl Into<String>,
        key: Option<String>,
    ) -> Self {
        Self {
            key,
            mapped: true,
            ..Self::new(upstream, downstream)
        }
    }
}
