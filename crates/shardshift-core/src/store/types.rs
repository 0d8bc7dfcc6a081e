//! Request and response types shared by every document store implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::config::StoreDefaults;

/// Opaque reference to an in-flight asynchronous store operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskHandle {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TaskHandle {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of a finished task as reported by the tasks API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    #[serde(default)]
    pub failures: Vec<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Result of a task-status lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub response: TaskResponse,
    /// Top-level error, reported when the lookup itself was rejected.
    #[serde(default)]
    pub error: Option<Value>,
}

impl TaskStatus {
    /// A finished task with no failures.
    pub fn succeeded() -> Self {
        Self {
            completed: true,
            ..Self::default()
        }
    }

    /// A task that is still running.
    pub fn running() -> Self {
        Self::default()
    }

    /// Describe why the task failed, if it did.
    ///
    /// Failures can arrive embedded in a completed response or as a top-level
    /// error while `completed` is still false.
    pub fn failure_reason(&self) -> Option<String> {
        if let Some(error) = self.error.as_ref().or(self.response.error.as_ref()) {
            return Some(describe_error(error));
        }
        if !self.response.failures.is_empty() {
            let reasons: Vec<String> = self.response.failures.iter().map(describe_error).collect();
            return Some(reasons.join("; "));
        }
        None
    }
}

fn describe_error(value: &Value) -> String {
    value
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            value
                .get("cause")
                .and_then(|cause| cause.get("reason"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| value.as_str().map(str::to_string))
        .unwrap_or_else(|| value.to_string())
}

/// How by-query operations react to version conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conflicts {
    #[default]
    Proceed,
    Abort,
}

impl Conflicts {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conflicts::Proceed => "proceed",
            Conflicts::Abort => "abort",
        }
    }
}

/// Options for update-by-query and delete-by-query calls.
///
/// Calls are always dispatched with `wait_for_completion=false`.
#[derive(Debug, Clone, PartialEq)]
pub struct ByQueryOptions {
    /// Maximum documents a single call may touch.
    pub max_docs: Option<u64>,
    /// Store-side timeout, e.g. `"5m"`.
    pub timeout: Option<String>,
    pub conflicts: Conflicts,
    pub routing: Option<String>,
    pub slices: Option<u32>,
}

impl Default for ByQueryOptions {
    fn default() -> Self {
        Self {
            max_docs: None,
            timeout: Some(StoreDefaults::TASK_TIMEOUT.to_string()),
            conflicts: Conflicts::Proceed,
            routing: None,
            slices: None,
        }
    }
}

impl ByQueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_docs(mut self, max_docs: u64) -> Self {
        self.max_docs = Some(max_docs);
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn with_routing(mut self, routing: impl Into<String>) -> Self {
        self.routing = Some(routing.into());
        self
    }

    pub fn with_slices(mut self, slices: u32) -> Self {
        self.slices = Some(slices);
        self
    }
}

/// Response to an update-by-query or delete-by-query dispatch.
///
/// The store answers with either a task handle or a list of failures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ByQueryResponse {
    pub task: Option<TaskHandle>,
    pub failures: Vec<Value>,
}

impl ByQueryResponse {
    pub fn started(task: impl Into<TaskHandle>) -> Self {
        Self {
            task: Some(task.into()),
            failures: Vec::new(),
        }
    }

    pub fn failed(failures: Vec<Value>) -> Self {
        Self {
            task: None,
            failures,
        }
    }
}

/// One slice of a reindex from `source` into `dest`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReindexRequest {
    pub source: String,
    pub dest: String,
    pub slice: u32,
    pub max_slices: u32,
    pub query: Option<Value>,
    pub script: Option<Value>,
}

impl ReindexRequest {
    /// Build the `_reindex` request body.
    pub fn body(&self) -> Value {
        let mut source = serde_json::json!({
            "index": self.source,
            "slice": { "id": self.slice, "max": self.max_slices },
        });
        if let Some(query) = &self.query {
            source["query"] = query.clone();
        }

        let mut body = serde_json::json!({
            "source": source,
            "dest": { "index": self.dest },
        });
        if let Some(script) = &self.script {
            body["script"] = script.clone();
        }
        body
    }
}

/// A single search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub source: Value,
}

/// Search results with optional aggregations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResponse {
    pub total: u64,
    pub hits: Vec<SearchHit>,
    pub aggregations: Option<Value>,
}

/// An index to create with its settings and mappings.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexTarget {
    pub name: String,
    pub body: Value,
}
