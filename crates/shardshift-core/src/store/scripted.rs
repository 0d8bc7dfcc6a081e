//! Scripted in-process document store.
//!
//! Test double used by unit and integration tests: counts and searches are
//! answered by closures, mutating calls create tasks that stay running until
//! the test completes, fails or forgets them, and every call is logged.

use super::types::{
    ByQueryOptions, ByQueryResponse, ReindexRequest, SearchResponse, TaskHandle, TaskStatus,
};
use super::DocumentStore;
use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

type CountFn = Box<dyn Fn(&str, &Value) -> u64 + Send + Sync>;
type SearchFn = Box<dyn Fn(&str, &Value) -> SearchResponse + Send + Sync>;

/// One call made against a [`ScriptedStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Search { index: String, body: Value },
    Count { index: String, body: Value },
    UpdateByQuery {
        index: String,
        body: Value,
        options: ByQueryOptions,
    },
    DeleteByQuery {
        index: String,
        body: Value,
        options: ByQueryOptions,
    },
    Reindex(ReindexRequest),
    TaskStatus(String),
    Refresh(String),
    CreateIndex { index: String, body: Value },
}

impl StoreCall {
    /// Whether the call dispatched work to the store.
    pub fn is_launch(&self) -> bool {
        matches!(
            self,
            StoreCall::UpdateByQuery { .. } | StoreCall::DeleteByQuery { .. } | StoreCall::Reindex(_)
        )
    }
}

enum NextLaunch {
    Failures(Vec<Value>),
    Error(String),
}

#[derive(Default)]
struct ScriptState {
    calls: Vec<StoreCall>,
    tasks: HashMap<String, TaskStatus>,
    next_task: u64,
    indices: BTreeMap<String, u32>,
    index_sizes: BTreeMap<String, u64>,
    free_bytes: u64,
    default_shards: u32,
    next_launch: Option<NextLaunch>,
    rejected_routings: BTreeSet<String>,
    failing_routings: BTreeSet<String>,
    count_error: Option<String>,
}

/// In-process [`DocumentStore`] driven by test scripts.
pub struct ScriptedStore {
    state: Mutex<ScriptState>,
    count_fn: Mutex<Option<CountFn>>,
    search_fn: Mutex<Option<SearchFn>>,
}

impl Default for ScriptedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                free_bytes: u64::MAX,
                default_shards: 5,
                ..ScriptState::default()
            }),
            count_fn: Mutex::new(None),
            search_fn: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer counts with `f(index, body)`. Unscripted counts return 0.
    pub fn on_count(&self, f: impl Fn(&str, &Value) -> u64 + Send + Sync + 'static) {
        *self.count_fn.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(f));
    }

    /// Answer searches with `f(index, body)`. Unscripted searches return no hits.
    pub fn on_search(&self, f: impl Fn(&str, &Value) -> SearchResponse + Send + Sync + 'static) {
        *self.search_fn.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(f));
    }

    /// Register an existing index with its shard count.
    pub fn add_index(&self, name: impl Into<String>, shards: u32) {
        self.state().indices.insert(name.into(), shards);
    }

    pub fn set_default_shards(&self, shards: u32) {
        self.state().default_shards = shards;
    }

    pub fn set_index_size(&self, index: impl Into<String>, bytes: u64) {
        self.state().index_sizes.insert(index.into(), bytes);
    }

    pub fn set_free_bytes(&self, bytes: u64) {
        self.state().free_bytes = bytes;
    }

    /// Make the next by-query launch answer with `failures` instead of a task.
    pub fn fail_next_launch(&self, failures: Vec<Value>) {
        self.state().next_launch = Some(NextLaunch::Failures(failures));
    }

    /// Make the next launch fail with a document store error.
    pub fn error_on_next_launch(&self, message: impl Into<String>) {
        self.state().next_launch = Some(NextLaunch::Error(message.into()));
    }

    /// Answer every by-query launch routed to `routing` with failures.
    pub fn reject_routing(&self, routing: impl Into<String>) {
        self.state().rejected_routings.insert(routing.into());
    }

    /// Fail every launch routed to `routing` with a document store error.
    pub fn error_on_routing(&self, routing: impl Into<String>) {
        self.state().failing_routings.insert(routing.into());
    }

    /// Fail every count with a document store error until cleared with `None`.
    pub fn set_count_error(&self, message: Option<String>) {
        self.state().count_error = message;
    }

    /// Insert a task with a given status.
    pub fn add_task(&self, status: TaskStatus) -> TaskHandle {
        let mut state = self.state();
        let handle = Self::next_handle(&mut state);
        state.tasks.insert(handle.to_string(), status);
        handle
    }

    pub fn complete_task(&self, task: &TaskHandle) {
        self.state()
            .tasks
            .insert(task.to_string(), TaskStatus::succeeded());
    }

    pub fn fail_task(&self, task: &TaskHandle, reason: &str) {
        self.state().tasks.insert(
            task.to_string(),
            TaskStatus {
                completed: true,
                response: super::types::TaskResponse {
                    failures: vec![json!({ "reason": reason })],
                    error: None,
                },
                error: None,
            },
        );
    }

    /// Drop a task so later lookups report it as not found.
    pub fn forget_task(&self, task: &TaskHandle) {
        self.state().tasks.remove(task.as_str());
    }

    /// Complete every running task.
    pub fn complete_all(&self) {
        for status in self.state().tasks.values_mut() {
            if !status.completed && status.error.is_none() {
                *status = TaskStatus::succeeded();
            }
        }
    }

    /// Handles of tasks that have not finished.
    pub fn running_tasks(&self) -> Vec<TaskHandle> {
        let mut running: Vec<TaskHandle> = self
            .state()
            .tasks
            .iter()
            .filter(|(_, status)| !status.completed && status.error.is_none())
            .map(|(id, _)| TaskHandle::new(id.clone()))
            .collect();
        running.sort_by_key(|handle| task_number(handle.as_str()));
        running
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state().calls.clone()
    }

    /// Only the calls that dispatched work.
    pub fn launches(&self) -> Vec<StoreCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.is_launch())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    fn next_handle(state: &mut ScriptState) -> TaskHandle {
        state.next_task += 1;
        TaskHandle::new(format!("task-{}", state.next_task))
    }

    fn launch(&self, call: StoreCall, routing: Option<&str>) -> Result<ByQueryResponse> {
        let mut state = self.state();
        state.calls.push(call);

        if let Some(routing) = routing {
            if state.failing_routings.contains(routing) {
                return Err(MigrationError::store(500, format!("shard for {} unavailable", routing)));
            }
            if state.rejected_routings.contains(routing) {
                return Ok(ByQueryResponse::failed(vec![json!({
                    "reason": format!("rejected routing {}", routing)
                })]));
            }
        }

        match state.next_launch.take() {
            Some(NextLaunch::Failures(failures)) => Ok(ByQueryResponse::failed(failures)),
            Some(NextLaunch::Error(message)) => Err(MigrationError::store(500, message)),
            None => {
                let handle = Self::next_handle(&mut state);
                state.tasks.insert(handle.to_string(), TaskStatus::running());
                Ok(ByQueryResponse::started(handle))
            }
        }
    }
}

fn task_number(id: &str) -> u64 {
    id.rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    async fn search(&self, index: &str, body: &Value) -> Result<SearchResponse> {
        self.state().calls.push(StoreCall::Search {
            index: index.to_string(),
            body: body.clone(),
        });
        let search_fn = self.search_fn.lock().unwrap_or_else(|e| e.into_inner());
        Ok(search_fn
            .as_ref()
            .map(|f| f(index, body))
            .unwrap_or_default())
    }

    async fn count(&self, index: &str, body: &Value) -> Result<u64> {
        {
            let mut state = self.state();
            state.calls.push(StoreCall::Count {
                index: index.to_string(),
                body: body.clone(),
            });
            if let Some(message) = &state.count_error {
                return Err(MigrationError::store(400, message.clone()));
            }
        }
        let count_fn = self.count_fn.lock().unwrap_or_else(|e| e.into_inner());
        Ok(count_fn.as_ref().map(|f| f(index, body)).unwrap_or(0))
    }

    async fn update_by_query(
        &self,
        index: &str,
        body: &Value,
        options: &ByQueryOptions,
    ) -> Result<ByQueryResponse> {
        self.launch(
            StoreCall::UpdateByQuery {
                index: index.to_string(),
                body: body.clone(),
                options: options.clone(),
            },
            options.routing.as_deref(),
        )
    }

    async fn delete_by_query(
        &self,
        index: &str,
        body: &Value,
        options: &ByQueryOptions,
    ) -> Result<ByQueryResponse> {
        self.launch(
            StoreCall::DeleteByQuery {
                index: index.to_string(),
                body: body.clone(),
                options: options.clone(),
            },
            options.routing.as_deref(),
        )
    }

    async fn reindex(&self, request: &ReindexRequest) -> Result<TaskHandle> {
        let response = self.launch(StoreCall::Reindex(request.clone()), None)?;
        match response.task {
            Some(task) => Ok(task),
            None => Err(MigrationError::DocumentStore {
                message: format!("Reindex rejected: {}", Value::Array(response.failures)),
                status: None,
            }),
        }
    }

    async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus> {
        let mut state = self.state();
        state.calls.push(StoreCall::TaskStatus(task.to_string()));
        state
            .tasks
            .get(task.as_str())
            .cloned()
            .ok_or_else(|| MigrationError::TaskNotFound {
                task_id: task.to_string(),
            })
    }

    async fn refresh_index(&self, index: &str) -> Result<()> {
        self.state().calls.push(StoreCall::Refresh(index.to_string()));
        Ok(())
    }

    async fn index_size_bytes(&self, index: &str) -> Result<u64> {
        Ok(self.state().index_sizes.get(index).copied().unwrap_or(0))
    }

    async fn cluster_free_size_bytes(&self) -> Result<u64> {
        Ok(self.state().free_bytes)
    }

    async fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        let mut state = self.state();
        state.calls.push(StoreCall::CreateIndex {
            index: index.to_string(),
            body: body.clone(),
        });
        let shards = body
            .pointer("/settings/number_of_shards")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(state.default_shards);
        state.indices.insert(index.to_string(), shards);
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.state().indices.contains_key(index))
    }

    async fn number_of_shards(&self, index: &str) -> Result<u32> {
        let state = self.state();
        Ok(state
            .indices
            .get(index)
            .copied()
            .unwrap_or(state.default_shards))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_creates_running_task() {
        let store = ScriptedStore::new();
        let response = store
            .update_by_query("gitlab-production", &json!({}), &ByQueryOptions::new())
            .await
            .unwrap();
        let task = response.task.unwrap();
        assert_eq!(task.as_str(), "task-1");
        assert!(!store.task_status(&task).await.unwrap().completed);

        store.complete_task(&task);
        assert!(store.task_status(&task).await.unwrap().completed);

        store.forget_task(&task);
        assert!(matches!(
            store.task_status(&task).await,
            Err(MigrationError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_scripted_errors() {
        let store = ScriptedStore::new();
        store.set_count_error(Some("search_phase_execution_exception".into()));
        assert!(store.count("gitlab-production", &json!({})).await.is_err());
        store.set_count_error(None);
        assert_eq!(store.count("gitlab-production", &json!({})).await.unwrap(), 0);

        store.error_on_routing("project_2");
        let routed = ByQueryOptions::new().with_routing("project_2");
        assert!(store
            .delete_by_query("gitlab-production", &json!({}), &routed)
            .await
            .is_err());
        assert_eq!(store.launches().len(), 1);
        assert!(store.running_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_next_launch_failures_apply_once() {
        let store = ScriptedStore::new();
        store.fail_next_launch(vec![json!("failed")]);

        let first = store
            .delete_by_query("gitlab-production", &json!({}), &ByQueryOptions::new())
            .await
            .unwrap();
        assert_eq!(first.failures, vec![json!("failed")]);

        let second = store
            .delete_by_query("gitlab-production", &json!({}), &ByQueryOptions::new())
            .await
            .unwrap();
        assert!(second.task.is_some());
        assert_eq!(store.launches().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_routing() {
        let store = ScriptedStore::new();
        store.reject_routing("project_7");

        let options = ByQueryOptions::new().with_routing("project_7");
        let response = store
            .update_by_query("gitlab-production", &json!({}), &options)
            .await
            .unwrap();
        assert!(response.task.is_none());
        assert!(store.running_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_running_tasks_ordered() {
        let store = ScriptedStore::new();
        for _ in 0..11 {
            store
                .update_by_query("gitlab-production", &json!({}), &ByQueryOptions::new())
                .await
                .unwrap();
        }
        let running = store.running_tasks();
        assert_eq!(running.len(), 11);
        assert_eq!(running[0].as_str(), "task-1");
        assert_eq!(running[10].as_str(), "task-11");

        store.complete_all();
        assert!(store.running_tasks().is_empty());
    }
}
