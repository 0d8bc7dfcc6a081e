//! Document store client abstraction.
//!
//! The migration engine talks to the search cluster only through
//! [`DocumentStore`]. Mutating calls are dispatched asynchronously and return a
//! [`TaskHandle`]; the engine polls the handle on later ticks instead of
//! blocking.

mod elastic;
#[cfg(any(test, feature = "testing"))]
mod scripted;
mod types;

pub use elastic::ElasticClient;
#[cfg(any(test, feature = "testing"))]
pub use scripted::{ScriptedStore, StoreCall};
pub use types::{
    ByQueryOptions, ByQueryResponse, Conflicts, IndexTarget, ReindexRequest, SearchHit,
    SearchResponse, TaskHandle, TaskResponse, TaskStatus,
};

use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Client for the search cluster.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn search(&self, index: &str, body: &Value) -> Result<SearchResponse>;

    async fn count(&self, index: &str, body: &Value) -> Result<u64>;

    async fn update_by_query(
        &self,
        index: &str,
        body: &Value,
        options: &ByQueryOptions,
    ) -> Result<ByQueryResponse>;

    async fn delete_by_query(
        &self,
        index: &str,
        body: &Value,
        options: &ByQueryOptions,
    ) -> Result<ByQueryResponse>;

    /// Start one slice of a reindex without waiting for it.
    async fn reindex(&self, request: &ReindexRequest) -> Result<TaskHandle>;

    /// Look up a task.
    ///
    /// Must fail with [`MigrationError::TaskNotFound`] when the store no longer
    /// knows the task.
    async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus>;

    /// Make recent writes visible to counts and searches.
    async fn refresh_index(&self, index: &str) -> Result<()>;

    async fn index_size_bytes(&self, index: &str) -> Result<u64>;

    async fn cluster_free_size_bytes(&self) -> Result<u64>;

    async fn create_index(&self, index: &str, body: &Value) -> Result<()>;

    async fn index_exists(&self, index: &str) -> Result<bool>;

    async fn number_of_shards(&self, index: &str) -> Result<u32>;

    /// Create several indices, skipping ones that already exist.
    async fn create_standalone_indices(&self, targets: &[IndexTarget]) -> Result<()> {
        for target in targets {
            if !self.index_exists(&target.name).await? {
                self.create_index(&target.name, &target.body).await?;
            }
        }
        Ok(())
    }
}

/// Shared handle to a document store.
pub type DynDocumentStore = Arc<dyn DocumentStore>;

/// Outcome of polling a task handle once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    Running,
    Succeeded,
    Failed(String),
    /// The store forgot the task (expired from its task history).
    NotFound,
}

/// Poll a task, folding not-found into [`TaskPoll::NotFound`].
///
/// Any other lookup error propagates.
pub async fn poll_task(store: &dyn DocumentStore, task: &TaskHandle) -> Result<TaskPoll> {
    match store.task_status(task).await {
        Ok(status) => Ok(match status.failure_reason() {
            Some(reason) => TaskPoll::Failed(reason),
            None if status.completed => TaskPoll::Succeeded,
            None => TaskPoll::Running,
        }),
        Err(MigrationError::TaskNotFound { .. }) => Ok(TaskPoll::NotFound),
        Err(e) => Err(e),
    }
}

/// Refresh `index`, then count the documents matching `query`.
///
/// Counting against an unrefreshed index undercounts recent writes, so every
/// completion or remaining-work check goes through here.
pub async fn refreshed_count(store: &dyn DocumentStore, index: &str, query: &Value) -> Result<u64> {
    store.refresh_index(index).await?;
    store
        .count(index, &serde_json::json!({ "query": query }))
        .await
}
