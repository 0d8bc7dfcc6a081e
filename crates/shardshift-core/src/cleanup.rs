//! Orphan cleanup side channel.
//!
//! When a fan-out migration finds documents for an entity that no longer
//! exists, it hands the id to an [`OrphanCleanup`] instead of failing. The
//! queue variant deletes the orphaned documents in the background.

use crate::config::CleanupTarget;
use crate::error::{MigrationError, Result};
use crate::store::{ByQueryOptions, DynDocumentStore};
use async_trait::async_trait;
use serde_json::{json, Map};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives ids of entities whose documents should be removed.
#[async_trait]
pub trait OrphanCleanup: Send + Sync {
    async fn schedule(&self, entity_id: u64) -> Result<()>;
}

/// Keeps scheduled ids in memory. Used when no cleanup target is configured
/// and in tests.
#[derive(Debug, Default)]
pub struct RecordingOrphanCleanup {
    scheduled: Mutex<Vec<u64>>,
}

impl RecordingOrphanCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<u64> {
        self.scheduled
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

#[async_trait]
impl OrphanCleanup for RecordingOrphanCleanup {
    async fn schedule(&self, entity_id: u64) -> Result<()> {
        debug!("Recorded orphan cleanup for entity {}", entity_id);
        self.scheduled
            .lock()
            .map_err(|e| MigrationError::Other(format!("Cleanup log poisoned: {}", e)))?
            .push(entity_id);
        Ok(())
    }
}

/// Background deletion queue.
///
/// Each scheduled id becomes a `delete_by_query` on the target index,
/// matching `entity_field = id` and routed by `routing_prefix + id`.
#[derive(Debug, Clone)]
pub struct OrphanCleanupQueue {
    sender: mpsc::UnboundedSender<u64>,
}

impl OrphanCleanupQueue {
    /// Start the consumer task. It stops once every queue clone is dropped.
    pub fn spawn(store: DynDocumentStore, target: CleanupTarget) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<u64>();

        let handle = tokio::spawn(async move {
            while let Some(entity_id) = receiver.recv().await {
                if let Err(e) = delete_entity_documents(store.as_ref(), &target, entity_id).await {
                    warn!(
                        "Orphan cleanup for entity {} in {} failed: {}",
                        entity_id, target.index, e
                    );
                }
            }
            debug!("Orphan cleanup queue closed");
        });

        (Self { sender }, handle)
    }
}

#[async_trait]
impl OrphanCleanup for OrphanCleanupQueue {
    async fn schedule(&self, entity_id: u64) -> Result<()> {
        self.sender
            .send(entity_id)
            .map_err(|_| MigrationError::Other("Orphan cleanup queue is closed".into()))
    }
}

async fn delete_entity_documents(
    store: &dyn crate::store::DocumentStore,
    target: &CleanupTarget,
    entity_id: u64,
) -> Result<()> {
    let mut term = Map::new();
    term.insert(target.entity_field.clone(), json!(entity_id));
    let body = json!({ "query": { "term": term } });
    let mut options = ByQueryOptions::new();
    if let Some(prefix) = &target.routing_prefix {
        options = options.with_routing(format!("{}{}", prefix, entity_id));
    }

    let response = store.delete_by_query(&target.index, &body, &options).await?;
    match response.task {
        Some(task) => {
            info!(
                "Deleting orphaned documents of entity {} from {} (task {})",
                entity_id, target.index, task
            );
            Ok(())
        }
        None => Err(MigrationError::DocumentStore {
            message: format!(
                "delete_by_query rejected: {}",
                serde_json::Value::Array(response.failures)
            ),
            status: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ScriptedStore, StoreCall};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_recording_cleanup() {
        let cleanup = RecordingOrphanCleanup::new();
        cleanup.schedule(3).await.unwrap();
        cleanup.schedule(9).await.unwrap();
        assert_eq!(cleanup.scheduled(), vec![3, 9]);
    }

    #[tokio::test]
    async fn test_queue_issues_routed_delete() {
        let store = Arc::new(ScriptedStore::new());
        let (queue, handle) = OrphanCleanupQueue::spawn(
            store.clone(),
            CleanupTarget {
                index: "gitlab-production".into(),
                entity_field: "project_id".into(),
                routing_prefix: Some("project_".into()),
            },
        );

        queue.schedule(42).await.unwrap();
        drop(queue);
        handle.await.unwrap();

        let launches = store.launches();
        assert_eq!(launches.len(), 1);
        match &launches[0] {
            StoreCall::DeleteByQuery {
                index,
                body,
                options,
            } => {
                assert_eq!(index, "gitlab-production");
                assert_eq!(body["query"]["term"]["project_id"], 42);
                assert_eq!(options.routing.as_deref(), Some("project_42"));
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_queue_reports_error() {
        let store = Arc::new(ScriptedStore::new());
        let (queue, handle) = OrphanCleanupQueue::spawn(
            store,
            CleanupTarget {
                index: "gitlab-production".into(),
                entity_field: "project_id".into(),
                routing_prefix: None,
            },
        );
        handle.abort();
        let _ = handle.await;

        assert!(queue.schedule(1).await.is_err());
    }
}
