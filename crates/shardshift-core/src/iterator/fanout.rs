//! Per-entity fan-out.
//!
//! Keeps a bounded set of entity-scoped tasks in flight. Each tick polls the
//! set, drops whatever finished or vanished, and refills free slots with
//! entities that still have matching documents. Entities missing from the
//! source of truth are handed to orphan cleanup instead of blocking the
//! migration.

use crate::batch::{BatchController, Disposition};
use crate::config::MigrationDefaults;
use crate::error::{MigrationError, Result};
use crate::migration::MigrationContext;
use crate::store::{
    poll_task, refreshed_count, ByQueryResponse, DocumentStore, TaskHandle, TaskPoll,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::{debug, info, warn};

const CANDIDATES_AGG: &str = "entity_ids";

/// One entity with a task in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInProgress {
    #[serde(rename = "project_id")]
    pub entity_id: u64,
    pub task_id: TaskHandle,
}

/// Checkpoint view for fan-out migrations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanOutState {
    #[serde(default, rename = "projects_in_progress")]
    pub in_progress: Vec<EntityInProgress>,
    #[serde(default)]
    pub remaining_count: Option<u64>,
    /// Entities already handed to orphan cleanup; never candidates again.
    #[serde(default, rename = "orphans_scheduled")]
    pub orphans: Vec<u64>,
}

/// An entity as known to the source of truth.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: u64,
    pub attributes: Map<String, Value>,
}

impl EntityRecord {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Looks entities up in the source of truth.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    /// `Ok(None)` (or `Err(EntityNotFound)`) when the entity no longer exists.
    async fn resolve(
        &self,
        store: &dyn DocumentStore,
        entity_id: u64,
    ) -> Result<Option<EntityRecord>>;
}

/// Queries and per-entity work behind a fan-out migration.
#[async_trait]
pub trait FanOutPlan: Send + Sync {
    fn index_name(&self) -> &str;

    /// Documents still needing the change.
    fn remaining_query(&self) -> Value;

    /// Document field holding the entity id.
    fn entity_field(&self) -> &str;

    fn resolver(&self) -> &dyn EntityResolver;

    /// Dispatch the scoped work for one entity.
    async fn launch(
        &self,
        store: &dyn DocumentStore,
        entity: &EntityRecord,
        max_docs: u64,
    ) -> Result<ByQueryResponse>;
}

/// Drives a [`FanOutPlan`] one tick at a time.
#[derive(Debug, Clone)]
pub struct FanOutController {
    batch: BatchController,
    max_entities: usize,
}

impl FanOutController {
    pub fn new(batch: BatchController) -> Self {
        Self {
            batch,
            max_entities: MigrationDefaults::MAX_ENTITIES_TO_PROCESS,
        }
    }

    pub fn with_max_entities(mut self, max_entities: usize) -> Self {
        self.max_entities = max_entities.max(1);
        self
    }

    pub fn max_entities(&self) -> usize {
        self.max_entities
    }

    pub async fn step(
        &self,
        plan: &dyn FanOutPlan,
        ctx: &mut MigrationContext<'_>,
    ) -> Result<Disposition> {
        let identity = ctx.identity();
        let store = ctx.store();
        let index = plan.index_name();
        let mut state: FanOutState = ctx.checkpoint().decode()?;

        let mut finished = 0usize;
        let mut still_running = Vec::with_capacity(state.in_progress.len());
        for entry in std::mem::take(&mut state.in_progress) {
            match poll_task(store, &entry.task_id).await? {
                TaskPoll::Running => still_running.push(entry),
                TaskPoll::Succeeded => {
                    debug!(
                        "[migration {}] Entity {} finished (task {})",
                        identity, entry.entity_id, entry.task_id
                    );
                    finished += 1;
                }
                TaskPoll::Failed(reason) => {
                    warn!(
                        "[migration {}] Task {} for entity {} failed: {}",
                        identity, entry.task_id, entry.entity_id, reason
                    );
                    finished += 1;
                }
                TaskPoll::NotFound => {
                    warn!(
                        "[migration {}] Task {} for entity {} not found, dropping",
                        identity, entry.task_id, entry.entity_id
                    );
                    finished += 1;
                }
            }
        }
        state.in_progress = still_running;

        let remaining = refreshed_count(store, index, &plan.remaining_query()).await?;
        state.remaining_count = Some(remaining);

        if remaining == 0 && state.in_progress.is_empty() {
            ctx.checkpoint_mut().encode(&state)?;
            info!("[migration {}] No documents remaining", identity);
            return Ok(Disposition::Completed);
        }

        let shards = store.number_of_shards(index).await? as usize;
        let cap = shards.min(self.max_entities).max(1);
        let free_slots = cap.saturating_sub(state.in_progress.len());

        let mut launched = 0usize;
        if free_slots > 0 && remaining > 0 {
            let excluded: HashSet<u64> = state
                .in_progress
                .iter()
                .map(|e| e.entity_id)
                .chain(state.orphans.iter().copied())
                .collect();
            let candidates = self
                .find_candidates(store, plan, &excluded, free_slots * 2)
                .await?;

            // Launches of this tick are only recorded in `state`; per-entity
            // errors are logged and skipped, never returned.
            for entity_id in candidates {
                if launched >= free_slots {
                    break;
                }

                let entity = match plan.resolver().resolve(store, entity_id).await {
                    Ok(Some(entity)) => entity,
                    Ok(None) | Err(MigrationError::EntityNotFound { .. }) => {
                        warn!(
                            "[migration {}] Entity {} not found, scheduling orphan cleanup",
                            identity, entity_id
                        );
                        match ctx.cleanup().schedule(entity_id).await {
                            Ok(()) => state.orphans.push(entity_id),
                            Err(e) => warn!(
                                "[migration {}] Could not schedule cleanup for entity {}: {}",
                                identity, entity_id, e
                            ),
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            "[migration {}] Failed to resolve entity {}, skipping: {}",
                            identity, entity_id, e
                        );
                        continue;
                    }
                };

                let response = match plan.launch(store, &entity, self.batch.batch_size()).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(
                            "[migration {}] Launch for entity {} failed, skipping: {}",
                            identity, entity_id, e
                        );
                        continue;
                    }
                };
                match response.task {
                    Some(task) => {
                        debug!(
                            "[migration {}] Launched task {} for entity {}",
                            identity, task, entity_id
                        );
                        state.in_progress.push(EntityInProgress {
                            entity_id,
                            task_id: task,
                        });
                        launched += 1;
                    }
                    None => {
                        let failures = Value::Array(response.failures);
                        warn!(
                            "[migration {}] Launch for entity {} returned failures: {}",
                            identity, entity_id, failures
                        );
                    }
                }
            }
        }

        ctx.checkpoint_mut().encode(&state)?;
        info!(
            "[migration {}] {} entities in progress ({} launched, {} finished), {} documents remaining",
            identity,
            state.in_progress.len(),
            launched,
            finished,
            remaining
        );

        Ok(if launched > 0 {
            Disposition::Started
        } else if finished > 0 {
            Disposition::SliceOrTaskCompleted
        } else {
            Disposition::InProgress
        })
    }

    /// Distinct entity ids with remaining documents, excluding `exclude`.
    async fn find_candidates(
        &self,
        store: &dyn DocumentStore,
        plan: &dyn FanOutPlan,
        exclude: &HashSet<u64>,
        limit: usize,
    ) -> Result<Vec<u64>> {
        let field = plan.entity_field();
        let mut excluded: Vec<u64> = exclude.iter().copied().collect();
        excluded.sort_unstable();

        let mut terms = Map::new();
        terms.insert(field.to_string(), json!(excluded));

        let body = json!({
            "size": 0,
            "query": {
                "bool": {
                    "filter": [plan.remaining_query()],
                    "must_not": [{ "terms": terms }]
                }
            },
            "aggs": {
                CANDIDATES_AGG: { "terms": { "field": field, "size": limit } }
            }
        });

        let response = store.search(plan.index_name(), &body).await?;
        let ids = response
            .aggregations
            .as_ref()
            .and_then(|aggs| aggs.pointer(&format!("/{}/buckets", CANDIDATES_AGG)))
            .and_then(Value::as_array)
            .map(|buckets| {
                buckets
                    .iter()
                    .filter_map(|bucket| bucket.get("key").and_then(Value::as_u64))
                    .filter(|id| !exclude.contains(id))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MigrationOptions;
    use crate::checkpoint::Checkpoint;
    use crate::cleanup::RecordingOrphanCleanup;
    use crate::identity::MigrationIdentity;
    use crate::store::{ByQueryOptions, ScriptedStore, SearchResponse, StoreCall, TaskStatus};
    use std::collections::BTreeSet;

    struct KnownProjects {
        existing: BTreeSet<u64>,
    }

    #[async_trait]
    impl EntityResolver for KnownProjects {
        async fn resolve(
            &self,
            _store: &dyn DocumentStore,
            entity_id: u64,
        ) -> Result<Option<EntityRecord>> {
            Ok(self
                .existing
                .contains(&entity_id)
                .then(|| EntityRecord::new(entity_id).with_attribute("visibility_level", 20)))
        }
    }

    struct BackfillPlan {
        resolver: KnownProjects,
        broken: Option<u64>,
    }

    #[async_trait]
    impl FanOutPlan for BackfillPlan {
        fn index_name(&self) -> &str {
            "gitlab-production"
        }

        fn remaining_query(&self) -> Value {
            json!({ "bool": { "must_not": { "exists": { "field": "visibility_level" } } } })
        }

        fn entity_field(&self) -> &str {
            "project_id"
        }

        fn resolver(&self) -> &dyn EntityResolver {
            &self.resolver
        }

        async fn launch(
            &self,
            store: &dyn DocumentStore,
            entity: &EntityRecord,
            max_docs: u64,
        ) -> Result<ByQueryResponse> {
            if self.broken == Some(entity.id) {
                return Err(MigrationError::DocumentStore {
                    message: format!("es_rejected_execution_exception for project {}", entity.id),
                    status: Some(429),
                });
            }
            store
                .update_by_query(
                    self.index_name(),
                    &json!({ "query": { "term": { "project_id": entity.id } } }),
                    &ByQueryOptions::new()
                        .with_max_docs(max_docs)
                        .with_routing(format!("project_{}", entity.id)),
                )
                .await
        }
    }

    fn plan(existing: impl IntoIterator<Item = u64>) -> BackfillPlan {
        BackfillPlan {
            resolver: KnownProjects {
                existing: existing.into_iter().collect(),
            },
            broken: None,
        }
    }

    fn buckets(ids: impl IntoIterator<Item = u64>) -> SearchResponse {
        let buckets: Vec<Value> = ids
            .into_iter()
            .map(|id| json!({ "key": id, "doc_count": 1 }))
            .collect();
        SearchResponse {
            total: 0,
            hits: Vec::new(),
            aggregations: Some(json!({ "entity_ids": { "buckets": buckets } })),
        }
    }

    async fn step(
        store: &ScriptedStore,
        cleanup: &RecordingOrphanCleanup,
        plan: &BackfillPlan,
        checkpoint: Checkpoint,
    ) -> (Result<Disposition>, Checkpoint) {
        let identity = MigrationIdentity::new(20230518135700, "backfill_project_visibility");
        let controller = FanOutController::new(BatchController::new(&MigrationOptions::default()));
        let mut ctx = MigrationContext::new(&identity, store, cleanup, checkpoint);
        let result = controller.step(plan, &mut ctx).await;
        (result, ctx.into_checkpoint())
    }

    #[tokio::test]
    async fn test_launches_up_to_shard_count() {
        let store = ScriptedStore::new();
        store.add_index("gitlab-production", 3);
        store.on_count(|_, _| 100);
        store.on_search(|_, _| buckets(1..=6));
        let cleanup = RecordingOrphanCleanup::new();

        let (result, checkpoint) = step(&store, &cleanup, &plan(1..=6), Checkpoint::new()).await;
        assert_eq!(result.unwrap(), Disposition::Started);

        let state: FanOutState = checkpoint.decode().unwrap();
        let ids: Vec<u64> = state.in_progress.iter().map(|e| e.entity_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(state.remaining_count, Some(100));
        assert_eq!(checkpoint.get("projects_in_progress").unwrap()[0]["project_id"], 1);
    }

    #[tokio::test]
    async fn test_missing_entity_goes_to_cleanup() {
        let store = ScriptedStore::new();
        store.add_index("gitlab-production", 2);
        store.on_count(|_, _| 10);
        store.on_search(|_, _| buckets([7, 8, 9]));
        let cleanup = RecordingOrphanCleanup::new();

        let (result, checkpoint) = step(&store, &cleanup, &plan([8, 9]), Checkpoint::new()).await;
        assert_eq!(result.unwrap(), Disposition::Started);
        assert_eq!(cleanup.scheduled(), vec![7]);

        let state: FanOutState = checkpoint.decode().unwrap();
        let ids: Vec<u64> = state.in_progress.iter().map(|e| e.entity_id).collect();
        assert_eq!(ids, vec![8, 9]);
    }

    #[tokio::test]
    async fn test_failed_launch_is_not_recorded() {
        let store = ScriptedStore::new();
        store.add_index("gitlab-production", 2);
        store.on_count(|_, _| 10);
        store.on_search(|_, _| buckets([1, 2, 3]));
        store.reject_routing("project_1");
        let cleanup = RecordingOrphanCleanup::new();

        let (result, checkpoint) =
            step(&store, &cleanup, &plan([1, 2, 3]), Checkpoint::new()).await;
        assert_eq!(result.unwrap(), Disposition::Started);

        let state: FanOutState = checkpoint.decode().unwrap();
        let ids: Vec<u64> = state.in_progress.iter().map(|e| e.entity_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_launch_error_keeps_earlier_launches() {
        let store = ScriptedStore::new();
        store.add_index("gitlab-production", 5);
        store.on_count(|_, _| 10);
        store.on_search(|_, _| buckets([1, 2, 3]));
        let cleanup = RecordingOrphanCleanup::new();
        let mut plan = plan([1, 2, 3]);
        plan.broken = Some(2);

        let (result, checkpoint) = step(&store, &cleanup, &plan, Checkpoint::new()).await;
        assert_eq!(result.unwrap(), Disposition::Started);

        let state: FanOutState = checkpoint.decode().unwrap();
        let ids: Vec<u64> = state.in_progress.iter().map(|e| e.entity_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(store.launches().len(), 2);
    }

    #[tokio::test]
    async fn test_orphan_scheduled_once() {
        let store = ScriptedStore::new();
        store.add_index("gitlab-production", 2);
        store.on_count(|_, _| 10);
        store.on_search(|_, _| buckets([7]));
        let cleanup = RecordingOrphanCleanup::new();
        let plan = plan(Vec::new());

        let (result, checkpoint) = step(&store, &cleanup, &plan, Checkpoint::new()).await;
        assert_eq!(result.unwrap(), Disposition::InProgress);
        let state: FanOutState = checkpoint.decode().unwrap();
        assert_eq!(state.orphans, vec![7]);

        store.clear_calls();
        let (result, _) = step(&store, &cleanup, &plan, checkpoint).await;
        assert_eq!(result.unwrap(), Disposition::InProgress);
        assert_eq!(cleanup.scheduled(), vec![7]);

        let search = store
            .calls()
            .into_iter()
            .find_map(|call| match call {
                StoreCall::Search { body, .. } => Some(body),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            search["query"]["bool"]["must_not"][0]["terms"]["project_id"],
            json!([7])
        );
    }

    #[tokio::test]
    async fn test_finished_and_missing_tasks_are_dropped() {
        let store = ScriptedStore::new();
        store.add_index("gitlab-production", 1);
        store.on_count(|_, _| 10);
        let done = store.add_task(TaskStatus::succeeded());

        let mut checkpoint = Checkpoint::new();
        checkpoint
            .encode(&FanOutState {
                in_progress: vec![
                    EntityInProgress {
                        entity_id: 4,
                        task_id: done,
                    },
                    EntityInProgress {
                        entity_id: 5,
                        task_id: TaskHandle::new("forgotten"),
                    },
                ],
                remaining_count: Some(10),
                ..Default::default()
            })
            .unwrap();

        let cleanup = RecordingOrphanCleanup::new();
        let (result, checkpoint) = step(&store, &cleanup, &plan(Vec::new()), checkpoint).await;
        assert_eq!(result.unwrap(), Disposition::SliceOrTaskCompleted);

        let state: FanOutState = checkpoint.decode().unwrap();
        assert!(state.in_progress.is_empty());
    }

    #[tokio::test]
    async fn test_search_excludes_in_progress() {
        let store = ScriptedStore::new();
        store.add_index("gitlab-production", 2);
        store.on_count(|_, _| 10);
        let running = store.add_task(TaskStatus::running());

        let mut checkpoint = Checkpoint::new();
        checkpoint
            .encode(&FanOutState {
                in_progress: vec![EntityInProgress {
                    entity_id: 11,
                    task_id: running,
                }],
                remaining_count: None,
                ..Default::default()
            })
            .unwrap();

        let cleanup = RecordingOrphanCleanup::new();
        let (result, _) = step(&store, &cleanup, &plan(Vec::new()), checkpoint).await;
        assert_eq!(result.unwrap(), Disposition::InProgress);

        let search = store
            .calls()
            .into_iter()
            .find_map(|call| match call {
                StoreCall::Search { body, .. } => Some(body),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            search["query"]["bool"]["must_not"][0]["terms"]["project_id"],
            json!([11])
        );
        assert_eq!(search["aggs"]["entity_ids"]["terms"]["size"], 2);
    }

    #[tokio::test]
    async fn test_completes_when_nothing_remains() {
        let store = ScriptedStore::new();
        let cleanup = RecordingOrphanCleanup::new();

        let (result, checkpoint) = step(&store, &cleanup, &plan(Vec::new()), Checkpoint::new()).await;
        assert_eq!(result.unwrap(), Disposition::Completed);
        assert_eq!(checkpoint.get_u64("remaining_count"), Some(0));
        assert!(store.launches().is_empty());
    }
}
