//! Slice-by-slice copy into a new index.

use crate::batch::{BatchController, Disposition, MigrationOptions};
use crate::error::Result;
use crate::identity::MigrationIdentity;
use crate::iterator::{SliceIterator, SlicePlan, SliceState};
use crate::migration::{Migration, MigrationContext};
use crate::store::{refreshed_count, DocumentStore, IndexTarget, ReindexRequest, TaskHandle};
use async_trait::async_trait;
use futures::future::try_join;
use serde_json::{json, Value};
use tracing::info;

/// Reindex `source` into a freshly created `destination`.
pub struct ReindexToIndex {
    identity: MigrationIdentity,
    options: MigrationOptions,
    source: String,
    destination: String,
    index_body: Option<Value>,
    query: Option<Value>,
    script: Option<Value>,
    obsolete: bool,
    iterator: SliceIterator,
}

impl ReindexToIndex {
    /// Batched, pauses indexing, and checks free space before starting.
    pub fn default_options() -> MigrationOptions {
        MigrationOptions::new()
            .batched()
            .pause_indexing()
            .space_requirements()
    }

    pub fn new(
        identity: MigrationIdentity,
        options: MigrationOptions,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        let iterator = SliceIterator::new(BatchController::new(&options));
        Self {
            identity,
            options,
            source: source.into(),
            destination: destination.into(),
            index_body: None,
            query: None,
            script: None,
            obsolete: false,
            iterator,
        }
    }

    pub fn with_index_body(mut self, body: Option<Value>) -> Self {
        self.index_body = body;
        self
    }

    pub fn with_query(mut self, query: Option<Value>) -> Self {
        self.query = query;
        self
    }

    pub fn with_script(mut self, script: Option<Value>) -> Self {
        self.script = script;
        self
    }

    pub fn with_obsolete(mut self, obsolete: bool) -> Self {
        self.obsolete = obsolete;
        self
    }

    fn source_query(&self) -> Value {
        self.query.clone().unwrap_or_else(|| json!({ "match_all": {} }))
    }
}

#[async_trait]
impl SlicePlan for ReindexToIndex {
    async fn setup(&self, store: &dyn DocumentStore) -> Result<u32> {
        store
            .create_standalone_indices(&[IndexTarget {
                name: self.destination.clone(),
                body: self.index_body.clone().unwrap_or_else(|| json!({})),
            }])
            .await?;
        let shards = store.number_of_shards(&self.source).await?;
        info!(
            "[migration {}] Created {} for {} slices of {}",
            self.identity, self.destination, shards, self.source
        );
        Ok(shards)
    }

    async fn launch_slice(
        &self,
        store: &dyn DocumentStore,
        slice: u32,
        max_slices: u32,
    ) -> Result<TaskHandle> {
        store
            .reindex(&ReindexRequest {
                source: self.source.clone(),
                dest: self.destination.clone(),
                slice,
                max_slices,
                query: self.query.clone(),
                script: self.script.clone(),
            })
            .await
    }
}

#[async_trait]
impl Migration for ReindexToIndex {
    fn identity(&self) -> &MigrationIdentity {
        &self.identity
    }

    fn options(&self) -> &MigrationOptions {
        &self.options
    }

    async fn migrate(&self, ctx: &mut MigrationContext<'_>) -> Result<Disposition> {
        self.iterator.step(self, ctx).await
    }

    /// Every slice copied and both sides hold the same number of documents.
    async fn completed(&self, ctx: &MigrationContext<'_>) -> Result<bool> {
        let state: SliceState = ctx.checkpoint().decode()?;
        if !state.done() {
            return Ok(false);
        }

        let store = ctx.store();
        let query = self.source_query();
        let match_all = json!({ "match_all": {} });
        let (source, destination) = try_join(
            refreshed_count(store, &self.source, &query),
            refreshed_count(store, &self.destination, &match_all),
        )
        .await?;
        info!(
            "[migration {}] {} documents in {}, {} in {}",
            self.identity, source, self.source, destination, self.destination
        );
        Ok(source == destination)
    }

    async fn space_required_bytes(&self, store: &dyn DocumentStore) -> Result<u64> {
        store.index_size_bytes(&self.source).await
    }

    fn obsolete(&self) -> bool {
        self.obsolete
    }
}
