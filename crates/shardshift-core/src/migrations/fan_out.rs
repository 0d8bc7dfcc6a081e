//! Entity-scoped update or delete, one by-query task per entity.

use crate::batch::{BatchController, Disposition, MigrationOptions};
use crate::error::Result;
use crate::identity::MigrationIdentity;
use crate::iterator::{EntityRecord, EntityResolver, FanOutController, FanOutPlan};
use crate::migration::{Migration, MigrationContext};
use crate::store::{refreshed_count, ByQueryOptions, ByQueryResponse, DocumentStore};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

/// What happens to an entity's matching documents.
#[derive(Debug, Clone, PartialEq)]
pub enum FanOutAction {
    /// Run `script`; the entity's attributes are passed as `params.entity`.
    Update { script: Value },
    Delete,
}

/// Resolves entities by `id` in a document index holding one document per
/// entity.
#[derive(Debug, Clone)]
pub struct IndexEntityResolver {
    index: String,
}

impl IndexEntityResolver {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }
}

#[async_trait]
impl EntityResolver for IndexEntityResolver {
    async fn resolve(
        &self,
        store: &dyn DocumentStore,
        entity_id: u64,
    ) -> Result<Option<EntityRecord>> {
        let body = json!({
            "size": 1,
            "query": { "term": { "id": entity_id } }
        });
        let response = store.search(&self.index, &body).await?;

        Ok(response.hits.into_iter().next().map(|hit| {
            let attributes = match hit.source {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            EntityRecord {
                id: entity_id,
                attributes,
            }
        }))
    }
}

/// Update or delete the documents of each entity matching `filter`.
pub struct FanOutMigration {
    identity: MigrationIdentity,
    options: MigrationOptions,
    index: String,
    filter: Value,
    entity_field: String,
    action: FanOutAction,
    resolver: IndexEntityResolver,
    routing_prefix: Option<String>,
    obsolete: bool,
    controller: FanOutController,
}

impl FanOutMigration {
    /// Batched, and failures count against the retry ceiling.
    pub fn default_options() -> MigrationOptions {
        MigrationOptions::new().batched().retry_on_failure()
    }

    pub fn new(
        identity: MigrationIdentity,
        options: MigrationOptions,
        index: impl Into<String>,
        filter: Value,
        entity_field: impl Into<String>,
        action: FanOutAction,
        resolver: IndexEntityResolver,
    ) -> Self {
        let controller = FanOutController::new(BatchController::new(&options));
        Self {
            identity,
            options,
            index: index.into(),
            filter,
            entity_field: entity_field.into(),
            action,
            resolver,
            routing_prefix: None,
            obsolete: false,
            controller,
        }
    }

    /// Route each entity's calls to `{prefix}{id}`.
    pub fn with_routing_prefix(mut self, prefix: Option<String>) -> Self {
        self.routing_prefix = prefix;
        self
    }

    pub fn with_max_entities(mut self, max_entities: Option<usize>) -> Self {
        if let Some(max) = max_entities {
            self.controller = self.controller.with_max_entities(max);
        }
        self
    }

    pub fn with_obsolete(mut self, obsolete: bool) -> Self {
        self.obsolete = obsolete;
        self
    }

    fn entity_query(&self, entity_id: u64) -> Value {
        let mut term = Map::new();
        term.insert(self.entity_field.clone(), json!(entity_id));
        json!({
            "bool": {
                "filter": [self.filter.clone(), { "term": term }]
            }
        })
    }

    fn entity_script(script: &Value, entity: &EntityRecord) -> Value {
        let mut script = match script {
            Value::String(source) => json!({ "lang": "painless", "source": source }),
            other => other.clone(),
        };
        if let Value::Object(fields) = &mut script {
            let params = fields
                .entry("params")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(params) = params {
                params.insert("entity".to_string(), Value::Object(entity.attributes.clone()));
            }
        }
        script
    }
}

#[async_trait]
impl FanOutPlan for FanOutMigration {
    fn index_name(&self) -> &str {
        &self.index
    }

    fn remaining_query(&self) -> Value {
        self.filter.clone()
    }

    fn entity_field(&self) -> &str {
        &self.entity_field
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
        let mut options = ByQueryOptions::new().with_max_docs(max_docs);
        if let Some(prefix) = &self.routing_prefix {
            options = options.with_routing(format!("{}{}", prefix, entity.id));
        }

        let query = self.entity_query(entity.id);
        match &self.action {
            FanOutAction::Update { script } => {
                let body = json!({
                    "query": query,
                    "script": Self::entity_script(script, entity)
                });
                store.update_by_query(&self.index, &body, &options).await
            }
            FanOutAction::Delete => {
                store
                    .delete_by_query(&self.index, &json!({ "query": query }), &options)
                    .await
            }
        }
    }
}

#[async_trait]
impl Migration for FanOutMigration {
    fn identity(&self) -> &MigrationIdentity {
        &self.identity
    }

    fn options(&self) -> &MigrationOptions {
        &self.options
    }

    async fn migrate(&self, ctx: &mut MigrationContext<'_>) -> Result<Disposition> {
        self.controller.step(self, ctx).await
    }

    async fn completed(&self, ctx: &MigrationContext<'_>) -> Result<bool> {
        let remaining = refreshed_count(ctx.store(), &self.index, &self.filter).await?;
        Ok(remaining == 0)
    }

    fn obsolete(&self) -> bool {
        self.obsolete
    }
}
