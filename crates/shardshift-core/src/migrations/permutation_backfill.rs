//! Backfill document fields one value combination at a time.
//!
//! For every combination of target values, documents that are missing any
//! target field and whose source fields (on the document itself or on its
//! join parent) hold that combination get the values written in.

use crate::batch::{BatchController, Disposition, MigrationOptions};
use crate::error::{MigrationError, Result};
use crate::identity::MigrationIdentity;
use crate::iterator::{
    AttributeDomain, Permutation, PermutationIterator, PermutationMatrix, PermutationPlan,
};
use crate::migration::{Migration, MigrationContext};
use crate::store::refreshed_count;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// One backfilled field and its possible values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillDomain {
    /// Field written on the document.
    pub field: String,
    /// Field the value is read from; defaults to `field`.
    #[serde(default)]
    pub source_field: Option<String>,
    pub values: Vec<i64>,
}

impl BackfillDomain {
    pub fn new(field: impl Into<String>, values: impl IntoIterator<Item = i64>) -> Self {
        Self {
            field: field.into(),
            source_field: None,
            values: values.into_iter().collect(),
        }
    }

    fn source_field(&self) -> &str {
        self.source_field.as_deref().unwrap_or(&self.field)
    }
}

/// Permutation-driven backfill.
pub struct PermutationBackfill {
    identity: MigrationIdentity,
    options: MigrationOptions,
    index: String,
    filter: Option<Value>,
    domains: Vec<BackfillDomain>,
    parent_type: Option<String>,
    matrix: PermutationMatrix,
    obsolete: bool,
    iterator: PermutationIterator,
}

impl PermutationBackfill {
    pub fn default_options() -> MigrationOptions {
        MigrationOptions::new().batched()
    }

    pub fn new(
        identity: MigrationIdentity,
        options: MigrationOptions,
        index: impl Into<String>,
        domains: Vec<BackfillDomain>,
    ) -> Result<Self> {
        if domains.is_empty() || domains.iter().any(|d| d.values.is_empty()) {
            return Err(MigrationError::Config {
                message: format!(
                    "Migration {} needs at least one domain and a value in every domain",
                    identity
                ),
            });
        }

        let matrix = PermutationMatrix::new(
            domains
                .iter()
                .map(|d| AttributeDomain::new(d.field.clone(), d.values.iter().copied()))
                .collect(),
        );
        let iterator = PermutationIterator::new(BatchController::new(&options));

        Ok(Self {
            identity,
            options,
            index: index.into(),
            filter: None,
            domains,
            parent_type: None,
            matrix,
            obsolete: false,
            iterator,
        })
    }

    pub fn with_filter(mut self, filter: Option<Value>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_parent_type(mut self, parent_type: Option<String>) -> Self {
        self.parent_type = parent_type;
        self
    }

    pub fn with_obsolete(mut self, obsolete: bool) -> Self {
        self.obsolete = obsolete;
        self
    }

    fn missing_any_field(&self) -> Vec<Value> {
        self.domains
            .iter()
            .map(|d| json!({ "bool": { "must_not": { "exists": { "field": d.field } } } }))
            .collect()
    }

    fn base_filters(&self) -> Vec<Value> {
        self.filter.iter().cloned().collect()
    }

    fn source_match(&self, permutation: &Permutation) -> Value {
        let terms: Vec<Value> = self
            .domains
            .iter()
            .filter_map(|d| {
                permutation.value_of(&d.field).map(|value| {
                    let mut term = Map::new();
                    term.insert(d.source_field().to_string(), json!(value));
                    json!({ "term": term })
                })
            })
            .collect();

        match &self.parent_type {
            Some(parent_type) => json!({
                "has_parent": {
                    "parent_type": parent_type,
                    "query": { "bool": { "filter": terms } }
                }
            }),
            None => json!({ "bool": { "filter": terms } }),
        }
    }
}

impl PermutationPlan for PermutationBackfill {
    fn index_name(&self) -> &str {
        &self.index
    }

    fn matrix(&self) -> &PermutationMatrix {
        &self.matrix
    }

    fn remaining_query(&self) -> Value {
        json!({
            "bool": {
                "filter": self.base_filters(),
                "should": self.missing_any_field(),
                "minimum_should_match": 1
            }
        })
    }

    fn permutation_query(&self, permutation: &Permutation) -> Value {
        let mut filters = self.base_filters();
        filters.push(self.source_match(permutation));
        json!({
            "bool": {
                "filter": filters,
                "should": self.missing_any_field(),
                "minimum_should_match": 1
            }
        })
    }

    fn update_script(&self, permutation: &Permutation) -> Value {
        let source: String = permutation
            .assignments
            .iter()
            .map(|(field, _)| format!("ctx._source['{0}'] = params['{0}'];", field))
            .collect::<Vec<_>>()
            .join(" ");
        let params: Map<String, Value> = permutation
            .assignments
            .iter()
            .map(|(field, value)| (field.clone(), json!(value)))
            .collect();
        json!({ "lang": "painless", "source": source, "params": params })
    }
}

#[async_trait]
impl Migration for PermutationBackfill {
    fn identity(&self) -> &MigrationIdentity {
        &self.identity
    }

    fn options(&self) -> &MigrationOptions {
        &self.options
    }

    async fn migrate(&self, ctx: &mut MigrationContext<'_>) -> Result<Disposition> {
        self.iterator.step(self, ctx).await
    }

    async fn completed(&self, ctx: &MigrationContext<'_>) -> Result<bool> {
        let remaining = refreshed_count(ctx.store(), &self.index, &self.remaining_query()).await?;
        Ok(remaining == 0)
    }

    fn obsolete(&self) -> bool {
        self.obsolete
    }
}
