//! Bundled migration kinds and their declarative definitions.
//!
//! A configuration file lists [`MigrationDefinition`]s; [`MigrationDefinition::build`]
//! turns each into a runnable [`Migration`].

mod fan_out;
mod permutation_backfill;
mod reindex;

pub use fan_out::{FanOutAction, FanOutMigration, IndexEntityResolver};
pub use permutation_backfill::{BackfillDomain, PermutationBackfill};
pub use reindex::ReindexToIndex;

use crate::batch::MigrationOptions;
use crate::config::CleanupTarget;
use crate::error::{MigrationError, Result};
use crate::identity::MigrationIdentity;
use crate::migration::Migration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// One migration entry of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationDefinition {
    pub version: u64,
    pub name: String,
    #[serde(default)]
    pub batch_size: Option<u64>,
    #[serde(default)]
    pub throttle_delay_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub retry_on_failure: Option<bool>,
    #[serde(default)]
    pub obsolete: bool,
    #[serde(flatten)]
    pub kind: MigrationKind,
}

/// Strategy-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationKind {
    /// Copy `source` into a new `destination` index slice by slice.
    Reindex {
        source: String,
        destination: String,
        /// Settings and mappings for the destination index.
        #[serde(default)]
        index_body: Option<Value>,
        #[serde(default)]
        query: Option<Value>,
        #[serde(default)]
        script: Option<Value>,
    },
    /// Fill fields from the cross product of their possible values.
    PermutationBackfill {
        index: String,
        #[serde(default)]
        filter: Option<Value>,
        domains: Vec<BackfillDomain>,
        /// Match values on the parent document of this join type.
        #[serde(default)]
        parent_type: Option<String>,
    },
    /// Run a script over each entity's documents.
    FanOutUpdate {
        index: String,
        filter: Value,
        entity_field: String,
        entity_index: String,
        script: Value,
        #[serde(default)]
        routing_prefix: Option<String>,
        #[serde(default)]
        max_entities: Option<usize>,
    },
    /// Delete each entity's documents.
    FanOutDelete {
        index: String,
        filter: Value,
        entity_field: String,
        entity_index: String,
        #[serde(default)]
        routing_prefix: Option<String>,
        #[serde(default)]
        max_entities: Option<usize>,
    },
}

impl MigrationDefinition {
    pub fn identity(&self) -> MigrationIdentity {
        MigrationIdentity::new(self.version, self.name.clone())
    }

    /// Apply this definition's overrides on top of a kind's defaults.
    pub fn options(&self, defaults: MigrationOptions) -> MigrationOptions {
        let mut options = defaults;
        if let Some(batch_size) = self.batch_size {
            options = options.with_batch_size(batch_size);
        }
        if let Some(secs) = self.throttle_delay_secs {
            options = options.with_throttle_delay(Duration::from_secs(secs));
        }
        if let Some(attempts) = self.max_attempts {
            options = options.with_max_attempts(attempts);
        }
        if let Some(retry) = self.retry_on_failure {
            options.retry_on_failure = retry;
        }
        options
    }

    /// Where orphaned entity documents of a fan-out migration live.
    pub fn cleanup_target(&self) -> Option<CleanupTarget> {
        match &self.kind {
            MigrationKind::FanOutUpdate {
                index,
                entity_field,
                routing_prefix,
                ..
            }
            | MigrationKind::FanOutDelete {
                index,
                entity_field,
                routing_prefix,
                ..
            } => Some(CleanupTarget {
                index: index.clone(),
                entity_field: entity_field.clone(),
                routing_prefix: routing_prefix.clone(),
            }),
            MigrationKind::Reindex { .. } | MigrationKind::PermutationBackfill { .. } => None,
        }
    }

    /// Build the runnable migration.
    pub fn build(&self) -> Result<Arc<dyn Migration>> {
        if self.name.trim().is_empty() {
            return Err(MigrationError::Config {
                message: format!("Migration {} has an empty name", self.version),
            });
        }

        let identity = self.identity();
        let migration: Arc<dyn Migration> = match &self.kind {
            MigrationKind::Reindex {
                source,
                destination,
                index_body,
                query,
                script,
            } => Arc::new(
                ReindexToIndex::new(
                    identity,
                    self.options(ReindexToIndex::default_options()),
                    source,
                    destination,
                )
                .with_index_body(index_body.clone())
                .with_query(query.clone())
                .with_script(script.clone())
                .with_obsolete(self.obsolete),
            ),
            MigrationKind::PermutationBackfill {
                index,
                filter,
                domains,
                parent_type,
            } => Arc::new(
                PermutationBackfill::new(
                    identity,
                    self.options(PermutationBackfill::default_options()),
                    index,
                    domains.clone(),
                )?
                .with_filter(filter.clone())
                .with_parent_type(parent_type.clone())
                .with_obsolete(self.obsolete),
            ),
            MigrationKind::FanOutUpdate {
                index,
                filter,
                entity_field,
                entity_index,
                script,
                routing_prefix,
                max_entities,
            } => Arc::new(
                FanOutMigration::new(
                    identity,
                    self.options(FanOutMigration::default_options()),
                    index,
                    filter.clone(),
                    entity_field,
                    FanOutAction::Update {
                        script: script.clone(),
                    },
                    IndexEntityResolver::new(entity_index),
                )
                .with_routing_prefix(routing_prefix.clone())
                .with_max_entities(*max_entities)
                .with_obsolete(self.obsolete),
            ),
            MigrationKind::FanOutDelete {
                index,
                filter,
                entity_field,
                entity_index,
                routing_prefix,
                max_entities,
            } => Arc::new(
                FanOutMigration::new(
                    identity,
                    self.options(FanOutMigration::default_options()),
                    index,
                    filter.clone(),
                    entity_field,
                    FanOutAction::Delete,
                    IndexEntityResolver::new(entity_index),
                )
                .with_routing_prefix(routing_prefix.clone())
                .with_max_entities(*max_entities)
                .with_obsolete(self.obsolete),
            ),
        };
        Ok(migration)
    }
}
