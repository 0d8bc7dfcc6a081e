//! Ordered set of known migrations.

use crate::error::{MigrationError, Result};
use crate::identity::MigrationIdentity;
use crate::migration::Migration;
use crate::migrations::MigrationDefinition;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Migrations keyed by identity, iterated oldest first.
#[derive(Default, Clone)]
pub struct MigrationRegistry {
    migrations: BTreeMap<MigrationIdentity, Arc<dyn Migration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured migration.
    pub fn from_definitions(definitions: &[MigrationDefinition]) -> Result<Self> {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(definition.build()?)?;
        }
        Ok(registry)
    }

    /// Add a migration. Versions must be unique.
    pub fn register(&mut self, migration: Arc<dyn Migration>) -> Result<()> {
        let identity = migration.identity().clone();
        if let Some(existing) = self.find_by_version(identity.version()) {
            return Err(MigrationError::Config {
                message: format!(
                    "Migration version {} registered twice ({} and {})",
                    identity.version(),
                    existing.identity(),
                    identity
                ),
            });
        }
        self.migrations.insert(identity, migration);
        Ok(())
    }

    pub fn get(&self, identity: &MigrationIdentity) -> Option<Arc<dyn Migration>> {
        self.migrations.get(identity).cloned()
    }

    pub fn find_by_version(&self, version: u64) -> Option<Arc<dyn Migration>> {
        self.migrations
            .iter()
            .find(|(identity, _)| identity.version() == version)
            .map(|(_, migration)| migration.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Migration>> {
        self.migrations.values()
    }

    pub fn identities(&self) -> impl Iterator<Item = &MigrationIdentity> {
        self.migrations.keys()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.migrations.keys()).finish()
    }
}
