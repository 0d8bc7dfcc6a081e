//! The migration contract.
//!
//! A migration is a sequence of idempotent steps. The runner loads the
//! checkpoint, hands it to [`Migration::migrate`] through a
//! [`MigrationContext`], and persists whatever the step left behind. All
//! cross-tick state lives in the checkpoint.

use crate::batch::{Disposition, MigrationOptions};
use crate::checkpoint::Checkpoint;
use crate::cleanup::OrphanCleanup;
use crate::error::Result;
use crate::identity::MigrationIdentity;
use crate::store::DocumentStore;
use async_trait::async_trait;

/// Everything a migration step may touch.
pub struct MigrationContext<'a> {
    identity: &'a MigrationIdentity,
    store: &'a dyn DocumentStore,
    cleanup: &'a dyn OrphanCleanup,
    checkpoint: Checkpoint,
}

impl<'a> MigrationContext<'a> {
    pub fn new(
        identity: &'a MigrationIdentity,
        store: &'a dyn DocumentStore,
        cleanup: &'a dyn OrphanCleanup,
        checkpoint: Checkpoint,
    ) -> Self {
        Self {
            identity,
            store,
            cleanup,
            checkpoint,
        }
    }

    pub fn identity(&self) -> &'a MigrationIdentity {
        self.identity
    }

    pub fn store(&self) -> &'a dyn DocumentStore {
        self.store
    }

    pub fn cleanup(&self) -> &'a dyn OrphanCleanup {
        self.cleanup
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn checkpoint_mut(&mut self) -> &mut Checkpoint {
        &mut self.checkpoint
    }

    pub fn into_checkpoint(self) -> Checkpoint {
        self.checkpoint
    }
}

/// A single resumable migration.
#[async_trait]
pub trait Migration: Send + Sync {
    fn identity(&self) -> &MigrationIdentity;

    fn options(&self) -> &MigrationOptions;

    /// Perform one bounded step.
    ///
    /// Must be safe to call again with the same checkpoint after a crash.
    async fn migrate(&self, ctx: &mut MigrationContext<'_>) -> Result<Disposition>;

    /// Whether the migration's goal has been reached.
    ///
    /// Must not mutate the store beyond refreshing indices before counting.
    async fn completed(&self, ctx: &MigrationContext<'_>) -> Result<bool>;

    /// Bytes of free cluster space needed before the first step.
    async fn space_required_bytes(&self, _store: &dyn DocumentStore) -> Result<u64> {
        Ok(0)
    }

    /// Obsolete migrations are skipped by the worker and never run.
    fn obsolete(&self) -> bool {
        false
    }
}
