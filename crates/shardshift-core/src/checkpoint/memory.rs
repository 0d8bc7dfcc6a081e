//! In-memory checkpoint store.

use super::state::MigrationRecord;
use super::traits::CheckpointStore;
use crate::error::{MigrationError, Result};
use crate::identity::MigrationIdentity;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Non-persistent store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<BTreeMap<MigrationIdentity, MigrationRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<MigrationIdentity, MigrationRecord>>> {
        self.records
            .lock()
            .map_err(|e| MigrationError::Other(format!("Checkpoint store poisoned: {}", e)))
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load_record(&self, identity: &MigrationIdentity) -> Result<Option<MigrationRecord>> {
        Ok(self.lock()?.get(identity).cloned())
    }

    fn save_record(&self, record: &MigrationRecord) -> Result<()> {
        self.lock()?
            .insert(record.identity.clone(), record.clone());
        Ok(())
    }

    fn reset(&self, identity: &MigrationIdentity) -> Result<bool> {
        Ok(self.lock()?.remove(identity).is_some())
    }

    fn list_records(&self) -> Result<Vec<MigrationRecord>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}
