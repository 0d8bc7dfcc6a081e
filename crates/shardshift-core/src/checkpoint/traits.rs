//! Checkpoint store trait.

use super::state::{Checkpoint, MigrationRecord};
use crate::error::Result;
use crate::identity::MigrationIdentity;

/// Persistent store of migration records keyed by identity.
///
/// All operations are synchronous to match rusqlite's API. Writes replace the
/// whole record; there is no compare-and-swap, so callers must serialize
/// ticks per identity.
pub trait CheckpointStore: Send + Sync {
    /// Get the record for a migration, if one was ever saved.
    fn load_record(&self, identity: &MigrationIdentity) -> Result<Option<MigrationRecord>>;

    /// Replace the record for `record.identity`.
    fn save_record(&self, record: &MigrationRecord) -> Result<()>;

    /// Delete a migration's record so it starts over on the next tick.
    ///
    /// Returns whether a record existed.
    fn reset(&self, identity: &MigrationIdentity) -> Result<bool>;

    /// All stored records, oldest migration first.
    fn list_records(&self) -> Result<Vec<MigrationRecord>>;

    /// Load a migration's checkpoint; empty if nothing was persisted yet.
    fn load(&self, identity: &MigrationIdentity) -> Result<Checkpoint> {
        Ok(self
            .load_record(identity)?
            .map(|record| record.state)
            .unwrap_or_default())
    }

    /// Replace a migration's checkpoint, keeping its lifecycle flags.
    fn save(&self, identity: &MigrationIdentity, checkpoint: &Checkpoint) -> Result<()> {
        let mut record = self
            .load_record(identity)?
            .unwrap_or_else(|| MigrationRecord::new(identity.clone()));
        record.state = checkpoint.clone();
        self.save_record(&record)
    }
}
