//! Checkpoint persistence.
//!
//! Each migration owns one record holding its JSON checkpoint and lifecycle
//! flags. The SQLite store is the durable backend; the memory store serves
//! tests.

mod memory;
mod sqlite;
mod state;
mod traits;

pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;
pub use state::{keys, Checkpoint, MigrationRecord};
pub use traits::CheckpointStore;
