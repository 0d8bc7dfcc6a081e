//! Shardshift Core - resumable, batched migrations for Elasticsearch indices.
//!
//! A migration makes a bounded amount of progress per tick: it launches
//! asynchronous store tasks, records where it is in a persisted checkpoint,
//! and picks up from that checkpoint on the next tick. Three iteration
//! strategies are provided:
//!
//! - slices: reindex one source shard slice per task
//! - permutations: backfill fields one value combination at a time
//! - fan-out: one scoped by-query task per entity, bounded by shard count
//!
//! # Example
//!
//! ```rust,ignore
//! use shardshift_core::{
//!     ElasticClient, MigrationRegistry, MigrationRunner, MigrationWorker, ShardshiftConfig,
//!     SqliteCheckpointStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> shardshift_core::Result<()> {
//!     let config = ShardshiftConfig::load("shardshift.json")?;
//!     let store = Arc::new(ElasticClient::new(&config.elasticsearch)?);
//!     let checkpoints = Arc::new(SqliteCheckpointStore::new(config.state_path())?);
//!
//!     let runner = MigrationRunner::new(store, checkpoints)
//!         .with_registry(MigrationRegistry::from_definitions(&config.migrations)?);
//!     let summary = MigrationWorker::new(Arc::new(runner)).run_until_idle(None).await?;
//!     println!("{} migrations completed", summary.completed.len());
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod identity;
pub mod indexing;
pub mod iterator;
pub mod migration;
pub mod migrations;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use batch::{BatchController, Disposition, MigrationOptions};
pub use checkpoint::{
    Checkpoint, CheckpointStore, MemoryCheckpointStore, MigrationRecord, SqliteCheckpointStore,
};
pub use cleanup::{OrphanCleanup, OrphanCleanupQueue, RecordingOrphanCleanup};
pub use config::{CleanupTarget, ElasticConfig, MigrationDefaults, ShardshiftConfig};
pub use error::{MigrationError, Result};
pub use identity::MigrationIdentity;
pub use indexing::{IndexingControl, IndexingSwitch};
pub use iterator::{
    EntityRecord, EntityResolver, FanOutController, FanOutPlan, PermutationIterator,
    PermutationMatrix, PermutationPlan, SliceIterator, SlicePlan,
};
pub use migration::{Migration, MigrationContext};
pub use migrations::{MigrationDefinition, MigrationKind};
pub use registry::MigrationRegistry;
pub use retry::{retry_async, BackoffPolicy};
pub use runner::MigrationRunner;
pub use store::{DocumentStore, DynDocumentStore, ElasticClient, TaskHandle};
#[cfg(any(test, feature = "testing"))]
pub use store::ScriptedStore;
pub use worker::{MigrationWorker, RunSummary, TickOutcome};
