//! Migration runner.
//!
//! `run()` executes exactly one tick of one migration: the halt, space,
//! completion and pause gates, then a single `migrate()` step, then the
//! bookkeeping that makes the next tick resumable.

use crate::batch::{BatchController, Disposition};
use crate::checkpoint::{keys, Checkpoint, CheckpointStore, MigrationRecord};
use crate::cleanup::{OrphanCleanup, RecordingOrphanCleanup};
use crate::error::{MigrationError, Result};
use crate::identity::MigrationIdentity;
use crate::indexing::{IndexingControl, IndexingSwitch};
use crate::migration::{Migration, MigrationContext};
use crate::registry::MigrationRegistry;
use crate::store::DynDocumentStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Executes migration ticks against one store and one checkpoint store.
pub struct MigrationRunner {
    store: DynDocumentStore,
    checkpoints: Arc<dyn CheckpointStore>,
    indexing: Arc<dyn IndexingControl>,
    cleanup: Arc<dyn OrphanCleanup>,
    registry: MigrationRegistry,
}

impl MigrationRunner {
    /// Create a runner with an in-process indexing switch and in-memory
    /// orphan cleanup.
    pub fn new(store: DynDocumentStore, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            checkpoints,
            indexing: Arc::new(IndexingSwitch::new()),
            cleanup: Arc::new(RecordingOrphanCleanup::new()),
            registry: MigrationRegistry::new(),
        }
    }

    /// Use a shared indexing switch instead of the in-process one.
    pub fn with_indexing_control(mut self, indexing: Arc<dyn IndexingControl>) -> Self {
        self.indexing = indexing;
        self
    }

    /// Set where orphaned entities are sent.
    pub fn with_orphan_cleanup(mut self, cleanup: Arc<dyn OrphanCleanup>) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Replace the registry.
    pub fn with_registry(mut self, registry: MigrationRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Add one migration to the registry.
    pub fn register(&mut self, migration: Arc<dyn Migration>) -> Result<()> {
        self.registry.register(migration)
    }

    /// Get the registry.
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Get the document store.
    pub fn store(&self) -> &DynDocumentStore {
        &self.store
    }

    /// Get the checkpoint store.
    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Get the indexing switch.
    pub fn indexing(&self) -> &Arc<dyn IndexingControl> {
        &self.indexing
    }

    fn migration(&self, identity: &MigrationIdentity) -> Result<Arc<dyn Migration>> {
        self.registry
            .get(identity)
            .ok_or_else(|| MigrationError::UnknownMigration(identity.to_string()))
    }

    /// Stored record for a migration, or a fresh one if it never ran.
    pub fn record(&self, identity: &MigrationIdentity) -> Result<MigrationRecord> {
        Ok(self
            .checkpoints
            .load_record(identity)?
            .unwrap_or_else(|| MigrationRecord::new(identity.clone())))
    }

    /// Forget a migration's progress and flags so it starts over.
    pub fn reset(&self, identity: &MigrationIdentity) -> Result<bool> {
        let existed = self.checkpoints.reset(identity)?;
        if existed {
            info!("[migration {}] Reset", identity);
        }
        Ok(existed)
    }

    /// Whether the migration has reached its goal.
    ///
    /// Only refreshes indices; never writes a checkpoint.
    pub async fn is_completed(&self, identity: &MigrationIdentity) -> Result<bool> {
        let migration = self.migration(identity)?;
        let record = self.record(identity)?;
        if record.completed {
            return Ok(true);
        }
        let ctx = MigrationContext::new(
            identity,
            self.store.as_ref(),
            self.cleanup.as_ref(),
            record.state,
        );
        migration.completed(&ctx).await
    }

    /// How long the scheduler should wait before the next tick.
    pub fn next_delay(&self, identity: &MigrationIdentity) -> Result<Duration> {
        let migration = self.migration(identity)?;
        let record = self.record(identity)?;
        if record.completed {
            return Ok(Duration::ZERO);
        }
        Ok(BatchController::new(migration.options()).next_delay(record.state.retry_attempt()))
    }

    /// Run one tick of a migration.
    pub async fn run(&self, identity: &MigrationIdentity) -> Result<Disposition> {
        let migration = self.migration(identity)?;
        let mut record = self.record(identity)?;
        let options = migration.options();

        if record.halted {
            self.resume_indexing_after_halt(&mut record)?;
            error!(
                "[migration {}] Halted: {}. Reset the migration to retry",
                identity,
                record.failure_message.as_deref().unwrap_or("no reason recorded")
            );
            return Ok(Disposition::HaltedError);
        }

        if record.completed {
            return Ok(Disposition::Completed);
        }

        if !record.started() && options.space_requirements {
            let required = migration.space_required_bytes(self.store.as_ref()).await?;
            let free = self.store.cluster_free_size_bytes().await?;
            if free < required {
                warn!(
                    "[migration {}] Needs {} bytes of free space but the cluster has {}, not starting",
                    identity, required, free
                );
                return Ok(Disposition::noop(format!(
                    "insufficient space: {} bytes required, {} bytes free",
                    required, free
                )));
            }
        }

        let pre_tick = record.state.clone();
        match self.step(migration.as_ref(), &mut record).await {
            Ok(disposition) => Ok(disposition),
            Err(e) => {
                self.record_failure(migration.as_ref(), record, pre_tick, &e);
                Err(e)
            }
        }
    }

    async fn step(
        &self,
        migration: &dyn Migration,
        record: &mut MigrationRecord,
    ) -> Result<Disposition> {
        let identity = migration.identity();
        let options = migration.options();
        let batch = BatchController::new(options);

        // Before `completed()`: a failing completion check counts too.
        if (options.batched || options.retry_on_failure)
            && batch.ceiling_reached(record.state.retry_attempt())
        {
            let message = format!(
                "retry limit of {} attempts reached",
                batch.max_attempts()
            );
            self.halt(record, message)?;
            return Ok(Disposition::HaltedError);
        }

        let ctx = MigrationContext::new(
            identity,
            self.store.as_ref(),
            self.cleanup.as_ref(),
            record.state.clone(),
        );
        if migration.completed(&ctx).await? {
            record.completed = true;
            record.completed_at = Some(Utc::now());
            self.resume_owned_indexing(record)?;
            self.checkpoints.save_record(record)?;
            info!("[migration {}] Completed", identity);
            return Ok(Disposition::Completed);
        }

        if !options.batched && record.started() {
            debug!(
                "[migration {}] Waiting for the single step to converge",
                identity
            );
            return Ok(Disposition::InProgress);
        }

        if options.pause_indexing && record.pause_indexing.is_none() {
            let already_paused = self.indexing.is_paused()?;
            if !already_paused {
                self.indexing.set_paused(true)?;
                info!("[migration {}] Paused indexing", identity);
            }
            record.pause_indexing = Some(!already_paused);
            self.checkpoints.save_record(record)?;
        }

        let mut ctx = MigrationContext::new(
            identity,
            self.store.as_ref(),
            self.cleanup.as_ref(),
            record.state.clone(),
        );
        let disposition = migration.migrate(&mut ctx).await?;
        record.state = ctx.into_checkpoint();

        if disposition == Disposition::HaltedError {
            let message = format!(
                "retry limit of {} attempts reached",
                batch.max_attempts()
            );
            self.halt(record, message)?;
            return Ok(Disposition::HaltedError);
        }

        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        self.checkpoints.save_record(record)?;
        debug!("[migration {}] Tick finished: {}", identity, disposition);
        Ok(disposition)
    }

    /// Persist the bookkeeping for a failed tick. Never masks `error`.
    fn record_failure(
        &self,
        migration: &dyn Migration,
        mut record: MigrationRecord,
        pre_tick: Checkpoint,
        error: &MigrationError,
    ) {
        let identity = migration.identity();
        let options = migration.options();

        let saved = if options.batched || options.retry_on_failure {
            let mut state = pre_tick;
            let attempt = state.retry_attempt() + 1;
            state.remove(keys::TASK_ID);
            state.set(keys::RETRY_ATTEMPT, attempt);
            record.state = state;

            if error.is_task_gone() {
                warn!(
                    "[migration {}] Task lost on attempt {}: {}. Relaunching next tick",
                    identity, attempt, error
                );
            } else {
                warn!("[migration {}] Attempt {} failed: {}", identity, attempt, error);
            }
            self.checkpoints.save_record(&record)
        } else {
            self.halt(&mut record, error.to_string())
        };

        if let Err(save_error) = saved {
            error!(
                "[migration {}] Failed to record failure ({}): {}",
                identity, error, save_error
            );
        }
    }

    fn halt(&self, record: &mut MigrationRecord, message: String) -> Result<()> {
        error!("[migration {}] Halting: {}", record.identity, message);
        record.halted = true;
        record.failed = true;
        record.failure_message = Some(message);
        self.checkpoints.save_record(record)?;
        self.resume_indexing_after_halt(record)
    }

    fn resume_indexing_after_halt(&self, record: &mut MigrationRecord) -> Result<()> {
        if record.pause_indexing == Some(true) && !record.halted_indexing_unpaused {
            self.indexing.set_paused(false)?;
            record.halted_indexing_unpaused = true;
            self.checkpoints.save_record(record)?;
            info!(
                "[migration {}] Resumed indexing after halt",
                record.identity
            );
        }
        Ok(())
    }

    fn resume_owned_indexing(&self, record: &MigrationRecord) -> Result<()> {
        if record.pause_indexing == Some(true) {
            self.indexing.set_paused(false)?;
            info!("[migration {}] Resumed indexing", record.identity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MigrationOptions;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::store::ScriptedStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts up to `target` one step at a time; optionally fails every call.
    struct Counter {
        identity: MigrationIdentity,
        options: MigrationOptions,
        target: u64,
        fail: bool,
        fail_completion: bool,
        migrate_calls: AtomicU32,
        completed_calls: AtomicU32,
        space_required: u64,
    }

    impl Counter {
        fn new(options: MigrationOptions) -> Self {
            Self {
                identity: MigrationIdentity::new(20230628094700, "count_to_three"),
                options,
                target: 3,
                fail: false,
                fail_completion: false,
                migrate_calls: AtomicU32::new(0),
                completed_calls: AtomicU32::new(0),
                space_required: 0,
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn failing_completion(mut self) -> Self {
            self.fail_completion = true;
            self
        }

        fn requiring(mut self, bytes: u64) -> Self {
            self.space_required = bytes;
            self
        }
    }

    #[async_trait]
    impl Migration for Counter {
        fn identity(&self) -> &MigrationIdentity {
            &self.identity
        }

        fn options(&self) -> &MigrationOptions {
            &self.options
        }

        async fn migrate(&self, ctx: &mut MigrationContext<'_>) -> Result<Disposition> {
            self.migrate_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MigrationError::TaskNotFound {
                    task_id: "task-1".into(),
                });
            }
            let count = ctx.checkpoint().get_u64("count").unwrap_or(0);
            ctx.checkpoint_mut().set("count", count + 1);
            ctx.checkpoint_mut().set("task_id", "task-1");
            Ok(Disposition::Started)
        }

        async fn completed(&self, ctx: &MigrationContext<'_>) -> Result<bool> {
            self.completed_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_completion {
                return Err(MigrationError::DocumentStore {
                    message: "search_phase_execution_exception".into(),
                    status: Some(400),
                });
            }
            Ok(ctx.checkpoint().get_u64("count").unwrap_or(0) >= self.target)
        }

        async fn space_required_bytes(&self, _store: &dyn crate::store::DocumentStore) -> Result<u64> {
            Ok(self.space_required)
        }
    }

    struct Harness {
        runner: MigrationRunner,
        store: Arc<ScriptedStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
        indexing: IndexingSwitch,
        migration: Arc<Counter>,
    }

    fn harness(migration: Counter) -> Harness {
        let store = Arc::new(ScriptedStore::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let indexing = IndexingSwitch::new();
        let migration = Arc::new(migration);
        let mut runner = MigrationRunner::new(store.clone(), checkpoints.clone())
            .with_indexing_control(Arc::new(indexing.clone()));
        runner.register(migration.clone()).unwrap();
        Harness {
            runner,
            store,
            checkpoints,
            indexing,
            migration,
        }
    }

    #[tokio::test]
    async fn test_unknown_migration() {
        let h = harness(Counter::new(MigrationOptions::new().batched()));
        let result = h
            .runner
            .run(&MigrationIdentity::new(1, "missing"))
            .await;
        assert!(matches!(result, Err(MigrationError::UnknownMigration(_))));
    }

    #[tokio::test]
    async fn test_batched_migration_converges_and_stays_completed() {
        let h = harness(Counter::new(MigrationOptions::new().batched()));
        let id = h.migration.identity.clone();

        for _ in 0..3 {
            assert_eq!(h.runner.run(&id).await.unwrap(), Disposition::Started);
        }
        assert_eq!(h.runner.run(&id).await.unwrap(), Disposition::Completed);
        assert_eq!(h.runner.run(&id).await.unwrap(), Disposition::Completed);
        assert_eq!(h.migration.migrate_calls.load(Ordering::SeqCst), 3);

        let record = h.checkpoints.load_record(&id).unwrap().unwrap();
        assert!(record.completed);
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_some());
        assert!(h.runner.is_completed(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_bumps_retry_and_clears_task() {
        let h = harness(Counter::new(MigrationOptions::new().batched()).failing());
        let id = h.migration.identity.clone();
        let mut seeded = Checkpoint::new();
        seeded.set("count", 1);
        seeded.set("task_id", "task-1");
        seeded.set("retry_attempt", 2);
        h.checkpoints.save(&id, &seeded).unwrap();

        let result = h.runner.run(&id).await;
        assert!(matches!(result, Err(MigrationError::TaskNotFound { .. })));

        let state = h.checkpoints.load(&id).unwrap();
        assert_eq!(state.retry_attempt(), 3);
        assert_eq!(state.get_u64("count"), Some(1));
        assert!(!state.contains("task_id"));
        assert!(!h.checkpoints.load_record(&id).unwrap().unwrap().halted);
    }

    #[tokio::test]
    async fn test_unbatched_failure_halts() {
        let h = harness(Counter::new(MigrationOptions::new()).failing());
        let id = h.migration.identity.clone();

        assert!(h.runner.run(&id).await.is_err());
        let record = h.checkpoints.load_record(&id).unwrap().unwrap();
        assert!(record.halted);
        assert!(record.failed);
        assert!(record.failure_message.unwrap().contains("task-1"));

        assert_eq!(h.runner.run(&id).await.unwrap(), Disposition::HaltedError);
        assert_eq!(h.migration.migrate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_halts_and_resumes_indexing() {
        let h = harness(Counter::new(
            MigrationOptions::new()
                .batched()
                .retry_on_failure()
                .pause_indexing()
                .with_max_attempts(2),
        )
        .failing());
        let id = h.migration.identity.clone();

        assert!(h.runner.run(&id).await.is_err());
        assert!(h.indexing.is_paused().unwrap());
        assert!(h.runner.run(&id).await.is_err());

        assert_eq!(h.runner.run(&id).await.unwrap(), Disposition::HaltedError);
        assert_eq!(h.migration.migrate_calls.load(Ordering::SeqCst), 2);
        assert!(!h.indexing.is_paused().unwrap());

        let record = h.checkpoints.load_record(&id).unwrap().unwrap();
        assert!(record.halted);
        assert!(record.halted_indexing_unpaused);

        // Operator pauses again; a halted migration must not unpause twice.
        h.indexing.set_paused(true).unwrap();
        assert_eq!(h.runner.run(&id).await.unwrap(), Disposition::HaltedError);
        assert!(h.indexing.is_paused().unwrap());
    }

    #[tokio::test]
    async fn test_failing_completion_check_halts_at_ceiling() {
        let h = harness(
            Counter::new(MigrationOptions::new().batched().with_max_attempts(3)).failing_completion(),
        );
        let id = h.migration.identity.clone();

        for attempt in 1..=3u32 {
            assert!(h.runner.run(&id).await.is_err());
            assert_eq!(h.runner.record(&id).unwrap().state.retry_attempt(), attempt);
        }

        assert_eq!(h.runner.run(&id).await.unwrap(), Disposition::HaltedError);
        assert_eq!(h.migration.completed_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.migration.migrate_calls.load(Ordering::SeqCst), 0);

        let record = h.checkpoints.load_record(&id).unwrap().unwrap();
        assert!(record.halted);
        assert!(record.failure_message.unwrap().contains("retry limit of 3"));
    }

    #[tokio::test]
    async fn test_pause_indexing_owned_and_released() {
        let h = harness(Counter::new(MigrationOptions::new().batched().pause_indexing()));
        let id = h.migration.identity.clone();

        h.runner.run(&id).await.unwrap();
        assert!(h.indexing.is_paused().unwrap());
        assert_eq!(
            h.checkpoints.load_record(&id).unwrap().unwrap().pause_indexing,
            Some(true)
        );

        while h.runner.run(&id).await.unwrap() != Disposition::Completed {}
        assert!(!h.indexing.is_paused().unwrap());
    }

    #[tokio::test]
    async fn test_already_paused_indexing_left_alone() {
        let h = harness(Counter::new(MigrationOptions::new().batched().pause_indexing()));
        let id = h.migration.identity.clone();
        h.indexing.set_paused(true).unwrap();

        while h.runner.run(&id).await.unwrap() != Disposition::Completed {}
        assert!(h.indexing.is_paused().unwrap());
        assert_eq!(
            h.checkpoints.load_record(&id).unwrap().unwrap().pause_indexing,
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_space_gate_blocks_until_space_frees() {
        let h = harness(
            Counter::new(MigrationOptions::new().batched().space_requirements().pause_indexing())
                .requiring(1_000),
        );
        let id = h.migration.identity.clone();
        h.store.set_free_bytes(10);

        let disposition = h.runner.run(&id).await.unwrap();
        assert!(matches!(disposition, Disposition::Noop { .. }));
        assert!(!h.indexing.is_paused().unwrap());
        assert!(h.checkpoints.load_record(&id).unwrap().is_none());
        assert_eq!(h.migration.migrate_calls.load(Ordering::SeqCst), 0);

        h.store.set_free_bytes(5_000);
        assert_eq!(h.runner.run(&id).await.unwrap(), Disposition::Started);
    }

    #[tokio::test]
    async fn test_unbatched_runs_once_then_waits() {
        let h = harness(Counter::new(MigrationOptions::new()));
        let id = h.migration.identity.clone();

        assert_eq!(h.runner.run(&id).await.unwrap(), Disposition::Started);
        assert_eq!(h.runner.run(&id).await.unwrap(), Disposition::InProgress);
        assert_eq!(h.migration.migrate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_starts_over() {
        let h = harness(Counter::new(MigrationOptions::new()).failing());
        let id = h.migration.identity.clone();
        let _ = h.runner.run(&id).await;
        assert!(h.runner.record(&id).unwrap().halted);

        assert!(h.runner.reset(&id).unwrap());
        assert!(!h.runner.record(&id).unwrap().halted);
        assert!(!h.runner.reset(&id).unwrap());
    }

    #[tokio::test]
    async fn test_next_delay_follows_retries() {
        let h = harness(Counter::new(
            MigrationOptions::new()
                .batched()
                .with_throttle_delay(Duration::from_secs(60)),
        ));
        let id = h.migration.identity.clone();
        assert_eq!(h.runner.next_delay(&id).unwrap(), Duration::from_secs(60));

        let mut state = Checkpoint::new();
        state.set("retry_attempt", 3);
        h.checkpoints.save(&id, &state).unwrap();
        assert_eq!(h.runner.next_delay(&id).unwrap(), Duration::from_secs(240));
    }
}
