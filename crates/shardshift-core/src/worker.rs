//! Scheduler tick over the whole registry.
//!
//! Migrations run strictly in version order. A halted migration blocks every
//! later one until an operator resets it.

use crate::batch::Disposition;
use crate::error::Result;
use crate::identity::MigrationIdentity;
use crate::migration::Migration;
use crate::runner::MigrationRunner;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one scheduler tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub identity: MigrationIdentity,
    pub disposition: Disposition,
    /// How long to wait before the next tick.
    pub next_delay: Duration,
}

/// Summary of a [`MigrationWorker::run_until_idle`] loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub ticks: usize,
    pub completed: Vec<MigrationIdentity>,
    /// Set when the loop stopped on a halted migration.
    pub halted: Option<MigrationIdentity>,
    pub failed_ticks: usize,
}

/// Picks the current migration and runs it one tick at a time.
pub struct MigrationWorker {
    runner: Arc<MigrationRunner>,
}

impl MigrationWorker {
    pub fn new(runner: Arc<MigrationRunner>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &MigrationRunner {
        &self.runner
    }

    /// First migration that is neither obsolete nor completed.
    pub fn current_migration(&self) -> Result<Option<Arc<dyn Migration>>> {
        for migration in self.runner.registry().iter() {
            if migration.obsolete() {
                debug!("[migration {}] Obsolete, skipping", migration.identity());
                continue;
            }
            let record = self.runner.record(migration.identity())?;
            if !record.completed {
                return Ok(Some(migration.clone()));
            }
        }
        Ok(None)
    }

    /// Run one tick of the current migration.
    ///
    /// Returns `Ok(None)` when every migration is completed or obsolete.
    pub async fn perform(&self) -> Result<Option<TickOutcome>> {
        let Some(migration) = self.current_migration()? else {
            debug!("No pending migrations");
            return Ok(None);
        };
        let identity = migration.identity().clone();

        let disposition = self.runner.run(&identity).await?;
        let next_delay = match disposition {
            Disposition::Completed => Duration::ZERO,
            _ => self.runner.next_delay(&identity)?,
        };

        info!(
            "[migration {}] {} (next tick in {:?})",
            identity, disposition, next_delay
        );
        Ok(Some(TickOutcome {
            identity,
            disposition,
            next_delay,
        }))
    }

    /// Tick until nothing is pending, a migration halts, or `max_ticks` runs
    /// out.
    ///
    /// Failed ticks are logged and retried after the migration's backoff
    /// delay; their bookkeeping already happened in the runner.
    pub async fn run_until_idle(&self, max_ticks: Option<usize>) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        while max_ticks.map_or(true, |max| summary.ticks < max) {
            summary.ticks += 1;

            let delay = match self.perform().await {
                Ok(None) => break,
                Ok(Some(outcome)) => match outcome.disposition {
                    Disposition::HaltedError => {
                        summary.halted = Some(outcome.identity);
                        break;
                    }
                    Disposition::Completed => {
                        summary.completed.push(outcome.identity);
                        outcome.next_delay
                    }
                    _ => outcome.next_delay,
                },
                Err(e) => {
                    summary.failed_ticks += 1;
                    let delay = match self.current_migration()? {
                        Some(migration) => self.runner.next_delay(migration.identity())?,
                        None => Duration::ZERO,
                    };
                    warn!("Migration tick failed: {}. Next tick in {:?}", e, delay);
                    delay
                }
            };

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MigrationOptions;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore, MigrationRecord};
    use crate::error::MigrationError;
    use crate::migration::MigrationContext;
    use crate::store::ScriptedStore;
    use async_trait::async_trait;

    struct Steps {
        identity: MigrationIdentity,
        options: MigrationOptions,
        steps: u64,
        obsolete: bool,
        fail_first: bool,
    }

    impl Steps {
        fn new(version: u64, name: &str, steps: u64) -> Self {
            Self {
                identity: MigrationIdentity::new(version, name),
                options: MigrationOptions::new()
                    .batched()
                    .with_throttle_delay(Duration::from_secs(60)),
                steps,
                obsolete: false,
                fail_first: false,
            }
        }
    }

    #[async_trait]
    impl Migration for Steps {
        fn identity(&self) -> &MigrationIdentity {
            &self.identity
        }

        fn options(&self) -> &MigrationOptions {
            &self.options
        }

        async fn migrate(&self, ctx: &mut MigrationContext<'_>) -> Result<Disposition> {
            if self.fail_first && ctx.checkpoint().retry_attempt() == 0 {
                return Err(MigrationError::store(503, "unavailable"));
            }
            let done = ctx.checkpoint().get_u64("done").unwrap_or(0);
            ctx.checkpoint_mut().set("done", done + 1);
            Ok(Disposition::Started)
        }

        async fn completed(&self, ctx: &MigrationContext<'_>) -> Result<bool> {
            Ok(ctx.checkpoint().get_u64("done").unwrap_or(0) >= self.steps)
        }

        fn obsolete(&self) -> bool {
            self.obsolete
        }
    }

    fn worker(migrations: Vec<Steps>) -> (MigrationWorker, Arc<MemoryCheckpointStore>) {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let mut runner = MigrationRunner::new(Arc::new(ScriptedStore::new()), checkpoints.clone());
        for migration in migrations {
            runner.register(Arc::new(migration)).unwrap();
        }
        (MigrationWorker::new(Arc::new(runner)), checkpoints)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_migrations_in_order() {
        let (worker, checkpoints) = worker(vec![
            Steps::new(20230702000000, "second", 1),
            Steps::new(20230701000000, "first", 2),
        ]);

        let summary = worker.run_until_idle(None).await.unwrap();
        assert_eq!(
            summary.completed,
            vec![
                MigrationIdentity::new(20230701000000, "first"),
                MigrationIdentity::new(20230702000000, "second"),
            ]
        );
        assert_eq!(summary.failed_ticks, 0);
        assert!(summary.halted.is_none());
        assert!(checkpoints.list_records().unwrap().iter().all(|r| r.completed));
    }

    #[tokio::test]
    async fn test_obsolete_migrations_are_skipped() {
        let mut obsolete = Steps::new(20230601000000, "old", 1);
        obsolete.obsolete = true;
        let (worker, _) = worker(vec![obsolete, Steps::new(20230701000000, "current", 1)]);

        let current = worker.current_migration().unwrap().unwrap();
        assert_eq!(current.identity().name(), "current");
    }

    #[tokio::test]
    async fn test_halted_migration_blocks_later_ones() {
        let (worker, checkpoints) = worker(vec![
            Steps::new(20230701000000, "stuck", 1),
            Steps::new(20230702000000, "waiting", 1),
        ]);
        let mut record = MigrationRecord::new(MigrationIdentity::new(20230701000000, "stuck"));
        record.halted = true;
        checkpoints.save_record(&record).unwrap();

        let summary = worker.run_until_idle(Some(10)).await.unwrap();
        assert_eq!(
            summary.halted,
            Some(MigrationIdentity::new(20230701000000, "stuck"))
        );
        assert!(checkpoints
            .load_record(&MigrationIdentity::new(20230702000000, "waiting"))
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_backs_off_and_recovers() {
        let mut flaky = Steps::new(20230701000000, "flaky", 1);
        flaky.fail_first = true;
        let (worker, _) = worker(vec![flaky]);

        let started = tokio::time::Instant::now();
        let summary = worker.run_until_idle(Some(5)).await.unwrap();
        assert_eq!(summary.failed_ticks, 1);
        assert_eq!(summary.completed.len(), 1);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_idle_when_nothing_registered() {
        let (worker, _) = worker(Vec::new());
        assert!(worker.perform().await.unwrap().is_none());
        let summary = worker.run_until_idle(None).await.unwrap();
        assert_eq!(summary.ticks, 1);
    }
}
