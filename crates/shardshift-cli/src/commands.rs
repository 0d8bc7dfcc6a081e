//! Command implementations.

use anyhow::{bail, Context, Result};
use shardshift_core::{
    DynDocumentStore, ElasticClient, IndexingControl, MigrationRecord, MigrationRegistry,
    MigrationRunner, MigrationWorker, OrphanCleanupQueue, ShardshiftConfig, SqliteCheckpointStore,
};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything a command needs, wired from the configuration file.
pub struct App {
    runner: Arc<MigrationRunner>,
    state: Arc<SqliteCheckpointStore>,
    cleanup: Option<JoinHandle<()>>,
}

impl App {
    pub fn build(config_path: &Path, state_override: Option<&Path>) -> Result<Self> {
        let config = ShardshiftConfig::load(config_path)?;
        let state_path = state_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.state_path());
        let state = Arc::new(
            SqliteCheckpointStore::new(&state_path)
                .with_context(|| format!("Failed to open {}", state_path.display()))?,
        );
        info!("State database: {}", state_path.display());

        let store: DynDocumentStore = Arc::new(ElasticClient::new(&config.elasticsearch)?);
        let registry = MigrationRegistry::from_definitions(&config.migrations)?;
        info!(
            "{} migrations configured against {}",
            registry.len(),
            config.elasticsearch.url
        );

        let mut runner = MigrationRunner::new(store.clone(), state.clone())
            .with_indexing_control(state.clone())
            .with_registry(registry);

        let mut cleanup = None;
        if let Some(target) = config.cleanup_target() {
            info!(
                "Orphaned documents are deleted from {} by {}",
                target.index, target.entity_field
            );
            let (queue, handle) = OrphanCleanupQueue::spawn(store, target);
            runner = runner.with_orphan_cleanup(Arc::new(queue));
            cleanup = Some(handle);
        }

        Ok(Self {
            runner: Arc::new(runner),
            state,
            cleanup,
        })
    }

    pub async fn run(&self, max_ticks: Option<usize>) -> Result<()> {
        let worker = MigrationWorker::new(self.runner.clone());
        tokio::select! {
            summary = worker.run_until_idle(max_ticks) => {
                let summary = summary?;
                info!(
                    "Finished after {} ticks: {} completed, {} failed ticks",
                    summary.ticks,
                    summary.completed.len(),
                    summary.failed_ticks
                );
                if let Some(halted) = summary.halted {
                    bail!("Migration {} is halted; reset it to retry", halted);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
            }
        }
        Ok(())
    }

    pub async fn tick(&self) -> Result<()> {
        let worker = MigrationWorker::new(self.runner.clone());
        match worker.perform().await? {
            Some(outcome) => println!(
                "{}\t{}\tnext tick in {}s",
                outcome.identity,
                outcome.disposition,
                outcome.next_delay.as_secs()
            ),
            None => println!("No pending migrations"),
        }
        Ok(())
    }

    pub fn status(&self) -> Result<()> {
        for migration in self.runner.registry().iter() {
            let record = self.runner.record(migration.identity())?;
            let label = if migration.obsolete() {
                "obsolete"
            } else {
                status_label(&record)
            };
            println!(
                "{}\t{}\tretry={}\t{}",
                record.identity,
                label,
                record.state.retry_attempt(),
                serde_json::to_string(record.state.as_map())?
            );
            if let Some(message) = &record.failure_message {
                println!("\tfailure: {}", message);
            }
        }
        println!(
            "indexing: {}",
            if self.state.is_paused()? { "paused" } else { "running" }
        );
        Ok(())
    }

    pub fn reset(&self, version: u64) -> Result<()> {
        let Some(migration) = self.runner.registry().find_by_version(version) else {
            bail!("No migration with version {}", version);
        };
        if !self.runner.reset(migration.identity())? {
            warn!("Migration {} had no recorded progress", migration.identity());
        }
        Ok(())
    }

    pub fn set_paused(&self, paused: bool) -> Result<()> {
        self.state.set_paused(paused)?;
        info!("Indexing {}", if paused { "paused" } else { "resumed" });
        Ok(())
    }

    /// Drop the runner and wait for queued orphan cleanups to drain.
    pub async fn shutdown(self) {
        let Self {
            runner, cleanup, ..
        } = self;
        drop(runner);
        if let Some(handle) = cleanup {
            if let Err(e) = handle.await {
                warn!("Orphan cleanup task ended abnormally: {}", e);
            }
        }
    }
}

fn status_label(record: &MigrationRecord) -> &'static str {
    if record.completed {
        "completed"
    } else if record.halted {
        "halted"
    } else if record.started() {
        "running"
    } else {
        "pending"
    }
}
