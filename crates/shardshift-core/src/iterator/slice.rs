//! Numeric slice iteration for reindexing.
//!
//! The first tick freezes `max_slices` (normally the source shard count).
//! Each later tick either polls the running slice task or launches the next
//! slice.

use crate::batch::{BatchController, Disposition};
use crate::error::{MigrationError, Result};
use crate::migration::MigrationContext;
use crate::store::{poll_task, DocumentStore, TaskHandle, TaskPoll};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Checkpoint view for slice iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SliceState {
    #[serde(default)]
    pub slice: Option<u32>,
    #[serde(default)]
    pub max_slices: Option<u32>,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default)]
    pub task_id: Option<TaskHandle>,
}

impl SliceState {
    /// All slices have been copied.
    pub fn done(&self) -> bool {
        matches!((self.slice, self.max_slices), (Some(slice), Some(max)) if slice >= max)
    }
}

/// The store work behind each slice.
#[async_trait]
pub trait SlicePlan: Send + Sync {
    /// Prepare the destination and return the number of slices.
    async fn setup(&self, store: &dyn DocumentStore) -> Result<u32>;

    async fn launch_slice(
        &self,
        store: &dyn DocumentStore,
        slice: u32,
        max_slices: u32,
    ) -> Result<TaskHandle>;
}

/// Drives a [`SlicePlan`] one tick at a time.
#[derive(Debug, Clone)]
pub struct SliceIterator {
    batch: BatchController,
}

impl SliceIterator {
    pub fn new(batch: BatchController) -> Self {
        Self { batch }
    }

    pub async fn step(
        &self,
        plan: &dyn SlicePlan,
        ctx: &mut MigrationContext<'_>,
    ) -> Result<Disposition> {
        let identity = ctx.identity();
        let store = ctx.store();
        let mut state: SliceState = ctx.checkpoint().decode()?;

        let Some(slice) = state.slice else {
            let max_slices = plan.setup(store).await?.max(1);
            state = SliceState {
                slice: Some(0),
                max_slices: Some(max_slices),
                retry_attempt: 0,
                task_id: None,
            };
            ctx.checkpoint_mut().encode(&state)?;
            info!("[migration {}] Setup complete with {} slices", identity, max_slices);
            return Ok(Disposition::Setup);
        };

        let max_slices = state
            .max_slices
            .ok_or_else(|| MigrationError::InvalidCheckpoint {
                migration: identity.to_string(),
                message: "slice recorded without max_slices".into(),
            })?;

        if self.batch.ceiling_reached(state.retry_attempt) {
            error!(
                "[migration {}] Slice {} failed {} times, halting",
                identity, slice, state.retry_attempt
            );
            return Ok(Disposition::HaltedError);
        }

        if slice >= max_slices {
            return Ok(Disposition::noop(format!(
                "all {} slices processed",
                max_slices
            )));
        }

        if let Some(task) = state.task_id.clone() {
            return match poll_task(store, &task).await? {
                TaskPoll::Running => {
                    debug!(
                        "[migration {}] Slice {}/{} still running (task {})",
                        identity, slice, max_slices, task
                    );
                    Ok(Disposition::InProgress)
                }
                TaskPoll::Succeeded => {
                    state.slice = Some(slice + 1);
                    state.retry_attempt = 0;
                    state.task_id = None;
                    ctx.checkpoint_mut().encode(&state)?;
                    info!(
                        "[migration {}] Slice {}/{} completed",
                        identity,
                        slice + 1,
                        max_slices
                    );
                    Ok(Disposition::SliceOrTaskCompleted)
                }
                TaskPoll::Failed(reason) => Err(MigrationError::TaskFailed {
                    task_id: task.to_string(),
                    reason,
                }),
                TaskPoll::NotFound => Err(MigrationError::TaskNotFound {
                    task_id: task.to_string(),
                }),
            };
        }

        let task = plan.launch_slice(store, slice, max_slices).await?;
        info!(
            "[migration {}] Launched slice {}/{} (task {})",
            identity, slice, max_slices, task
        );
        state.task_id = Some(task);
        ctx.checkpoint_mut().encode(&state)?;
        Ok(Disposition::Started)
    }
}
