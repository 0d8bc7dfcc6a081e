//! Permutation iteration for backfills.
//!
//! Documents are updated one attribute combination at a time. The matrix of
//! combinations is the sorted cross product of each attribute's values, so
//! `permutation_idx` means the same thing on every tick and every process.

use crate::batch::{BatchController, Disposition};
use crate::error::{MigrationError, Result};
use crate::migration::MigrationContext;
use crate::store::{poll_task, refreshed_count, ByQueryOptions, TaskHandle, TaskPoll};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

/// Possible values of one document attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDomain {
    pub field: String,
    pub values: Vec<i64>,
}

impl AttributeDomain {
    pub fn new(field: impl Into<String>, values: impl IntoIterator<Item = i64>) -> Self {
        Self {
            field: field.into(),
            values: values.into_iter().collect(),
        }
    }
}

/// One combination of attribute values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    pub index: usize,
    /// `(field, value)` pairs in domain order.
    pub assignments: Vec<(String, i64)>,
}

impl Permutation {
    pub fn value_of(&self, field: &str) -> Option<i64> {
        self.assignments
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| *value)
    }
}

/// Deterministic cross product of attribute domains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermutationMatrix {
    domains: Vec<AttributeDomain>,
}

impl PermutationMatrix {
    /// Values within each domain are sorted and deduplicated.
    pub fn new(domains: Vec<AttributeDomain>) -> Self {
        let domains = domains
            .into_iter()
            .map(|mut domain| {
                domain.values.sort_unstable();
                domain.values.dedup();
                domain
            })
            .collect();
        Self { domains }
    }

    pub fn domains(&self) -> &[AttributeDomain] {
        &self.domains
    }

    pub fn len(&self) -> usize {
        if self.domains.is_empty() {
            return 0;
        }
        self.domains
            .iter()
            .map(|domain| domain.values.len())
            .product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combination at `index`, first domain varying slowest.
    pub fn get(&self, index: usize) -> Option<Permutation> {
        if index >= self.len() {
            return None;
        }

        let mut remainder = index;
        let mut assignments = vec![(String::new(), 0); self.domains.len()];
        for (slot, domain) in self.domains.iter().enumerate().rev() {
            let radix = domain.values.len();
            assignments[slot] = (domain.field.clone(), domain.values[remainder % radix]);
            remainder /= radix;
        }
        Some(Permutation { index, assignments })
    }

    pub fn iter(&self) -> impl Iterator<Item = Permutation> + '_ {
        (0..self.len()).filter_map(move |index| self.get(index))
    }
}

/// Checkpoint view for permutation iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermutationState {
    #[serde(default)]
    pub permutation_idx: Option<usize>,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default)]
    pub task_id: Option<TaskHandle>,
    #[serde(default)]
    pub documents_remaining: Option<u64>,
    #[serde(default)]
    pub documents_remaining_for_permutation: Option<u64>,
}

/// Queries and scripts behind a permutation backfill.
pub trait PermutationPlan: Send + Sync {
    fn index_name(&self) -> &str;

    fn matrix(&self) -> &PermutationMatrix;

    /// Documents still needing the change, across all permutations.
    fn remaining_query(&self) -> Value;

    /// Documents of one permutation still needing the change.
    fn permutation_query(&self, permutation: &Permutation) -> Value;

    /// Painless script applied to every matched document.
    fn update_script(&self, permutation: &Permutation) -> Value;
}

/// Drives a [`PermutationPlan`] one tick at a time.
#[derive(Debug, Clone)]
pub struct PermutationIterator {
    batch: BatchController,
}

impl PermutationIterator {
    pub fn new(batch: BatchController) -> Self {
        Self { batch }
    }

    pub async fn step(
        &self,
        plan: &dyn PermutationPlan,
        ctx: &mut MigrationContext<'_>,
    ) -> Result<Disposition> {
        let identity = ctx.identity();
        let store = ctx.store();
        let index = plan.index_name();
        let mut state: PermutationState = ctx.checkpoint().decode()?;

        let Some(idx) = state.permutation_idx else {
            let remaining = refreshed_count(store, index, &plan.remaining_query()).await?;
            state = PermutationState {
                permutation_idx: Some(0),
                retry_attempt: 0,
                task_id: None,
                documents_remaining: Some(remaining),
                documents_remaining_for_permutation: None,
            };
            ctx.checkpoint_mut().encode(&state)?;
            info!(
                "[migration {}] Setup complete: {} permutations, {} documents remaining",
                identity,
                plan.matrix().len(),
                remaining
            );
            return Ok(Disposition::Setup);
        };

        let Some(permutation) = plan.matrix().get(idx) else {
            return Ok(Disposition::noop(format!(
                "permutation index {} is out of range ({} permutations)",
                idx,
                plan.matrix().len()
            )));
        };

        if self.batch.ceiling_reached(state.retry_attempt) {
            error!(
                "[migration {}] Permutation {} failed {} times, halting",
                identity, idx, state.retry_attempt
            );
            return Ok(Disposition::HaltedError);
        }

        let remaining = refreshed_count(store, index, &plan.remaining_query()).await?;
        let remaining_for_permutation = store
            .count(index, &json!({ "query": plan.permutation_query(&permutation) }))
            .await?;
        state.documents_remaining = Some(remaining);
        state.documents_remaining_for_permutation = Some(remaining_for_permutation);

        if remaining == 0 {
            ctx.checkpoint_mut().encode(&state)?;
            info!("[migration {}] No documents remaining", identity);
            return Ok(Disposition::Completed);
        }

        if remaining_for_permutation == 0 {
            state.permutation_idx = Some(idx + 1);
            state.retry_attempt = 0;
            state.task_id = None;
            ctx.checkpoint_mut().encode(&state)?;
            info!(
                "[migration {}] Permutation {} {:?} completed",
                identity, idx, permutation.assignments
            );
            return Ok(Disposition::PermutationCompleted);
        }

        if let Some(task) = state.task_id.clone() {
            return match poll_task(store, &task).await? {
                TaskPoll::Running => {
                    ctx.checkpoint_mut().encode(&state)?;
                    debug!(
                        "[migration {}] Update for permutation {} still in progress (task {})",
                        identity, idx, task
                    );
                    Ok(Disposition::InProgress)
                }
                TaskPoll::Succeeded => {
                    state.task_id = None;
                    ctx.checkpoint_mut().encode(&state)?;
                    debug!(
                        "[migration {}] Batch for permutation {} finished, {} documents left in it",
                        identity, idx, remaining_for_permutation
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

        let body = json!({
            "query": plan.permutation_query(&permutation),
            "script": plan.update_script(&permutation),
        });
        let options = ByQueryOptions::new().with_max_docs(self.batch.batch_size());
        let response = store.update_by_query(index, &body, &options).await?;

        let Some(task) = response.task else {
            warn!(
                "[migration {}] update_by_query for permutation {} returned failures",
                identity, idx
            );
            return Err(MigrationError::DocumentStore {
                message: format!(
                    "update_by_query failed: {}",
                    Value::Array(response.failures)
                ),
                status: None,
            });
        };

        info!(
            "[migration {}] Launched update for permutation {} (task {}, {} documents left in it)",
            identity, idx, task, remaining_for_permutation
        );
        state.task_id = Some(task);
        ctx.checkpoint_mut().encode(&state)?;
        Ok(Disposition::Started)
    }
}
