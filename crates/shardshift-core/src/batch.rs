//! Batch sizing, throttling and the per-tick outcome vocabulary.

use crate::config::MigrationDefaults;
use crate::retry::BackoffPolicy;
use std::fmt;
use std::time::Duration;

/// Per-migration behaviour switches.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOptions {
    /// Work is split across many ticks and progress is checkpointed.
    pub batched: bool,
    pub batch_size: u64,
    /// Delay between ticks.
    pub throttle_delay: Duration,
    /// Pause application indexing while the migration runs.
    pub pause_indexing: bool,
    /// Refuse to start without enough free cluster space.
    pub space_requirements: bool,
    /// Count failures and halt after `max_attempts`.
    pub retry_on_failure: bool,
    pub max_attempts: u32,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batched: false,
            batch_size: MigrationDefaults::BATCH_SIZE,
            throttle_delay: MigrationDefaults::THROTTLE_DELAY,
            pause_indexing: false,
            space_requirements: false,
            retry_on_failure: false,
            max_attempts: MigrationDefaults::MAX_ATTEMPTS,
        }
    }
}

impl MigrationOptions {
    /// Options for a single-step migration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make progress over many ticks instead of one.
    pub fn batched(mut self) -> Self {
        self.batched = true;
        self
    }

    /// Set the number of documents per launched task.
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the delay between ticks.
    pub fn with_throttle_delay(mut self, delay: Duration) -> Self {
        self.throttle_delay = delay;
        self
    }

    /// Pause application indexing while the migration runs.
    pub fn pause_indexing(mut self) -> Self {
        self.pause_indexing = true;
        self
    }

    /// Check cluster free space before starting.
    pub fn space_requirements(mut self) -> Self {
        self.space_requirements = true;
        self
    }

    /// Retry failed ticks up to the attempt ceiling.
    pub fn retry_on_failure(mut self) -> Self {
        self.retry_on_failure = true;
        self
    }

    /// Set the retry ceiling (at least 1).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

/// Sizing and pacing for one migration.
#[derive(Debug, Clone)]
pub struct BatchController {
    batch_size: u64,
    throttle_delay: Duration,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl BatchController {
    pub fn new(options: &MigrationOptions) -> Self {
        let backoff = BackoffPolicy::new()
            .with_base_delay(options.throttle_delay)
            .with_max_delay(MigrationDefaults::MAX_BACKOFF_DELAY.max(options.throttle_delay))
            .with_jitter(false);

        Self {
            batch_size: options.batch_size,
            throttle_delay: options.throttle_delay,
            max_attempts: options.max_attempts,
            backoff,
        }
    }

    /// Get the batch size.
    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// Get the throttle delay.
    pub fn throttle_delay(&self) -> Duration {
        self.throttle_delay
    }

    /// Get the retry ceiling.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether `retry_attempt` failures exhaust the budget.
    pub fn ceiling_reached(&self, retry_attempt: u32) -> bool {
        retry_attempt >= self.max_attempts
    }

    /// Delay before the next tick.
    ///
    /// Equal to the throttle delay while healthy. After failures it grows
    /// exponentially from the throttle delay, capped at
    /// [`MigrationDefaults::MAX_BACKOFF_DELAY`].
    pub fn next_delay(&self, retry_attempt: u32) -> Duration {
        if retry_attempt == 0 {
            return self.throttle_delay;
        }
        self.throttle_delay
            .max(self.backoff.delay_for(retry_attempt - 1))
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// First tick: initial state was computed and persisted.
    Setup,
    /// New store work was launched.
    Started,
    /// A launched task is still running.
    InProgress,
    /// A slice or task finished and the cursor moved.
    SliceOrTaskCompleted,
    /// The current permutation has no documents left.
    PermutationCompleted,
    /// The migration is done.
    Completed,
    /// Nothing was done, with the reason.
    Noop { reason: String },
    /// The retry budget ran out; operator attention needed.
    HaltedError,
}

impl Disposition {
    pub fn noop(reason: impl Into<String>) -> Self {
        Disposition::Noop {
            reason: reason.into(),
        }
    }

    /// Whether no further ticks will change anything without intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Disposition::Completed | Disposition::HaltedError)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Setup => f.write_str("setup"),
            Disposition::Started => f.write_str("started"),
            Disposition::InProgress => f.write_str("in_progress"),
            Disposition::SliceOrTaskCompleted => f.write_str("slice_or_task_completed"),
            Disposition::PermutationCompleted => f.write_str("permutation_completed"),
            Disposition::Completed => f.write_str("completed"),
            Disposition::Noop { reason } => write!(f, "noop ({})", reason),
            Disposition::HaltedError => f.write_str("halted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = MigrationOptions::default();
        assert!(!options.batched);
        assert_eq!(options.batch_size, 1_000);
        assert_eq!(options.throttle_delay, Duration::from_secs(300));
        assert_eq!(options.max_attempts, 30);
    }

    #[test]
    fn test_builder_clamps() {
        let options = MigrationOptions::new()
            .batched()
            .with_batch_size(0)
            .with_max_attempts(0);
        assert!(options.batched);
        assert_eq!(options.batch_size, 1);
        assert_eq!(options.max_attempts, 1);
    }

    #[test]
    fn test_ceiling() {
        let controller = BatchController::new(&MigrationOptions::new().with_max_attempts(30));
        assert!(!controller.ceiling_reached(29));
        assert!(controller.ceiling_reached(30));
    }

    #[test]
    fn test_next_delay_backs_off() {
        let controller = BatchController::new(
            &MigrationOptions::new().with_throttle_delay(Duration::from_secs(60)),
        );
        assert_eq!(controller.next_delay(0), Duration::from_secs(60));
        assert_eq!(controller.next_delay(1), Duration::from_secs(60));
        assert_eq!(controller.next_delay(2), Duration::from_secs(120));
        assert_eq!(controller.next_delay(4), Duration::from_secs(480));
        assert_eq!(controller.next_delay(20), Duration::from_secs(3600));
    }

    #[test]
    fn test_disposition_display() {
        assert_eq!(Disposition::Completed.to_string(), "completed");
        assert_eq!(
            Disposition::noop("insufficient space").to_string(),
            "noop (insufficient space)"
        );
        assert!(Disposition::HaltedError.is_terminal());
        assert!(!Disposition::InProgress.is_terminal());
    }
}
