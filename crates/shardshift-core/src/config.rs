//! Centralized configuration for shardshift.
//!
//! Constant tables hold the engine defaults; `ShardshiftConfig` is the JSON
//! file the CLI loads (store connection plus migration definitions).

use crate::error::{MigrationError, Result};
use crate::migrations::MigrationDefinition;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Defaults shared by every migration.
pub struct MigrationDefaults;

impl MigrationDefaults {
    pub const BATCH_SIZE: u64 = 1_000;
    pub const THROTTLE_DELAY: Duration = Duration::from_secs(300);
    /// Retry ceiling per slice/permutation (`MAX_ATTEMPTS_PER_SLICE`, `MAX_ATTEMPTS_PER_IDX`).
    pub const MAX_ATTEMPTS: u32 = 30;
    /// Upper bound on concurrently tracked entities for fan-out migrations.
    pub const MAX_ENTITIES_TO_PROCESS: usize = 50;
    /// Backoff after repeated failures never waits longer than this.
    pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(3600);
}

/// Document store defaults.
pub struct StoreDefaults;

impl StoreDefaults {
    pub const URL: &'static str = "http://localhost:9200";
    /// Store-side timeout passed to long-running mutating calls.
    pub const TASK_TIMEOUT: &'static str = "5m";
    /// Client-side timeout for synchronous metadata reads (counts, task status).
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
    pub const METADATA_RETRY_ATTEMPTS: u32 = 3;
    pub const METADATA_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const USER_AGENT: &'static str = "shardshift/0.6";
}

/// Shared path configuration.
pub struct PathsConfig;

impl PathsConfig {
    pub const STATE_DB_FILENAME: &'static str = "shardshift-state.sqlite";
}

/// Connection settings for the Elasticsearch cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: StoreDefaults::URL.to_string(),
            username: None,
            password: None,
            request_timeout_secs: StoreDefaults::REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl ElasticConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Where orphaned entity documents are deleted from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupTarget {
    pub index: String,
    /// Document field holding the entity id, e.g. `project_id`.
    pub entity_field: String,
    /// Routing prefix; the entity id is appended (`project_` gives `project_42`).
    #[serde(default)]
    pub routing_prefix: Option<String>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardshiftConfig {
    pub elasticsearch: ElasticConfig,
    /// SQLite database holding migration records.
    pub state_path: Option<PathBuf>,
    pub orphan_cleanup: Option<CleanupTarget>,
    pub migrations: Vec<MigrationDefinition>,
}

impl ShardshiftConfig {
    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| MigrationError::io_with_path(e, path))?;
        Self::from_json_str(&raw).map_err(|e| MigrationError::Config {
            message: format!("Failed to parse {}: {}", path.display(), e),
        })
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate migration versions.
    pub fn validate(&self) -> Result<()> {
        let mut versions: Vec<u64> = self.migrations.iter().map(|m| m.version).collect();
        versions.sort_unstable();
        if let Some(pair) = versions.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(MigrationError::Config {
                message: format!("Duplicate migration version {}", pair[0]),
            });
        }
        Ok(())
    }

    /// The configured `orphan_cleanup`, else the index of the earliest
    /// pending fan-out migration.
    pub fn cleanup_target(&self) -> Option<CleanupTarget> {
        if let Some(target) = &self.orphan_cleanup {
            return Some(target.clone());
        }
        self.migrations
            .iter()
            .filter(|definition| !definition.obsolete)
            .filter_map(|definition| Some((definition.version, definition.cleanup_target()?)))
            .min_by_key(|(version, _)| *version)
            .map(|(_, target)| target)
    }

    /// State database path, falling back to the working directory.
    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(PathsConfig::STATE_DB_FILENAME))
    }
}
