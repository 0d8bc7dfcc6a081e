//! Migration identity: a timestamp version plus a stable name.

use crate::error::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifies one migration and keys its checkpoint.
///
/// Identities order by version first, so registering migrations in any order
/// still runs them oldest-first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationIdentity {
    version: u64,
    name: String,
}

impl MigrationIdentity {
    /// Create an identity from a version timestamp and a snake_case name.
    pub fn new(version: u64, name: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
        }
    }

    /// Parse `"20230503064300_backfill_project_permissions"` style identifiers.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim().trim_end_matches(".rb");
        let (version, name) = raw.split_once('_').ok_or_else(|| MigrationError::Config {
            message: format!("Migration identifier '{}' must look like <version>_<name>", raw),
        })?;

        let version = version.parse::<u64>().map_err(|_| MigrationError::Config {
            message: format!("Migration version '{}' is not a number", version),
        })?;

        if name.is_empty() {
            return Err(MigrationError::Config {
                message: format!("Migration identifier '{}' has an empty name", raw),
            });
        }

        Ok(Self::new(version, name))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Ord for MigrationIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for MigrationIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MigrationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.version, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identifier() {
        let id = MigrationIdentity::parse("20230503064300_backfill_project_permissions_in_blobs")
            .unwrap();
        assert_eq!(id.version(), 20230503064300);
        assert_eq!(id.name(), "backfill_project_permissions_in_blobs");
        assert_eq!(
            id.to_string(),
            "20230503064300_backfill_project_permissions_in_blobs"
        );
    }

    #[test]
    fn test_parse_strips_ruby_suffix() {
        let id = MigrationIdentity::parse("20230724221548_remove_wikis_from_main_index.rb").unwrap();
        assert_eq!(id.name(), "remove_wikis_from_main_index");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(MigrationIdentity::parse("no_version_here").is_err());
        assert!(MigrationIdentity::parse("20230724221548").is_err());
        assert!(MigrationIdentity::parse("20230724221548_").is_err());
    }

    #[test]
    fn test_ordering_by_version() {
        let mut ids = vec![
            MigrationIdentity::new(20230821123542, "backfill_archived_field_in_blob"),
            MigrationIdentity::new(20220119120500, "populate_commit_permissions"),
            MigrationIdentity::new(20230405500000, "backfill_wiki_permissions"),
        ];
        ids.sort();
        let versions: Vec<u64> = ids.iter().map(|id| id.version()).collect();
        assert_eq!(versions, vec![20220119120500, 20230405500000, 20230821123542]);
    }
}
