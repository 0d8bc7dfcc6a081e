//! SQLite-based checkpoint store.

use super::state::{Checkpoint, MigrationRecord};
use super::traits::CheckpointStore;
use crate::error::{MigrationError, Result};
use crate::identity::MigrationIdentity;
use crate::indexing::IndexingControl;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const PAUSE_INDEXING_KEY: &str = "elasticsearch_pause_indexing";

/// SQLite-backed store for migration records and the pause-indexing setting.
///
/// Thread-safe via internal mutex on the connection. Every save is a single
/// `INSERT OR REPLACE`, so a record written by one tick is fully visible to
/// the next even across crashes.
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Open (or create) the store at the given database path.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| MigrationError::Io {
                    message: format!("Failed to create state directory: {}", e),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path).map_err(|e| MigrationError::Database {
            message: format!("Failed to open state database: {}", e),
            source: Some(e),
        })?;

        // WAL keeps readers (status queries) from blocking the runner
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| MigrationError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        Self::with_connection(conn)
    }

    /// In-memory store, mostly for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| MigrationError::Database {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            -- One row per migration version
            CREATE TABLE IF NOT EXISTS migration_records (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                started_at TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT,
                halted INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                failure_message TEXT,
                pause_indexing INTEGER,
                halted_indexing_unpaused INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            -- Application settings (pause indexing flag)
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| MigrationError::Database {
            message: format!("Failed to initialize state schema: {}", e),
            source: Some(e),
        })?;

        Ok(())
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok(RawRecord {
            version: row.get::<_, i64>(0)?,
            name: row.get(1)?,
            state: row.get(2)?,
            started_at: row.get(3)?,
            completed: row.get(4)?,
            completed_at: row.get(5)?,
            halted: row.get(6)?,
            failed: row.get(7)?,
            failure_message: row.get(8)?,
            pause_indexing: row.get(9)?,
            halted_indexing_unpaused: row.get(10)?,
        })
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(|e| MigrationError::Database {
            message: format!("Failed to update setting {}: {}", key, e),
            source: Some(e),
        })?;
        Ok(())
    }
}

const SELECT_RECORD: &str = r#"
    SELECT version, name, state, started_at, completed, completed_at, halted, failed,
           failure_message, pause_indexing, halted_indexing_unpaused
    FROM migration_records
"#;

/// Row shape before timestamp and JSON decoding.
struct RawRecord {
    version: i64,
    name: String,
    state: String,
    started_at: Option<String>,
    completed: bool,
    completed_at: Option<String>,
    halted: bool,
    failed: bool,
    failure_message: Option<String>,
    pause_indexing: Option<bool>,
    halted_indexing_unpaused: bool,
}

impl RawRecord {
    fn into_record(self) -> Result<MigrationRecord> {
        let version = u64::try_from(self.version).map_err(|_| MigrationError::InvalidCheckpoint {
            migration: format!("{}_{}", self.version, self.name),
            message: "negative version".into(),
        })?;
        let identity = MigrationIdentity::new(version, self.name);
        let state: Checkpoint =
            serde_json::from_str(&self.state).map_err(|e| MigrationError::InvalidCheckpoint {
                migration: identity.to_string(),
                message: e.to_string(),
            })?;

        Ok(MigrationRecord {
            state,
            started_at: parse_timestamp(self.started_at.as_deref()),
            completed: self.completed,
            completed_at: parse_timestamp(self.completed_at.as_deref()),
            halted: self.halted,
            failed: self.failed,
            failure_message: self.failure_message,
            pause_indexing: self.pause_indexing,
            halted_indexing_unpaused: self.halted_indexing_unpaused,
            identity,
        })
    }
}

/// SQLite integers are signed; versions past `i64::MAX` cannot be stored.
fn version_column(identity: &MigrationIdentity) -> Result<i64> {
    i64::try_from(identity.version()).map_err(|_| MigrationError::Config {
        message: format!(
            "Migration version {} does not fit the state database",
            identity.version()
        ),
    })
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load_record(&self, identity: &MigrationIdentity) -> Result<Option<MigrationRecord>> {
        let version = version_column(identity)?;
        let conn = self.lock()?;

        let raw = conn
            .query_row(
                &format!("{} WHERE version = ?1", SELECT_RECORD),
                params![version],
                Self::record_from_row,
            )
            .optional()
            .map_err(|e| MigrationError::Database {
                message: format!("Failed to query migration record: {}", e),
                source: Some(e),
            })?;

        raw.map(RawRecord::into_record).transpose()
    }

    fn save_record(&self, record: &MigrationRecord) -> Result<()> {
        let version = version_column(&record.identity)?;
        let state = serde_json::to_string(&record.state)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO migration_records
            (version, name, state, started_at, completed, completed_at, halted, failed,
             failure_message, pause_indexing, halted_indexing_unpaused, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                version,
                record.identity.name(),
                state,
                record.started_at.map(|t| t.to_rfc3339()),
                record.completed,
                record.completed_at.map(|t| t.to_rfc3339()),
                record.halted,
                record.failed,
                record.failure_message,
                record.pause_indexing,
                record.halted_indexing_unpaused,
                now,
            ],
        )
        .map_err(|e| MigrationError::Database {
            message: format!("Failed to save migration record: {}", e),
            source: Some(e),
        })?;

        debug!("Saved state for migration {}", record.identity);
        Ok(())
    }

    fn reset(&self, identity: &MigrationIdentity) -> Result<bool> {
        let version = version_column(identity)?;
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM migration_records WHERE version = ?1",
                params![version],
            )
            .map_err(|e| MigrationError::Database {
                message: format!("Failed to reset migration record: {}", e),
                source: Some(e),
            })?;

        if deleted > 0 {
            info!("Reset migration {}", identity);
        }
        Ok(deleted > 0)
    }

    fn list_records(&self) -> Result<Vec<MigrationRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY version ASC", SELECT_RECORD))?;
        let rows = stmt.query_map([], Self::record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

impl IndexingControl for SqliteCheckpointStore {
    fn is_paused(&self) -> Result<bool> {
        Ok(self
            .get_setting(PAUSE_INDEXING_KEY)?
            .map(|value| value == "true")
            .unwrap_or(false))
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        self.set_setting(PAUSE_INDEXING_KEY, if paused { "true" } else { "false" })
    }
}
