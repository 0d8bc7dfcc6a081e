//! Checkpoint map and the per-migration record that wraps it.

use crate::error::{MigrationError, Result};
use crate::identity::MigrationIdentity;
use crate::store::TaskHandle;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known checkpoint keys shared by the runner and the iterators.
pub mod keys {
    pub const RETRY_ATTEMPT: &str = "retry_attempt";
    pub const TASK_ID: &str = "task_id";
}

/// Arbitrary JSON progress state for one migration.
///
/// Only `serde_json::Value`s can be stored, so a checkpoint is always
/// JSON-safe. It is written back whole at the end of every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(Map<String, Value>);

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn retry_attempt(&self) -> u32 {
        self.get_u64(keys::RETRY_ATTEMPT)
            .map(|attempt| attempt.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    pub fn task_id(&self) -> Option<TaskHandle> {
        self.get_str(keys::TASK_ID).map(TaskHandle::new)
    }

    /// Deserialize a typed view of the checkpoint.
    ///
    /// Unknown keys are ignored, so several views can share one checkpoint.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    /// Write a typed view back into the checkpoint.
    ///
    /// Fields serializing to `null` remove their key; other keys are left alone.
    pub fn encode<T: Serialize>(&mut self, state: &T) -> Result<()> {
        match serde_json::to_value(state)? {
            Value::Object(fields) => {
                for (key, value) in fields {
                    if value.is_null() {
                        self.0.remove(&key);
                    } else {
                        self.0.insert(key, value);
                    }
                }
                Ok(())
            }
            other => Err(MigrationError::Json {
                message: format!("Checkpoint state must serialize to an object, got {}", other),
                source: None,
            }),
        }
    }
}

/// Persistent record of one migration: its checkpoint plus lifecycle flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub identity: MigrationIdentity,
    pub state: Checkpoint,
    /// First tick whose `migrate()` returned successfully.
    pub started_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Halted migrations make no progress until reset.
    pub halted: bool,
    pub failed: bool,
    pub failure_message: Option<String>,
    /// `Some(true)` when this migration paused indexing and owns the resume.
    pub pause_indexing: Option<bool>,
    pub halted_indexing_unpaused: bool,
}

impl MigrationRecord {
    pub fn new(identity: MigrationIdentity) -> Self {
        Self {
            identity,
            state: Checkpoint::new(),
            started_at: None,
            completed: false,
            completed_at: None,
            halted: false,
            failed: false,
            failure_message: None,
            pause_indexing: None,
            halted_indexing_unpaused: false,
        }
    }

    pub fn started(&self) -> bool {
        self.started_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct View {
        slice: Option<u32>,
        #[serde(default)]
        retry_attempt: u32,
        task_id: Option<TaskHandle>,
    }

    #[test]
    fn test_decode_empty_checkpoint() {
        let view: View = Checkpoint::new().decode().unwrap();
        assert_eq!(view, View::default());
    }

    #[test]
    fn test_encode_removes_null_fields() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.set("task_id", "abc:1");
        checkpoint.set("max_slices", 4);

        let view = View {
            slice: Some(1),
            retry_attempt: 0,
            task_id: None,
        };
        checkpoint.encode(&view).unwrap();

        assert!(!checkpoint.contains("task_id"));
        assert_eq!(checkpoint.get_u64("slice"), Some(1));
        // keys outside the view are preserved
        assert_eq!(checkpoint.get_u64("max_slices"), Some(4));
    }

    #[test]
    fn test_encode_rejects_non_object() {
        let mut checkpoint = Checkpoint::new();
        assert!(checkpoint.encode(&42u32).is_err());
    }

    #[test]
    fn test_retry_attempt_and_task_accessors() {
        let checkpoint: Checkpoint =
            serde_json::from_value(json!({ "retry_attempt": 3, "task_id": "node:7" })).unwrap();
        assert_eq!(checkpoint.retry_attempt(), 3);
        assert_eq!(checkpoint.task_id(), Some(TaskHandle::new("node:7")));
        assert_eq!(Checkpoint::new().retry_attempt(), 0);
    }

    #[test]
    fn test_checkpoint_serializes_as_plain_object() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.set(
            "projects_in_progress",
            json!([{ "project_id": 1, "task_id": "t:1" }]),
        );
        let raw = serde_json::to_string(&checkpoint).unwrap();
        assert_eq!(raw, r#"{"projects_in_progress":[{"project_id":1,"task_id":"t:1"}]}"#);
    }
}
