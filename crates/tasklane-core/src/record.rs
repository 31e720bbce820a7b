//! Flattened persistence unit and typed store metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tasklane_a2a::TaskState;

/// Store-side metadata attached to a task record.
///
/// `expires_at` drives both lazy (read-time) and active (sweep) expiry.
/// Anything else callers want to keep next to the record goes into
/// `extra`, which is flattened into the same JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl TaskMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata that expires the record at `at`
    pub fn expiring_at(at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(at),
            extra: HashMap::new(),
        }
    }

    /// Metadata that expires the record `ttl` from now
    pub fn expiring_in(ttl: std::time::Duration) -> Self {
        Self::expiring_at(expiry_after(ttl))
    }

    /// Add an extension entry
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.expires_at.is_none() && self.extra.is_empty()
    }

    /// Patch semantics: a present `expires_at` replaces ours, extension keys
    /// overwrite one by one, everything else is kept.
    pub fn merge(&mut self, patch: TaskMetadata) {
        if patch.expires_at.is_some() {
            self.expires_at = patch.expires_at;
        }
        self.extra.extend(patch.extra);
    }

    /// Merge an optional patch into optional existing metadata
    pub fn merged(
        existing: Option<TaskMetadata>,
        patch: Option<TaskMetadata>,
    ) -> Option<TaskMetadata> {
        match (existing, patch) {
            (Some(mut base), Some(patch)) => {
                base.merge(patch);
                Some(base)
            }
            (base, None) => base,
            (None, patch) => patch,
        }
    }
}

/// Absolute expiry `ttl` from now, saturating at the latest representable time
pub fn expiry_after(ttl: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A task flattened for persistence.
///
/// `task_id`, `context_id`, `state`, `status_message` and `status_timestamp`
/// are projections of the task serialized in `task_data` and are rewritten
/// together on every write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub task_id: String,
    pub context_id: String,
    pub state: TaskState,
    /// Serialized task JSON
    pub task_data: String,
    /// Serialized `status.message` JSON
    pub status_message: Option<String>,
    /// Parsed `status.timestamp`, used for ordering and age queries
    pub status_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<TaskMetadata>,
    /// Monotonic write counter, starts at 1
    pub version: u64,
}

impl StoredRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time used by `since`/`until` filters: the status timestamp, or the
    /// last write when the task carries none.
    pub fn activity_time(&self) -> DateTime<Utc> {
        self.status_timestamp.unwrap_or(self.updated_at)
    }

    /// Carry identity over from the record this one replaces
    pub fn succeed(&mut self, previous: &StoredRecord) {
        self.created_at = previous.created_at;
        self.version = previous.version + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn merge_keeps_existing_expiry_when_patch_has_none() {
        let at = Utc::now() + Duration::hours(1);
        let mut meta = TaskMetadata::expiring_at(at).with("owner", json!("alice"));
        meta.merge(TaskMetadata::new().with("priority", json!(3)));

        assert_eq!(meta.expires_at, Some(at));
        assert_eq!(meta.extra["owner"], json!("alice"));
        assert_eq!(meta.extra["priority"], json!(3));
    }

    #[test]
    fn merge_overwrites_expiry_and_keys() {
        let later = Utc::now() + Duration::days(2);
        let mut meta = TaskMetadata::expiring_at(Utc::now()).with("owner", json!("alice"));
        meta.merge(TaskMetadata::expiring_at(later).with("owner", json!("bob")));

        assert_eq!(meta.expires_at, Some(later));
        assert_eq!(meta.extra["owner"], json!("bob"));
    }

    #[test]
    fn metadata_flattens_extension_keys() {
        let at = DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let meta = TaskMetadata::expiring_at(at).with("source", json!("chat"));
        let value = serde_json::to_value(&meta).unwrap();

        assert_eq!(value["source"], "chat");
        assert!(value["expiresAt"].as_str().unwrap().starts_with("2030-01-01T00:00:00"));

        let parsed: TaskMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn merged_handles_absent_sides() {
        let patch = TaskMetadata::new().with("k", json!(1));
        assert_eq!(TaskMetadata::merged(None, Some(patch.clone())), Some(patch.clone()));
        assert_eq!(TaskMetadata::merged(Some(patch.clone()), None), Some(patch));
        assert_eq!(TaskMetadata::merged(None, None), None);
    }
}
