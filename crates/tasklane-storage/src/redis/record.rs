//! Stored records as flat Redis hashes.
//!
//! Times are epoch milliseconds so Lua scripts can compare them; an empty
//! string stands for an absent optional field, which lets an update rewrite
//! every field with one `HSET`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tasklane_a2a::TaskState;
use tasklane_core::{
    IntegrityViolation, StorageBackend, StorageErrorKind, StoreOperation, StoredRecord,
    TaskMetadata, TaskStoreError, TaskStoreResult,
};

pub const TASK_ID: &str = "taskId";
pub const CONTEXT_ID: &str = "contextId";
pub const STATE: &str = "state";
pub const TASK_DATA: &str = "taskData";
pub const STATUS_MESSAGE: &str = "statusMessage";
pub const STATUS_TIMESTAMP: &str = "statusTimestamp";
pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";
pub const EXPIRES_AT: &str = "expiresAt";
pub const METADATA: &str = "metadata";
pub const VERSION: &str = "version";

const BACKEND: StorageBackend = StorageBackend::Redis;

/// Flatten a record into `HSET` field/value pairs
pub fn to_fields(record: &StoredRecord) -> TaskStoreResult<Vec<(&'static str, String)>> {
    let metadata = match &record.metadata {
        Some(meta) => serde_json::to_string(meta).map_err(|e| {
            serialization_error(StoreOperation::Serialize, &record.task_id, e.to_string())
        })?,
        None => String::new(),
    };

    Ok(vec![
        (TASK_ID, record.task_id.clone()),
        (CONTEXT_ID, record.context_id.clone()),
        (STATE, record.state.as_str().to_string()),
        (TASK_DATA, record.task_data.clone()),
        (
            STATUS_MESSAGE,
            record.status_message.clone().unwrap_or_default(),
        ),
        (STATUS_TIMESTAMP, optional_millis(record.status_timestamp)),
        (CREATED_AT, record.created_at.timestamp_millis().to_string()),
        (UPDATED_AT, record.updated_at.timestamp_millis().to_string()),
        (EXPIRES_AT, optional_millis(record.expires_at)),
        (METADATA, metadata),
        (VERSION, record.version.to_string()),
    ])
}

/// Rebuild a record from `HGETALL` output; `None` when the hash is gone
pub fn from_fields(mut fields: HashMap<String, String>) -> TaskStoreResult<Option<StoredRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let task_id = fields.remove(TASK_ID).unwrap_or_default();
    let mut take = |name: &str| fields.remove(name).filter(|v| !v.is_empty());

    let context_id = take(CONTEXT_ID).unwrap_or_default();
    let state_raw = take(STATE).unwrap_or_default();
    let state: TaskState = state_raw.parse().map_err(|_| {
        TaskStoreError::for_task(
            StoreOperation::Deserialize,
            BACKEND,
            &task_id,
            StorageErrorKind::Integrity(IntegrityViolation::UnknownState { value: state_raw }),
        )
    })?;
    let task_data = take(TASK_DATA).unwrap_or_default();
    let status_message = take(STATUS_MESSAGE);
    let status_timestamp = parse_millis(&task_id, STATUS_TIMESTAMP, take(STATUS_TIMESTAMP))?;
    let created_at = parse_millis(&task_id, CREATED_AT, take(CREATED_AT))?;
    let updated_at = parse_millis(&task_id, UPDATED_AT, take(UPDATED_AT))?;
    let expires_at = parse_millis(&task_id, EXPIRES_AT, take(EXPIRES_AT))?;
    let metadata = take(METADATA)
        .map(|raw| serde_json::from_str::<TaskMetadata>(&raw))
        .transpose()
        .map_err(|e| serialization_error(StoreOperation::Deserialize, &task_id, e.to_string()))?;
    let version = take(VERSION)
        .map(|raw| raw.parse::<u64>())
        .transpose()
        .map_err(|e| {
            serialization_error(
                StoreOperation::Deserialize,
                &task_id,
                format!("invalid {VERSION}: {e}"),
            )
        })?
        .unwrap_or(1);

    let created_at = created_at.ok_or_else(|| {
        serialization_error(
            StoreOperation::Deserialize,
            &task_id,
            format!("missing {CREATED_AT}"),
        )
    })?;
    Ok(Some(StoredRecord {
        task_id,
        context_id,
        state,
        task_data,
        status_message,
        status_timestamp,
        created_at,
        updated_at: updated_at.unwrap_or(created_at),
        expires_at,
        metadata,
        version,
    }))
}

/// Epoch milliseconds, or empty for "absent"
pub fn optional_millis(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.timestamp_millis().to_string())
        .unwrap_or_default()
}

fn parse_millis(
    task_id: &str,
    field: &str,
    raw: Option<String>,
) -> TaskStoreResult<Option<DateTime<Utc>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(Some)
        .ok_or_else(|| {
            serialization_error(
                StoreOperation::Deserialize,
                task_id,
                format!("invalid {field}: '{raw}'"),
            )
        })
}

fn serialization_error(operation: StoreOperation, task_id: &str, details: String) -> TaskStoreError {
    TaskStoreError::for_task(
        operation,
        BACKEND,
        task_id,
        StorageErrorKind::Serialization { details },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tasklane_a2a::{Message, Task, TaskStatus};
    use tasklane_core::TaskCodec;

    fn record() -> StoredRecord {
        let task = Task::new("t-1", "ctx").with_status(
            TaskStatus::new(TaskState::Working)
                .with_message(Message::agent("busy"))
                .with_timestamp("2024-05-01T10:00:00.000Z"),
        );
        let meta = TaskMetadata::expiring_at(
            DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
        .with("owner", json!("ops"));
        TaskCodec::new(BACKEND).serialize(&task, Some(&meta)).unwrap()
    }

    fn to_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn hash_fields_restore_the_record() {
        let original = record();
        let restored = from_fields(to_map(to_fields(&original).unwrap()))
            .unwrap()
            .unwrap();

        assert_eq!(restored.task_id, original.task_id);
        assert_eq!(restored.state, TaskState::Working);
        assert_eq!(restored.task_data, original.task_data);
        assert_eq!(restored.status_message, original.status_message);
        assert_eq!(restored.status_timestamp, original.status_timestamp);
        assert_eq!(restored.expires_at, original.expires_at);
        assert_eq!(restored.metadata, original.metadata);
        assert_eq!(restored.version, 1);
    }

    #[test]
    fn absent_optionals_are_empty_strings() {
        let mut original = record();
        original.expires_at = None;
        original.metadata = None;
        original.status_message = None;
        let fields = to_map(to_fields(&original).unwrap());

        assert_eq!(fields[EXPIRES_AT], "");
        assert_eq!(fields[METADATA], "");
        let restored = from_fields(fields).unwrap().unwrap();
        assert_eq!(restored.expires_at, None);
        assert_eq!(restored.metadata, None);
        assert_eq!(restored.status_message, None);
    }

    #[test]
    fn empty_hash_means_missing_record() {
        assert_eq!(from_fields(HashMap::new()).unwrap(), None);
    }

    #[test]
    fn unknown_state_is_an_integrity_error() {
        let mut fields = to_map(to_fields(&record()).unwrap());
        fields.insert(STATE.to_string(), "paused".to_string());
        let err = from_fields(fields).unwrap_err();
        assert!(matches!(
            err.integrity_violation(),
            Some(IntegrityViolation::UnknownState { value }) if value == "paused"
        ));
    }

    #[test]
    fn garbage_timestamp_is_a_serialization_error() {
        let mut fields = to_map(to_fields(&record()).unwrap());
        fields.insert(CREATED_AT.to_string(), "yesterday".to_string());
        let err = from_fields(fields).unwrap_err();
        assert!(matches!(
            err.kind(),
            Some(StorageErrorKind::Serialization { .. })
        ));
    }
}
