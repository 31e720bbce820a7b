//! Task flattening, parsing, validation and sanitization.
//!
//! [`TaskCodec`] is the single place where tasks become [`StoredRecord`]s
//! and back. It is backend-neutral; the backend tag it carries only labels
//! the errors it produces.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use tasklane_a2a::{Artifact, Message, Part, TASK_KIND, Task, TaskState};

use crate::error::{
    IntegrityViolation, StorageBackend, StorageErrorKind, StoreOperation, TaskStoreError,
    TaskStoreResult,
};
use crate::record::{StoredRecord, TaskMetadata};

/// Converts tasks to and from their stored representation
#[derive(Debug, Clone, Copy)]
pub struct TaskCodec {
    backend: StorageBackend,
}

impl TaskCodec {
    pub fn new(backend: StorageBackend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> StorageBackend {
        self.backend
    }

    /// Flatten a task into a fresh record (version 1, created now).
    pub fn serialize(
        &self,
        task: &Task,
        metadata: Option<&TaskMetadata>,
    ) -> TaskStoreResult<StoredRecord> {
        let task_data = serde_json::to_string(task)
            .map_err(|e| self.serialization_error(StoreOperation::Serialize, &task.id, &e))?;
        let status_message = task
            .status
            .message
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| self.serialization_error(StoreOperation::Serialize, &task.id, &e))?;

        let now = Utc::now();
        Ok(StoredRecord {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
            state: task.status.state,
            task_data,
            status_message,
            status_timestamp: task.status.timestamp.as_deref().and_then(parse_timestamp),
            created_at: now,
            updated_at: now,
            expires_at: metadata.and_then(|m| m.expires_at),
            metadata: metadata.filter(|m| !m.is_empty()).cloned(),
            version: 1,
        })
    }

    /// Parse a record's payload back into a task, re-validating its structure
    /// and its agreement with the record's projected fields.
    pub fn deserialize(&self, record: &StoredRecord) -> TaskStoreResult<Task> {
        let value: Value = serde_json::from_str(&record.task_data).map_err(|e| {
            self.serialization_error(StoreOperation::Deserialize, &record.task_id, &e)
        })?;
        validate_payload(&value)
            .map_err(|v| self.integrity_error(StoreOperation::Deserialize, &record.task_id, v))?;

        let task: Task = serde_json::from_value(value).map_err(|e| {
            self.serialization_error(StoreOperation::Deserialize, &record.task_id, &e)
        })?;

        let mismatch = if task.id != record.task_id {
            Some("taskId")
        } else if task.context_id != record.context_id {
            Some("contextId")
        } else if task.status.state != record.state {
            Some("state")
        } else {
            None
        };
        if let Some(field) = mismatch {
            return Err(self.integrity_error(
                StoreOperation::Deserialize,
                &record.task_id,
                IntegrityViolation::ProjectionMismatch { field },
            ));
        }

        Ok(task)
    }

    /// Validate a task, then normalize its status timestamp.
    ///
    /// An unparseable timestamp is dropped rather than rejecting the task;
    /// a parseable one is rewritten in canonical form.
    pub fn sanitize(&self, mut task: Task) -> TaskStoreResult<Task> {
        validate_integrity(&task)
            .map_err(|v| self.integrity_error(StoreOperation::Sanitize, &task.id, v))?;
        task.status.timestamp = task
            .status
            .timestamp
            .as_deref()
            .and_then(canonical_timestamp);
        Ok(task)
    }

    /// Deep copy through the serialized form
    pub fn clone_task(&self, task: &Task) -> TaskStoreResult<Task> {
        let record = self.serialize(task, None)?;
        self.deserialize(&record)
    }

    fn serialization_error(
        &self,
        operation: StoreOperation,
        task_id: &str,
        error: &serde_json::Error,
    ) -> TaskStoreError {
        TaskStoreError::for_task(
            operation,
            self.backend,
            task_id,
            StorageErrorKind::Serialization {
                details: error.to_string(),
            },
        )
    }

    fn integrity_error(
        &self,
        operation: StoreOperation,
        task_id: &str,
        violation: IntegrityViolation,
    ) -> TaskStoreError {
        TaskStoreError::for_task(
            operation,
            self.backend,
            task_id,
            StorageErrorKind::Integrity(violation),
        )
    }
}

/// Check the invariants a typed task can still violate.
pub fn validate_integrity(task: &Task) -> Result<(), IntegrityViolation> {
    if task.id.trim().is_empty() {
        return Err(IntegrityViolation::MissingId);
    }
    if task.context_id.trim().is_empty() {
        return Err(IntegrityViolation::MissingContextId);
    }
    if task.kind != TASK_KIND {
        return Err(IntegrityViolation::InvalidKind {
            found: Some(task.kind.clone()),
        });
    }
    Ok(())
}

/// Structural validation of a raw task payload.
pub fn validate_payload(value: &Value) -> Result<(), IntegrityViolation> {
    let object = value.as_object().ok_or(IntegrityViolation::NotAnObject)?;

    let non_empty = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty())
    };
    if !non_empty("id") {
        return Err(IntegrityViolation::MissingId);
    }
    if !non_empty("contextId") {
        return Err(IntegrityViolation::MissingContextId);
    }

    match object.get("kind") {
        Some(Value::String(kind)) if kind == TASK_KIND => {}
        Some(other) => {
            return Err(IntegrityViolation::InvalidKind {
                found: Some(other.as_str().map_or_else(|| other.to_string(), str::to_string)),
            });
        }
        None => return Err(IntegrityViolation::InvalidKind { found: None }),
    }

    let status = object
        .get("status")
        .ok_or(IntegrityViolation::MissingState)?
        .as_object()
        .ok_or(IntegrityViolation::StatusNotAnObject)?;
    match status.get("state") {
        None | Some(Value::Null) => return Err(IntegrityViolation::MissingState),
        Some(state) => {
            let known = state
                .as_str()
                .is_some_and(|s| s.parse::<TaskState>().is_ok());
            if !known {
                return Err(IntegrityViolation::UnknownState {
                    value: state.as_str().map_or_else(|| state.to_string(), str::to_string),
                });
            }
        }
    }

    if object.get("history").is_some_and(|h| !h.is_null() && !h.is_array()) {
        return Err(IntegrityViolation::HistoryNotArray);
    }
    if object
        .get("artifacts")
        .is_some_and(|a| !a.is_null() && !a.is_array())
    {
        return Err(IntegrityViolation::ArtifactsNotArray);
    }

    Ok(())
}

/// Parse the timestamp shapes orchestrators are known to send.
///
/// Accepts RFC 3339 with any offset, naive `YYYY-MM-DD[T ]HH:MM:SS[.fff]`
/// (taken as UTC) and bare dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Canonical ISO-8601 rendering (`2024-01-01T00:00:00.000Z`) of a parseable timestamp
pub fn canonical_timestamp(raw: &str) -> Option<String> {
    parse_timestamp(raw).map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Collect every piece of human-readable text in a task into one string
/// suitable for an external full-text indexer.
pub fn extract_search_text(task: &Task) -> String {
    let mut pieces = Vec::new();

    if let Some(message) = &task.status.message {
        collect_message(message, &mut pieces);
    }
    for message in task.history.iter().flatten() {
        collect_message(message, &mut pieces);
    }
    for artifact in task.artifacts.iter().flatten() {
        collect_artifact(artifact, &mut pieces);
    }

    pieces.retain(|p| !p.trim().is_empty());
    pieces.join(" ")
}

fn collect_message(message: &Message, out: &mut Vec<String>) {
    for part in &message.parts {
        collect_part(part, out);
    }
}

fn collect_artifact(artifact: &Artifact, out: &mut Vec<String>) {
    out.extend(artifact.name.iter().cloned());
    out.extend(artifact.description.iter().cloned());
    for part in &artifact.parts {
        collect_part(part, out);
    }
}

fn collect_part(part: &Part, out: &mut Vec<String>) {
    match part {
        Part::Text(text) => out.push(text.text.clone()),
        Part::File(file) => {
            out.extend(file.file.name.iter().cloned());
            out.extend(file.file.uri.iter().cloned());
        }
        Part::Data(data) => collect_data(None, &data.data, out),
    }
}

/// Render structured data as `key: value` text, dotting nested keys.
fn collect_data(prefix: Option<&str>, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let path = match prefix {
                    Some(prefix) => format!("{}.{}", prefix, key),
                    None => key.clone(),
                };
                collect_data(Some(&path), nested, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_data(prefix, item, out);
            }
        }
        Value::Null => {}
        scalar => {
            let rendered = match scalar {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match prefix {
                Some(key) => out.push(format!("{}: {}", key, rendered)),
                None => out.push(rendered),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tasklane_a2a::{TaskStatus, canonical_now};

    fn codec() -> TaskCodec {
        TaskCodec::new(StorageBackend::InMemory)
    }

    fn sample_task() -> Task {
        let mut task = Task::new("task-1", "ctx-1").with_state(TaskState::Working);
        task.push_history(Message::user("Summarize the quarterly report"));
        task.push_artifact(Artifact::text("a-1", "Revenue grew 12%").with_name("Summary"));
        task
    }

    #[test]
    fn round_trip_preserves_task() {
        let task = sample_task();
        let record = codec().serialize(&task, None).unwrap();

        assert_eq!(record.task_id, "task-1");
        assert_eq!(record.context_id, "ctx-1");
        assert_eq!(record.state, TaskState::Working);
        assert_eq!(record.version, 1);
        assert!(record.status_timestamp.is_some());

        let restored = codec().deserialize(&record).unwrap();
        assert_eq!(restored, task);
    }

    #[test]
    fn serialize_projects_expiry_from_metadata() {
        let at = Utc::now();
        let record = codec()
            .serialize(&sample_task(), Some(&TaskMetadata::expiring_at(at)))
            .unwrap();
        assert_eq!(record.expires_at, Some(at));
        assert!(record.metadata.is_some());
    }

    #[test]
    fn serialize_records_status_message() {
        let task = sample_task()
            .with_status(TaskStatus::new(TaskState::Completed).with_message(Message::agent("done")));
        let record = codec().serialize(&task, None).unwrap();
        let message: Message =
            serde_json::from_str(record.status_message.as_deref().unwrap()).unwrap();
        assert_eq!(message.parts[0].as_text(), Some("done"));
    }

    #[test]
    fn deserialize_rejects_malformed_json() {
        let mut record = codec().serialize(&sample_task(), None).unwrap();
        record.task_data = "{not json".to_string();

        let err = codec().deserialize(&record).unwrap_err();
        assert!(matches!(
            err.kind(),
            Some(StorageErrorKind::Serialization { .. })
        ));
        assert_eq!(err.task_id(), Some("task-1"));
    }

    #[test]
    fn deserialize_rejects_structural_violations() {
        let mut record = codec().serialize(&sample_task(), None).unwrap();
        let mut value: Value = serde_json::from_str(&record.task_data).unwrap();
        value["history"] = json!("not-a-list");
        record.task_data = value.to_string();

        let err = codec().deserialize(&record).unwrap_err();
        assert_eq!(
            err.integrity_violation(),
            Some(&IntegrityViolation::HistoryNotArray)
        );
    }

    #[test]
    fn deserialize_detects_projection_mismatch() {
        let mut record = codec().serialize(&sample_task(), None).unwrap();
        record.state = TaskState::Completed;

        let err = codec().deserialize(&record).unwrap_err();
        assert_eq!(
            err.integrity_violation(),
            Some(&IntegrityViolation::ProjectionMismatch { field: "state" })
        );
    }

    #[test]
    fn payload_validation_names_each_violation() {
        let base = serde_json::to_value(sample_task()).unwrap();
        let cases: Vec<(Value, IntegrityViolation)> = vec![
            (json!([1, 2]), IntegrityViolation::NotAnObject),
            (
                {
                    let mut v = base.clone();
                    v["id"] = json!("");
                    v
                },
                IntegrityViolation::MissingId,
            ),
            (
                {
                    let mut v = base.clone();
                    v.as_object_mut().unwrap().remove("contextId");
                    v
                },
                IntegrityViolation::MissingContextId,
            ),
            (
                {
                    let mut v = base.clone();
                    v["kind"] = json!("message");
                    v
                },
                IntegrityViolation::InvalidKind {
                    found: Some("message".to_string()),
                },
            ),
            (
                {
                    let mut v = base.clone();
                    v["status"].as_object_mut().unwrap().remove("state");
                    v
                },
                IntegrityViolation::MissingState,
            ),
            (
                {
                    let mut v = base.clone();
                    v["artifacts"] = json!({"a": 1});
                    v
                },
                IntegrityViolation::ArtifactsNotArray,
            ),
        ];

        for (payload, expected) in cases {
            assert_eq!(validate_payload(&payload), Err(expected));
        }
        assert_eq!(validate_payload(&base), Ok(()));
    }

    #[test]
    fn sanitize_rejects_wrong_kind() {
        let mut task = sample_task();
        task.kind = "job".to_string();
        let err = codec().sanitize(task).unwrap_err();
        assert!(err.to_string().contains("task kind must be \"task\""));
    }

    #[test]
    fn sanitize_rejects_blank_context() {
        let mut task = sample_task();
        task.context_id = "   ".to_string();
        let err = codec().sanitize(task).unwrap_err();
        assert_eq!(
            err.integrity_violation(),
            Some(&IntegrityViolation::MissingContextId)
        );
    }

    #[test]
    fn sanitize_drops_unparseable_timestamp() {
        let task = sample_task()
            .with_status(TaskStatus::new(TaskState::Working).with_timestamp("yesterday-ish"));
        let sanitized = codec().sanitize(task).unwrap();
        assert_eq!(sanitized.status.timestamp, None);
    }

    #[test]
    fn sanitize_canonicalizes_timestamps() {
        let cases = [
            ("2024-03-05T10:11:12+02:00", "2024-03-05T08:11:12.000Z"),
            ("2024-03-05 10:11:12", "2024-03-05T10:11:12.000Z"),
            ("2024-03-05T10:11:12.5", "2024-03-05T10:11:12.500Z"),
            ("2024-03-05", "2024-03-05T00:00:00.000Z"),
            ("2024-03-05T10:11:12.123Z", "2024-03-05T10:11:12.123Z"),
        ];
        for (raw, canonical) in cases {
            let task = sample_task()
                .with_status(TaskStatus::new(TaskState::Working).with_timestamp(raw));
            let sanitized = codec().sanitize(task).unwrap();
            assert_eq!(sanitized.status.timestamp.as_deref(), Some(canonical), "{raw}");
        }
    }

    #[test]
    fn canonical_now_is_already_canonical() {
        let now = canonical_now();
        assert_eq!(canonical_timestamp(&now), Some(now));
    }

    #[test]
    fn clone_task_is_deep_and_equal() {
        let task = sample_task();
        let mut copy = codec().clone_task(&task).unwrap();
        assert_eq!(copy, task);

        copy.push_history(Message::agent("extra"));
        assert_eq!(task.history.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn search_text_covers_messages_artifacts_and_data() {
        let mut task = sample_task().with_status(
            TaskStatus::new(TaskState::Completed).with_message(Message::agent("All done")),
        );
        task.push_artifact(
            Artifact::json("a-2", json!({"city": "Lisbon", "weather": {"temp": 21}}))
                .with_description("Forecast"),
        );

        let text = extract_search_text(&task);
        assert!(text.contains("All done"));
        assert!(text.contains("Summarize the quarterly report"));
        assert!(text.contains("Summary"));
        assert!(text.contains("Revenue grew 12%"));
        assert!(text.contains("Forecast"));
        assert!(text.contains("city: Lisbon"));
        assert!(text.contains("weather.temp: 21"));
    }

    #[test]
    fn search_text_is_empty_without_content() {
        let task = Task::new("t", "c");
        assert_eq!(extract_search_text(&task), "");
    }
}
