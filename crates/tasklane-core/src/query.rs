//! Task queries and the ordering every backend agrees on.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tasklane_a2a::TaskState;

use crate::record::StoredRecord;

/// Conjunctive task filter. Every field is optional.
///
/// `since`/`until` are inclusive bounds on a task's activity time
/// (its status timestamp, falling back to the last write).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Results to skip before `limit` applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Whether a live record satisfies every predicate.
    ///
    /// Expiry is not checked here; callers filter expired records first.
    pub fn matches(&self, record: &StoredRecord) -> bool {
        if let Some(task_id) = &self.task_id
            && &record.task_id != task_id
        {
            return false;
        }
        if let Some(context_id) = &self.context_id
            && &record.context_id != context_id
        {
            return false;
        }
        if let Some(state) = self.state
            && record.state != state
        {
            return false;
        }
        let activity = record.activity_time();
        if self.since.is_some_and(|since| activity < since) {
            return false;
        }
        if self.until.is_some_and(|until| activity > until) {
            return false;
        }
        true
    }

    /// Sort matching records into result order and cut the requested page.
    pub fn paginate(&self, mut records: Vec<StoredRecord>) -> Vec<StoredRecord> {
        records.sort_by(result_order);
        records
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Newest status timestamp first, records without one last, then newest
/// creation first, then task id for a stable order.
pub fn result_order(a: &StoredRecord, b: &StoredRecord) -> Ordering {
    let by_status = match (a.status_timestamp, b.status_timestamp) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_status
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.task_id.cmp(&b.task_id))
}
