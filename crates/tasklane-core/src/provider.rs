//! The contract every task storage backend implements.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tasklane_a2a::{Message, Task, TaskState, TaskStatus, canonical_now};

use crate::error::{StorageBackend, StoreOperation, TaskStoreError, TaskStoreResult};
use crate::query::TaskQuery;
use crate::record::{StoredRecord, TaskMetadata};
use crate::serialization::extract_search_text;

/// Aggregate counts over live (non-expired) tasks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total_tasks: u64,
    pub tasks_by_state: BTreeMap<TaskState, u64>,
    /// Earliest record creation time
    pub oldest_task: Option<DateTime<Utc>>,
    /// Latest record creation time
    pub newest_task: Option<DateTime<Utc>>,
}

impl TaskStats {
    /// Fold live records into stats
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a StoredRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total_tasks += 1;
            *stats.tasks_by_state.entry(record.state).or_insert(0) += 1;
            stats.oldest_task = Some(
                stats
                    .oldest_task
                    .map_or(record.created_at, |t| t.min(record.created_at)),
            );
            stats.newest_task = Some(
                stats
                    .newest_task
                    .map_or(record.created_at, |t| t.max(record.created_at)),
            );
        }
        stats
    }

    /// Count for one state, zero when absent
    pub fn count(&self, state: TaskState) -> u64 {
        self.tasks_by_state.get(&state).copied().unwrap_or(0)
    }
}

/// Result of a backend health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency_ms: latency.as_millis() as u64,
            error: None,
        }
    }

    pub fn unhealthy(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: latency.as_millis() as u64,
            error: Some(error.into()),
        }
    }

    /// Run a probe under `timeout`, folding every outcome into a report
    pub async fn probe<F>(timeout: Duration, probe: F) -> Self
    where
        F: std::future::Future<Output = Result<(), String>>,
    {
        let started = Instant::now();
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(())) => Self::healthy(started.elapsed()),
            Ok(Err(error)) => Self::unhealthy(started.elapsed(), error),
            Err(_) => Self::unhealthy(
                started.elapsed(),
                format!("health check timed out after {}ms", timeout.as_millis()),
            ),
        }
    }
}

/// Async storage contract for A2A tasks.
///
/// Implementations must keep the context and state indices in step with
/// the primary store on every successful mutation, hide expired records
/// from all reads, and wrap every driver failure in [`TaskStoreError`].
#[async_trait]
pub trait TaskStorageProvider: Send + Sync {
    /// Backend this provider runs on
    fn backend(&self) -> StorageBackend;

    /// Create a task. Fails if a live task with the same id exists or a
    /// capacity limit is reached.
    async fn store_task(&self, task: Task, metadata: Option<TaskMetadata>) -> TaskStoreResult<()>;

    /// Fetch a task; `None` when absent or expired.
    async fn get_task(&self, task_id: &str) -> TaskStoreResult<Option<Task>>;

    /// Replace a live task, merging `metadata` into the stored metadata.
    async fn update_task(&self, task: Task, metadata: Option<TaskMetadata>)
    -> TaskStoreResult<()>;

    /// Move a live task to `state`, returning the updated task.
    async fn update_task_status(
        &self,
        task_id: &str,
        state: TaskState,
        message: Option<Message>,
        timestamp: Option<String>,
    ) -> TaskStoreResult<Task>;

    /// Live tasks matching `query`, newest status first.
    async fn find_tasks(&self, query: &TaskQuery) -> TaskStoreResult<Vec<Task>>;

    async fn get_tasks_by_context(
        &self,
        context_id: &str,
        limit: Option<usize>,
    ) -> TaskStoreResult<Vec<Task>> {
        let mut query = TaskQuery::new().with_context(context_id);
        query.limit = limit;
        self.find_tasks(&query).await
    }

    /// Remove a task. Returns whether a record was removed.
    async fn delete_task(&self, task_id: &str) -> TaskStoreResult<bool>;

    /// Remove every task in a context. Returns the number removed.
    async fn delete_tasks_by_context(&self, context_id: &str) -> TaskStoreResult<usize>;

    /// Physically remove every expired record. Returns the number removed.
    async fn cleanup_expired_tasks(&self) -> TaskStoreResult<usize>;

    /// Number of records `cleanup_expired_tasks` would remove right now.
    async fn count_expired_tasks(&self) -> TaskStoreResult<usize>;

    /// Counts over live tasks, optionally within one context.
    async fn get_task_stats(&self, context_id: Option<&str>) -> TaskStoreResult<TaskStats>;

    /// Probe the backend. Never fails; problems are reported in the result.
    async fn health_check(&self) -> HealthReport;

    /// Release resources the provider allocated itself.
    async fn close(&self) -> TaskStoreResult<()>;
}

/// Convenience operations available on every provider.
#[async_trait]
pub trait TaskStorageProviderExt: TaskStorageProvider {
    /// Whether a live task with this id exists
    async fn task_exists(&self, task_id: &str) -> TaskStoreResult<bool> {
        Ok(self.get_task(task_id).await?.is_some())
    }

    /// Indexable text of a live task, if present
    async fn task_search_text(&self, task_id: &str) -> TaskStoreResult<Option<String>> {
        Ok(self
            .get_task(task_id)
            .await?
            .map(|task| extract_search_text(&task)))
    }

    /// Live tasks in one state
    async fn tasks_in_state(
        &self,
        state: TaskState,
        limit: Option<usize>,
    ) -> TaskStoreResult<Vec<Task>> {
        let mut query = TaskQuery::new().with_state(state);
        query.limit = limit;
        self.find_tasks(&query).await
    }
}

impl<T: TaskStorageProvider + ?Sized> TaskStorageProviderExt for T {}

/// Rewrite a task's status in place for a status-only update.
///
/// A missing timestamp means "now". A supplied message is also appended
/// to the history when history is kept.
pub fn apply_status_update(
    task: &mut Task,
    state: TaskState,
    message: Option<Message>,
    timestamp: Option<String>,
    keep_history: bool,
) {
    if keep_history && let Some(message) = &message {
        task.push_history(message.clone());
    }
    task.status = TaskStatus {
        state,
        message,
        timestamp: Some(timestamp.unwrap_or_else(canonical_now)),
    };
}

/// Run a backend future under the operation timeout.
pub async fn with_timeout<T, F>(
    timeout: Duration,
    operation: StoreOperation,
    backend: StorageBackend,
    future: F,
) -> TaskStoreResult<T>
where
    F: std::future::Future<Output = TaskStoreResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(TaskStoreError::timeout(operation, backend, timeout)),
    }
}
