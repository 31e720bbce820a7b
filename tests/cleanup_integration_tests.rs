//! Cleanup Service Integration Tests
//!
//! Drive the cleanup service through the public contract: retention
//! trimming, dry runs, partial failures and the background schedule.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, Utc};
use tasklane::{
    CleanupConfig, CleanupService, HealthReport, InMemoryTaskProvider, Message, StorageBackend,
    StorageErrorKind, StoreOperation, Task, TaskMetadata, TaskQuery, TaskState, TaskStats,
    TaskStatus, TaskStorageProvider, TaskStoreError, TaskStoreResult,
};

fn finished(id: &str, state: TaskState, minutes_ago: i64) -> Task {
    let at = (Utc::now() - Duration::minutes(minutes_ago)).to_rfc3339_opts(SecondsFormat::Millis, true);
    Task::new(id, "ctx").with_status(TaskStatus {
        state,
        message: None,
        timestamp: Some(at),
    })
}

/// Only the oldest completed task beyond the limit is removed
#[tokio::test]
async fn test_completed_surplus_keeps_newest() {
    let store = Arc::new(InMemoryTaskProvider::default());
    store.store_task(finished("older", TaskState::Completed, 2), None).await.unwrap();
    store.store_task(finished("newer", TaskState::Completed, 1), None).await.unwrap();

    let service = CleanupService::new(
        store.clone(),
        CleanupConfig::default().with_max_completed_tasks(1),
    );
    let report = service.run_once().await;

    assert!(report.is_clean(), "unexpected errors: {:?}", report.errors);
    assert_eq!(report.excess_completed_cleaned, 1);
    assert_eq!(report.total_cleaned, 1);
    assert!(store.get_task("older").await.unwrap().is_none());
    assert!(store.get_task("newer").await.unwrap().is_some());
}

/// A full cycle sweeps expiry, both surpluses and aged terminal tasks
#[tokio::test]
async fn test_full_cycle_counts_every_step() {
    let store = Arc::new(InMemoryTaskProvider::default());
    store
        .store_task(
            Task::new("expired", "ctx"),
            Some(TaskMetadata::expiring_at(Utc::now() - Duration::seconds(5))),
        )
        .await
        .unwrap();
    for i in 0..3 {
        store
            .store_task(finished(&format!("failed-{i}"), TaskState::Failed, 10 - i), None)
            .await
            .unwrap();
    }
    store
        .store_task(finished("ancient", TaskState::Canceled, 60 * 24 * 30), None)
        .await
        .unwrap();
    store
        .store_task(finished("active", TaskState::Working, 60 * 24 * 30), None)
        .await
        .unwrap();

    let config = CleanupConfig::default()
        .with_max_failed_tasks(1)
        .with_max_age(StdDuration::from_secs(24 * 3600));
    let report = CleanupService::new(store.clone(), config).run_once().await;

    assert!(report.is_clean(), "unexpected errors: {:?}", report.errors);
    assert_eq!(report.expired_cleaned, 1);
    assert_eq!(report.excess_failed_cleaned, 2);
    assert_eq!(report.aged_cleaned, 1);
    assert_eq!(report.total_cleaned, 4);

    let remaining: Vec<String> = store
        .find_tasks(&TaskQuery::new())
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(remaining, vec!["failed-2".to_string(), "active".to_string()]);
    assert!(store.index_snapshot().await.is_consistent());
}

/// Dry runs report nothing and leave the store alone
#[tokio::test]
async fn test_dry_run_reports_without_deleting() {
    let store = Arc::new(InMemoryTaskProvider::default());
    store
        .store_task(
            Task::new("expired", "ctx"),
            Some(TaskMetadata::expiring_at(Utc::now() - Duration::seconds(5))),
        )
        .await
        .unwrap();
    store.store_task(finished("a", TaskState::Completed, 2), None).await.unwrap();
    store.store_task(finished("b", TaskState::Completed, 1), None).await.unwrap();

    let config = CleanupConfig::default()
        .with_max_completed_tasks(0)
        .with_dry_run(true);
    let report = CleanupService::new(store.clone(), config).run_once().await;

    assert!(report.dry_run);
    assert_eq!(report.total_cleaned, 0);
    assert_eq!(store.len().await, 3);
}

/// Provider that fails the expiry sweep and deletes of one id
struct FlakyProvider {
    inner: InMemoryTaskProvider,
    undeletable: String,
}

impl FlakyProvider {
    fn failure(&self, operation: StoreOperation) -> TaskStoreError {
        TaskStoreError::storage(
            operation,
            StorageBackend::InMemory,
            StorageErrorKind::Connection {
                details: "Connection failed".to_string(),
            },
        )
    }
}

#[async_trait]
impl TaskStorageProvider for FlakyProvider {
    fn backend(&self) -> StorageBackend {
        self.inner.backend()
    }

    async fn store_task(&self, task: Task, metadata: Option<TaskMetadata>) -> TaskStoreResult<()> {
        self.inner.store_task(task, metadata).await
    }

    async fn get_task(&self, task_id: &str) -> TaskStoreResult<Option<Task>> {
        self.inner.get_task(task_id).await
    }

    async fn update_task(&self, task: Task, metadata: Option<TaskMetadata>) -> TaskStoreResult<()> {
        self.inner.update_task(task, metadata).await
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        state: TaskState,
        message: Option<Message>,
        timestamp: Option<String>,
    ) -> TaskStoreResult<Task> {
        self.inner
            .update_task_status(task_id, state, message, timestamp)
            .await
    }

    async fn find_tasks(&self, query: &TaskQuery) -> TaskStoreResult<Vec<Task>> {
        self.inner.find_tasks(query).await
    }

    async fn delete_task(&self, task_id: &str) -> TaskStoreResult<bool> {
        if task_id == self.undeletable {
            return Err(self.failure(StoreOperation::Delete).with_task_id(task_id));
        }
        self.inner.delete_task(task_id).await
    }

    async fn delete_tasks_by_context(&self, context_id: &str) -> TaskStoreResult<usize> {
        self.inner.delete_tasks_by_context(context_id).await
    }

    async fn cleanup_expired_tasks(&self) -> TaskStoreResult<usize> {
        Err(self.failure(StoreOperation::CleanupExpired))
    }

    async fn count_expired_tasks(&self) -> TaskStoreResult<usize> {
        self.inner.count_expired_tasks().await
    }

    async fn get_task_stats(&self, context_id: Option<&str>) -> TaskStoreResult<TaskStats> {
        self.inner.get_task_stats(context_id).await
    }

    async fn health_check(&self) -> HealthReport {
        self.inner.health_check().await
    }

    async fn close(&self) -> TaskStoreResult<()> {
        self.inner.close().await
    }
}

/// Failing steps are reported and the remaining steps still run
#[tokio::test]
async fn test_partial_failures_do_not_abort_the_cycle() {
    let provider = Arc::new(FlakyProvider {
        inner: InMemoryTaskProvider::default(),
        undeletable: "stuck".to_string(),
    });
    provider.store_task(finished("stuck", TaskState::Completed, 3), None).await.unwrap();
    provider.store_task(finished("old", TaskState::Completed, 2), None).await.unwrap();
    provider.store_task(finished("new", TaskState::Completed, 1), None).await.unwrap();

    let config = CleanupConfig::default().with_max_completed_tasks(1);
    let report = CleanupService::new(provider.clone(), config).run_once().await;

    assert_eq!(report.errors.len(), 2, "errors: {:?}", report.errors);
    assert!(report.errors[0].starts_with("expired sweep"));
    assert!(report.errors[1].contains("stuck"));
    assert_eq!(report.excess_completed_cleaned, 1);
    assert!(provider.get_task("old").await.unwrap().is_none());
    assert!(provider.get_task("new").await.unwrap().is_some());
}

/// The background loop runs a cycle on start and stops on request
#[tokio::test]
async fn test_scheduled_service_lifecycle() {
    let store = Arc::new(InMemoryTaskProvider::default());
    store
        .store_task(
            Task::new("expired", "ctx"),
            Some(TaskMetadata::expiring_at(Utc::now() - Duration::seconds(1))),
        )
        .await
        .unwrap();

    let service = CleanupService::new(
        store.clone(),
        CleanupConfig::default().with_interval(StdDuration::from_secs(60)),
    );
    assert!(service.start().await.expect("Start should succeed"));
    assert!(!service.start().await.expect("Second start is a no-op"));
    assert!(service.is_running().await);

    for _ in 0..50 {
        if store.is_empty().await {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(store.is_empty().await);

    service.stop().await;
    assert!(!service.is_running().await);
}
