//! Provider Contract Tests
//!
//! Exercise the public contract through the facade against the in-memory
//! backend: creation semantics, expiry visibility, index-driven queries,
//! stats, corrupted payloads and concurrent status updates.

use std::sync::Arc;

use chrono::{Duration, SecondsFormat, Utc};
use rstest::rstest;
use tasklane::{
    Artifact, InMemoryTaskProvider, MemoryStorageConfig, Message, StorageBackend, StorageConfig,
    StorageErrorKind, StoreSettings, Task, TaskCodec, TaskMetadata, TaskQuery, TaskState,
    TaskStatus, TaskStorageProvider, TaskStorageProviderExt, connect_provider,
};

fn timestamp(minutes_ago: i64) -> String {
    (Utc::now() - Duration::minutes(minutes_ago)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn task_at(id: &str, context_id: &str, state: TaskState, minutes_ago: i64) -> Task {
    Task::new(id, context_id).with_status(TaskStatus {
        state,
        message: None,
        timestamp: Some(timestamp(minutes_ago)),
    })
}

/// Five tasks over two contexts, used by the stats and query tests
async fn seeded_store() -> InMemoryTaskProvider {
    let store = InMemoryTaskProvider::default();
    let seed = [
        ("t1", "c1", TaskState::Working),
        ("t2", "c1", TaskState::Completed),
        ("t3", "c1", TaskState::Completed),
        ("t4", "c2", TaskState::Working),
        ("t5", "c2", TaskState::Failed),
    ];
    for (i, (id, context_id, state)) in seed.into_iter().enumerate() {
        store
            .store_task(task_at(id, context_id, state, 10 - i as i64), None)
            .await
            .expect("Seed store should succeed");
    }
    store
}

/// Stats over the whole store and within one context
#[tokio::test]
async fn test_stats_by_state_and_context() {
    let store = seeded_store().await;

    let stats = store.get_task_stats(None).await.expect("Stats should succeed");
    assert_eq!(stats.total_tasks, 5);
    assert_eq!(stats.count(TaskState::Working), 2);
    assert_eq!(stats.count(TaskState::Completed), 2);
    assert_eq!(stats.count(TaskState::Failed), 1);
    assert_eq!(stats.tasks_by_state.values().sum::<u64>(), stats.total_tasks);
    assert!(stats.oldest_task <= stats.newest_task);

    let scoped = store
        .get_task_stats(Some("c1"))
        .await
        .expect("Scoped stats should succeed");
    assert_eq!(scoped.total_tasks, 3);
    assert_eq!(scoped.count(TaskState::Working), 1);
    assert_eq!(scoped.count(TaskState::Completed), 2);
    assert_eq!(scoped.count(TaskState::Failed), 0);
}

/// Scoped stats only carry the states present in that context
#[tokio::test]
async fn test_scoped_stats_only_count_their_context() {
    let store = seeded_store().await;
    let scoped = store
        .get_task_stats(Some("c2"))
        .await
        .expect("Scoped stats should succeed");

    assert_eq!(scoped.total_tasks, 2);
    assert_eq!(scoped.tasks_by_state.len(), 2);
    assert_eq!(scoped.tasks_by_state.get(&TaskState::Working), Some(&1));
    assert_eq!(scoped.tasks_by_state.get(&TaskState::Failed), Some(&1));
    assert!(!scoped.tasks_by_state.contains_key(&TaskState::Completed));

    let empty = store.get_task_stats(Some("nowhere")).await.unwrap();
    assert_eq!(empty.total_tasks, 0);
    assert!(empty.tasks_by_state.is_empty());
}

fn task_with_content(id: &str) -> Task {
    let mut task = Task::new(id, "ctx");
    task.push_history(Message::user("question"));
    task.push_artifact(Artifact::text("a1", "answer"));
    task
}

/// Disabled history or artifacts are dropped on every write path
#[rstest]
#[case::no_history(false, true)]
#[case::no_artifacts(true, false)]
#[case::neither(false, false)]
#[case::both(true, true)]
#[tokio::test]
async fn test_content_toggles_apply_to_store_and_update(
    #[case] history: bool,
    #[case] artifacts: bool,
) {
    let store = InMemoryTaskProvider::new(
        StoreSettings::default()
            .with_history(history)
            .with_artifacts(artifacts),
    );

    store
        .store_task(task_with_content("stored"), None)
        .await
        .expect("Store should succeed");
    let loaded = store.get_task("stored").await.unwrap().unwrap();
    assert_eq!(loaded.history.is_some(), history);
    assert_eq!(loaded.artifacts.is_some(), artifacts);

    store.store_task(Task::new("updated", "ctx"), None).await.unwrap();
    store
        .update_task(task_with_content("updated"), None)
        .await
        .expect("Update should succeed");
    let loaded = store.get_task("updated").await.unwrap().unwrap();
    assert_eq!(loaded.history.is_some(), history);
    assert_eq!(loaded.artifacts.is_some(), artifacts);

    let after_status = store
        .update_task_status("updated", TaskState::Working, Some(Message::agent("on it")), None)
        .await
        .unwrap();
    assert_eq!(
        after_status.history.as_ref().map(Vec::len),
        history.then_some(2)
    );
    assert_eq!(after_status.artifacts.is_some(), artifacts);
}

/// A record with an unreadable payload surfaces as a serialization error
#[tokio::test]
async fn test_corrupted_task_data_is_a_storage_error() {
    let store = InMemoryTaskProvider::default();
    let mut record = TaskCodec::new(StorageBackend::InMemory)
        .serialize(&Task::new("broken", "ctx"), None)
        .expect("Serialize should succeed");
    record.task_data = "{\"id\": \"broken\", ".to_string();
    store.restore_record(record).await;

    let err = store
        .get_task("broken")
        .await
        .expect_err("Corrupted payload must not deserialize");
    assert!(matches!(
        err.kind(),
        Some(StorageErrorKind::Serialization { .. })
    ));
    assert_eq!(err.task_id(), Some("broken"));
    assert!(!err.is_retryable());

    // The rest of the store keeps working
    store
        .store_task(Task::new("healthy", "ctx"), None)
        .await
        .expect("Store should succeed");
    assert!(store.task_exists("healthy").await.expect("Lookup should succeed"));
}

/// Stored tasks come back unchanged
#[tokio::test]
async fn test_round_trip_preserves_task() {
    let store = InMemoryTaskProvider::default();
    let mut task = task_at("rt", "ctx", TaskState::Working, 1);
    task.push_history(Message::user("Summarize the quarterly report"));
    task.metadata
        .insert("priority".to_string(), serde_json::json!("high"));

    store
        .store_task(task.clone(), None)
        .await
        .expect("Store should succeed");
    let loaded = store
        .get_task("rt")
        .await
        .expect("Get should succeed")
        .expect("Task should exist");
    assert_eq!(loaded, task);
}

/// Creating an existing id never overwrites it
#[tokio::test]
async fn test_no_silent_overwrite() {
    let store = InMemoryTaskProvider::default();
    store
        .store_task(task_at("dup", "ctx", TaskState::Working, 1), None)
        .await
        .expect("First store should succeed");

    let err = store
        .store_task(task_at("dup", "ctx", TaskState::Failed, 0), None)
        .await
        .expect_err("Second store must fail");
    assert!(matches!(err.kind(), Some(StorageErrorKind::AlreadyExists)));

    let kept = store.get_task("dup").await.unwrap().unwrap();
    assert_eq!(kept.status.state, TaskState::Working);
}

/// Expired tasks vanish from reads immediately and from storage on sweep
#[tokio::test]
async fn test_expiry_is_lazy_then_swept() {
    let store = InMemoryTaskProvider::default();
    let past = TaskMetadata::expiring_at(Utc::now() - Duration::seconds(1));
    store
        .store_task(Task::new("gone", "ctx"), Some(past))
        .await
        .expect("Store should succeed");
    store
        .store_task(Task::new("kept", "ctx"), None)
        .await
        .expect("Store should succeed");

    assert!(store.get_task("gone").await.unwrap().is_none());
    assert_eq!(store.get_tasks_by_context("ctx", None).await.unwrap().len(), 1);
    assert_eq!(store.get_task_stats(None).await.unwrap().total_tasks, 1);
    assert!(
        store
            .update_task_status("gone", TaskState::Working, None, None)
            .await
            .expect_err("Expired task cannot be updated")
            .is_not_found()
    );
    assert_eq!(store.len().await, 2);

    assert_eq!(store.count_expired_tasks().await.unwrap(), 1);
    assert_eq!(store.cleanup_expired_tasks().await.unwrap(), 1);
    assert_eq!(store.len().await, 1);
    assert_eq!(store.cleanup_expired_tasks().await.unwrap(), 0);
}

#[rstest]
#[case::by_context(TaskQuery::new().with_context("c1"), vec!["t3", "t2", "t1"])]
#[case::by_state(TaskQuery::new().with_state(TaskState::Working), vec!["t4", "t1"])]
#[case::context_and_state(
    TaskQuery::new().with_context("c2").with_state(TaskState::Failed),
    vec!["t5"]
)]
#[case::by_id(TaskQuery::new().with_task_id("t2"), vec!["t2"])]
#[case::paged(TaskQuery::new().with_offset(1).with_limit(2), vec!["t4", "t3"])]
#[case::no_match(TaskQuery::new().with_context("missing"), vec![])]
#[tokio::test]
async fn test_find_tasks_filters_and_orders(#[case] query: TaskQuery, #[case] expected: Vec<&str>) {
    let store = seeded_store().await;
    let found = store.find_tasks(&query).await.expect("Find should succeed");
    let ids: Vec<&str> = found.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, expected);
}

/// Time-window filters use the status timestamp, inclusive
#[tokio::test]
async fn test_find_tasks_by_activity_window() {
    let store = seeded_store().await;
    let query = TaskQuery::new()
        .since(Utc::now() - Duration::minutes(8) - Duration::seconds(30))
        .until(Utc::now() - Duration::minutes(6) - Duration::seconds(30));
    let found = store.find_tasks(&query).await.unwrap();
    let ids: Vec<&str> = found.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["t4", "t3"]);
}

/// Context deletion removes every member and nothing else
#[tokio::test]
async fn test_cascade_delete_by_context() {
    let store = seeded_store().await;
    assert_eq!(store.delete_tasks_by_context("c1").await.unwrap(), 3);
    assert!(store.get_tasks_by_context("c1", None).await.unwrap().is_empty());
    assert_eq!(store.get_task_stats(None).await.unwrap().total_tasks, 2);
    assert!(store.index_snapshot().await.is_consistent());
    assert_eq!(store.delete_tasks_by_context("c1").await.unwrap(), 0);
}

/// Concurrent status updates on one task never lose a write
#[tokio::test]
async fn test_concurrent_status_updates_are_not_lost() {
    let store = Arc::new(InMemoryTaskProvider::default());
    store
        .store_task(Task::new("hot", "ctx"), None)
        .await
        .expect("Store should succeed");

    let updates = (0..32).map(|i| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .update_task_status(
                    "hot",
                    TaskState::Working,
                    Some(Message::agent(format!("step {}", i))),
                    None,
                )
                .await
        })
    });
    for result in futures::future::join_all(updates).await {
        result.expect("Task should not panic").expect("Update should succeed");
    }

    let task = store.get_task("hot").await.unwrap().unwrap();
    assert_eq!(task.history.map(|h| h.len()), Some(32));
}

/// The factory hands out a working provider for the default config
#[tokio::test]
async fn test_factory_builds_memory_provider() {
    let config = StorageConfig::Memory(MemoryStorageConfig {
        settings: StoreSettings::default().with_max_tasks_per_context(Some(1)),
    });
    let store = connect_provider(&config).await.expect("Factory should succeed");
    assert_eq!(store.backend(), StorageBackend::InMemory);

    store.store_task(Task::new("a", "ctx"), None).await.unwrap();
    let err = store
        .store_task(Task::new("b", "ctx"), None)
        .await
        .expect_err("Context limit must apply");
    assert!(matches!(
        err.kind(),
        Some(StorageErrorKind::ContextCapacityExceeded { limit: 1, .. })
    ));

    let health = store.health_check().await;
    assert!(health.healthy);
    store.close().await.expect("Close should succeed");
}
