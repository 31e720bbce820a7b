//! In-Memory Provider Benchmarks
//!
//! Measures the hot paths of the single-lock store:
//! - store and get of one task
//! - indexed queries over a populated store
//! - status updates (read-modify-write under the write lock)
//! - expiry sweeps

use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Duration, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tasklane::{
    InMemoryTaskProvider, StoreSettings, Task, TaskMetadata, TaskQuery, TaskState,
    TaskStorageProvider,
};
use tokio::runtime::Runtime;

fn unbounded() -> StoreSettings {
    StoreSettings::default()
        .with_max_tasks(None)
        .with_max_tasks_per_context(None)
}

async fn populated(tasks: usize, contexts: usize) -> InMemoryTaskProvider {
    let store = InMemoryTaskProvider::new(unbounded());
    for i in 0..tasks {
        let state = TaskState::ALL[i % TaskState::ALL.len()];
        let task = Task::new(format!("task-{i}"), format!("ctx-{}", i % contexts)).with_state(state);
        store.store_task(task, None).await.unwrap();
    }
    store
}

fn bench_store_and_get(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("in_memory_store_get");
    group.throughput(Throughput::Elements(1));

    let store = Arc::new(InMemoryTaskProvider::new(unbounded()));
    let counter = AtomicU64::new(0);
    group.bench_function("store_task", |b| {
        b.to_async(&rt).iter(|| {
            let id = counter.fetch_add(1, Ordering::Relaxed);
            let store = Arc::clone(&store);
            async move {
                let task = Task::new(format!("bench-{id}"), "ctx");
                black_box(store.store_task(task, None).await.unwrap())
            }
        })
    });

    let store = Arc::new(rt.block_on(populated(1_000, 10)));
    group.bench_function("get_task", |b| {
        b.to_async(&rt).iter(|| {
            let store = Arc::clone(&store);
            async move { black_box(store.get_task("task-500").await.unwrap()) }
        })
    });

    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("in_memory_find_tasks");

    for size in [100usize, 1_000, 10_000] {
        let store = Arc::new(rt.block_on(populated(size, 20)));
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("by_context", size), &size, |b, _| {
            let query = TaskQuery::new().with_context("ctx-3").with_limit(50);
            b.to_async(&rt).iter(|| {
                let store = Arc::clone(&store);
                let query = query.clone();
                async move { black_box(store.find_tasks(&query).await.unwrap()) }
            })
        });

        group.bench_with_input(BenchmarkId::new("by_state", size), &size, |b, _| {
            let query = TaskQuery::new().with_state(TaskState::Completed);
            b.to_async(&rt).iter(|| {
                let store = Arc::clone(&store);
                let query = query.clone();
                async move { black_box(store.find_tasks(&query).await.unwrap()) }
            })
        });

        group.bench_with_input(BenchmarkId::new("stats", size), &size, |b, _| {
            b.to_async(&rt).iter(|| {
                let store = Arc::clone(&store);
                async move { black_box(store.get_task_stats(None).await.unwrap()) }
            })
        });
    }

    group.finish();
}

fn bench_status_updates(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = Arc::new(rt.block_on(populated(1_000, 10)));

    c.bench_function("in_memory_update_task_status", |b| {
        let mut flip = false;
        b.to_async(&rt).iter(|| {
            flip = !flip;
            let state = if flip { TaskState::Working } else { TaskState::InputRequired };
            let store = Arc::clone(&store);
            async move {
                black_box(
                    store
                        .update_task_status("task-42", state, None, None)
                        .await
                        .unwrap(),
                )
            }
        })
    });
}

fn bench_expiry_sweep(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("in_memory_cleanup_expired_1000", |b| {
        b.iter_batched(
            || {
                rt.block_on(async {
                    let store = InMemoryTaskProvider::new(unbounded());
                    let past = TaskMetadata::expiring_at(Utc::now() - Duration::seconds(1));
                    for i in 0..1_000 {
                        let metadata = (i % 2 == 0).then(|| past.clone());
                        store
                            .store_task(Task::new(format!("task-{i}"), "ctx"), metadata)
                            .await
                            .unwrap();
                    }
                    store
                })
            },
            |store| black_box(rt.block_on(store.cleanup_expired_tasks()).unwrap()),
            criterion::BatchSize::LargeInput,
        )
    });
}

criterion_group!(
    benches,
    bench_store_and_get,
    bench_queries,
    bench_status_updates,
    bench_expiry_sweep
);
criterion_main!(benches);
