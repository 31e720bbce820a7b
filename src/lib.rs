//! # Tasklane
//!
//! Durable storage for A2A (agent-to-agent) tasks behind one async
//! contract, with three interchangeable backends:
//!
//! - **In-memory**: always available, single process
//! - **Redis**: `redis` feature
//! - **PostgreSQL**: `postgres` feature
//!
//! plus a [`CleanupService`] that applies retention policy through the same
//! contract on any of them.
//!
//! ## Example
//!
//! ```rust
//! use tasklane::{CleanupConfig, CleanupService, StorageConfig, Task, TaskState, connect_provider};
//!
//! # tokio_test::block_on(async {
//! let store = connect_provider(&StorageConfig::default()).await.unwrap();
//! store.store_task(Task::new("task-1", "ctx-1"), None).await.unwrap();
//! store
//!     .update_task_status("task-1", TaskState::Completed, None, None)
//!     .await
//!     .unwrap();
//!
//! let cleanup = CleanupService::new(store.clone(), CleanupConfig::default());
//! let report = cleanup.run_once().await;
//! assert!(report.errors.is_empty());
//! # });
//! ```

pub mod telemetry;

pub use tasklane_a2a::{
    Artifact, DataPart, FileContent, FilePart, Message, Part, Role, Task, TaskState, TaskStatus,
    TextPart,
};
pub use tasklane_core::{
    CleanupConfig, CleanupReport, CleanupService, ConfigError, HealthReport, InMemoryTaskProvider,
    IntegrityViolation, MemoryStorageConfig, PostgresStorageConfig, RedisStorageConfig,
    StorageBackend, StorageConfig, StorageErrorKind, StoreOperation, StoreSettings, StoredRecord,
    TaskCodec, TaskMetadata, TaskQuery, TaskStats, TaskStorageProvider, TaskStorageProviderExt,
    TaskStoreError, TaskStoreResult,
};
pub use tasklane_storage::{MAX_CAS_RETRIES, connect_provider};

#[cfg(feature = "postgres")]
pub use tasklane_storage::PostgresTaskProvider;
#[cfg(feature = "redis")]
pub use tasklane_storage::RedisTaskProvider;
