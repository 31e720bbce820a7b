//! # Tasklane Core
//!
//! Storage contract for A2A tasks plus everything that is independent of a
//! particular database:
//!
//! - **[TaskStorageProvider]**: the async trait every backend implements
//! - **[TaskCodec]**: task flattening, validation and sanitization
//! - **[InMemoryTaskProvider]**: single-process provider with context and state indices
//! - **[CleanupService]**: periodic, policy-driven reaper that works over any provider
//! - **[StorageConfig]**: backend selection and shared store settings
//!
//! Redis and PostgreSQL providers live in `tasklane-storage`.
//!
//! ## Example
//!
//! ```rust
//! use tasklane_a2a::{Task, TaskState};
//! use tasklane_core::{InMemoryTaskProvider, TaskQuery, TaskStorageProvider};
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryTaskProvider::default();
//! store.store_task(Task::new("task-1", "ctx-1"), None).await.unwrap();
//!
//! let task = store
//!     .update_task_status("task-1", TaskState::Working, None, None)
//!     .await
//!     .unwrap();
//! assert_eq!(task.status.state, TaskState::Working);
//!
//! let found = store
//!     .find_tasks(&TaskQuery::new().with_context("ctx-1"))
//!     .await
//!     .unwrap();
//! assert_eq!(found.len(), 1);
//! # });
//! ```

pub mod cleanup;
pub mod config;
pub mod error;
pub mod in_memory;
pub mod policy;
pub mod provider;
pub mod query;
pub mod record;
pub mod serialization;

pub use cleanup::{CleanupConfig, CleanupReport, CleanupService};
pub use config::{
    ConfigError, MemoryStorageConfig, PostgresStorageConfig, RedisStorageConfig, StorageConfig,
    StoreSettings,
};
pub use error::{
    IntegrityViolation, StorageBackend, StorageErrorKind, StoreOperation, TaskStoreError,
    TaskStoreResult,
};
pub use in_memory::{InMemoryTaskProvider, IndexSnapshot};
pub use policy::WritePolicy;
pub use provider::{
    HealthReport, TaskStats, TaskStorageProvider, TaskStorageProviderExt, apply_status_update,
    with_timeout,
};
pub use query::{TaskQuery, result_order};
pub use record::{StoredRecord, TaskMetadata, expiry_after};
pub use serialization::{
    TaskCodec, canonical_timestamp, extract_search_text, parse_timestamp, validate_integrity,
    validate_payload,
};
