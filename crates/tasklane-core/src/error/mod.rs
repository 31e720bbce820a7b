//! Task store error types.
//!
//! Every provider operation returns [`TaskStoreResult`]. Driver failures
//! (JSON, Redis, PostgreSQL) are wrapped into [`TaskStoreError::Storage`]
//! at the provider boundary; [`TaskStoreError::NotFound`] is reserved for
//! updates that target a missing or expired task.

mod types;

pub use types::{IntegrityViolation, StorageBackend, StorageErrorKind, StoreOperation};

use thiserror::Error;

/// Result type for task store operations
pub type TaskStoreResult<T> = Result<T, TaskStoreError>;

/// Errors that can occur in task store operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskStoreError {
    /// Any I/O, serialization or validation failure
    #[error("Task {operation} failed on {backend} backend{}: {kind}", task_suffix(.task_id))]
    Storage {
        operation: StoreOperation,
        backend: StorageBackend,
        task_id: Option<String>,
        kind: StorageErrorKind,
    },

    /// Update or status change targeted a missing task
    #[error("Task not found: {task_id} ({backend} backend)")]
    NotFound {
        task_id: String,
        backend: StorageBackend,
    },
}

fn task_suffix(task_id: &Option<String>) -> String {
    match task_id {
        Some(id) => format!(" for task '{}'", id),
        None => String::new(),
    }
}

impl TaskStoreError {
    /// Create a storage error without a task id
    pub fn storage(
        operation: StoreOperation,
        backend: StorageBackend,
        kind: StorageErrorKind,
    ) -> Self {
        Self::Storage {
            operation,
            backend,
            task_id: None,
            kind,
        }
    }

    /// Create a storage error about a specific task
    pub fn for_task(
        operation: StoreOperation,
        backend: StorageBackend,
        task_id: impl Into<String>,
        kind: StorageErrorKind,
    ) -> Self {
        Self::Storage {
            operation,
            backend,
            task_id: Some(task_id.into()),
            kind,
        }
    }

    /// Create a task not found error
    pub fn not_found(task_id: impl Into<String>, backend: StorageBackend) -> Self {
        Self::NotFound {
            task_id: task_id.into(),
            backend,
        }
    }

    /// Create a timeout error
    pub fn timeout(
        operation: StoreOperation,
        backend: StorageBackend,
        after: std::time::Duration,
    ) -> Self {
        Self::storage(
            operation,
            backend,
            StorageErrorKind::Timeout {
                after_ms: after.as_millis() as u64,
            },
        )
    }

    /// Attach a task id to a storage error that lacks one
    pub fn with_task_id(mut self, id: impl Into<String>) -> Self {
        if let Self::Storage { task_id, .. } = &mut self
            && task_id.is_none()
        {
            *task_id = Some(id.into());
        }
        self
    }

    /// Backend the error originated from
    pub fn backend(&self) -> StorageBackend {
        match self {
            Self::Storage { backend, .. } | Self::NotFound { backend, .. } => *backend,
        }
    }

    /// Failure category, if this is a storage error
    pub fn kind(&self) -> Option<&StorageErrorKind> {
        match self {
            Self::Storage { kind, .. } => Some(kind),
            Self::NotFound { .. } => None,
        }
    }

    /// Task id the error refers to, if known
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Storage { task_id, .. } => task_id.as_deref(),
            Self::NotFound { task_id, .. } => Some(task_id),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Integrity violation carried by the error, if any
    pub fn integrity_violation(&self) -> Option<&IntegrityViolation> {
        match self.kind() {
            Some(StorageErrorKind::Integrity(violation)) => Some(violation),
            _ => None,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            Some(
                StorageErrorKind::Timeout { .. }
                    | StorageErrorKind::Connection { .. }
                    | StorageErrorKind::VersionConflict { .. }
            )
        )
    }
}
