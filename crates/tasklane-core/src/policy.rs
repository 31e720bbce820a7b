//! Write-side rules shared by every backend.

use tasklane_a2a::Task;

use crate::config::StoreSettings;
use crate::error::{StorageErrorKind, StoreOperation, TaskStoreError, TaskStoreResult};
use crate::record::{TaskMetadata, expiry_after};
use crate::serialization::TaskCodec;

/// Applies store settings to tasks before they are persisted
#[derive(Debug, Clone)]
pub struct WritePolicy {
    settings: StoreSettings,
    codec: TaskCodec,
}

impl WritePolicy {
    pub fn new(settings: StoreSettings, codec: TaskCodec) -> Self {
        Self { settings, codec }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn codec(&self) -> &TaskCodec {
        &self.codec
    }

    /// Drop disabled sequences, then validate and normalize the task
    pub fn prepare(&self, mut task: Task) -> TaskStoreResult<Task> {
        if !self.settings.enable_history {
            task.history = None;
        }
        if !self.settings.enable_artifacts {
            task.artifacts = None;
        }
        self.codec.sanitize(task)
    }

    /// Metadata for a new record: the caller's, with the default TTL filled in
    pub fn initial_metadata(&self, metadata: Option<TaskMetadata>) -> Option<TaskMetadata> {
        match (metadata, self.settings.default_ttl()) {
            (Some(mut meta), Some(ttl)) if meta.expires_at.is_none() => {
                meta.expires_at = Some(expiry_after(ttl));
                Some(meta)
            }
            (None, Some(ttl)) => Some(TaskMetadata::expiring_in(ttl)),
            (meta, _) => meta,
        }
    }

    /// Reject a new task when either capacity limit is already reached.
    ///
    /// `stored` and `in_context` count records that stay after the insert
    /// (a replaced expired record is not counted).
    pub fn check_capacity(
        &self,
        task: &Task,
        stored: usize,
        in_context: usize,
    ) -> TaskStoreResult<()> {
        if let Some(limit) = self.settings.max_tasks
            && stored >= limit
        {
            return Err(self.capacity_error(task, StorageErrorKind::CapacityExceeded { limit }));
        }
        if let Some(limit) = self.settings.max_tasks_per_context
            && in_context >= limit
        {
            return Err(self.capacity_error(
                task,
                StorageErrorKind::ContextCapacityExceeded {
                    context_id: task.context_id.clone(),
                    limit,
                },
            ));
        }
        Ok(())
    }

    fn capacity_error(&self, task: &Task, kind: StorageErrorKind) -> TaskStoreError {
        TaskStoreError::for_task(StoreOperation::Store, self.codec.backend(), &task.id, kind)
    }
}
