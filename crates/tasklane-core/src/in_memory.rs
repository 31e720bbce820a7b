//! In-process task storage with hand-maintained secondary indices.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tasklane_a2a::{Message, Task, TaskState};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::StoreSettings;
use crate::error::{
    IntegrityViolation, StorageBackend, StorageErrorKind, StoreOperation, TaskStoreError,
    TaskStoreResult,
};
use crate::policy::WritePolicy;
use crate::provider::{HealthReport, TaskStats, TaskStorageProvider, apply_status_update};
use crate::query::TaskQuery;
use crate::record::{StoredRecord, TaskMetadata};
use crate::serialization::TaskCodec;

const BACKEND: StorageBackend = StorageBackend::InMemory;

/// Primary records plus the two derived indices.
///
/// Only `insert` and `remove` touch the maps, so both indices always
/// mirror `records` once either returns.
#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<String, StoredRecord>,
    by_context: HashMap<String, HashSet<String>>,
    by_state: HashMap<TaskState, HashSet<String>>,
}

impl MemoryState {
    fn insert(&mut self, record: StoredRecord) {
        if let Some(previous) = self.records.get(&record.task_id) {
            let (context_id, state) = (previous.context_id.clone(), previous.state);
            self.unindex(&record.task_id, &context_id, state);
        }
        self.by_context
            .entry(record.context_id.clone())
            .or_default()
            .insert(record.task_id.clone());
        self.by_state
            .entry(record.state)
            .or_default()
            .insert(record.task_id.clone());
        self.records.insert(record.task_id.clone(), record);
    }

    fn remove(&mut self, task_id: &str) -> Option<StoredRecord> {
        let record = self.records.remove(task_id)?;
        self.unindex(task_id, &record.context_id, record.state);
        Some(record)
    }

    fn unindex(&mut self, task_id: &str, context_id: &str, state: TaskState) {
        if let Some(ids) = self.by_context.get_mut(context_id) {
            ids.remove(task_id);
            if ids.is_empty() {
                self.by_context.remove(context_id);
            }
        }
        if let Some(ids) = self.by_state.get_mut(&state) {
            ids.remove(task_id);
            if ids.is_empty() {
                self.by_state.remove(&state);
            }
        }
    }

    fn live(&self, task_id: &str) -> Option<&StoredRecord> {
        self.records.get(task_id).filter(|r| !r.is_expired())
    }

    fn context_size(&self, context_id: &str) -> usize {
        self.by_context.get(context_id).map_or(0, HashSet::len)
    }

    /// Narrowest candidate set for a query, before predicate filtering
    fn candidates<'a>(
        &'a self,
        query: &'a TaskQuery,
    ) -> Box<dyn Iterator<Item = &'a StoredRecord> + 'a> {
        if let Some(task_id) = &query.task_id {
            Box::new(self.records.get(task_id).into_iter())
        } else if let Some(context_id) = &query.context_id {
            Box::new(self.ids_to_records(self.by_context.get(context_id)))
        } else if let Some(state) = query.state {
            Box::new(self.ids_to_records(self.by_state.get(&state)))
        } else {
            Box::new(self.records.values())
        }
    }

    fn ids_to_records<'a>(
        &'a self,
        ids: Option<&'a HashSet<String>>,
    ) -> impl Iterator<Item = &'a StoredRecord> + 'a {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
    }
}

/// Point-in-time copy of the primary store and both indices
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexSnapshot {
    /// task id -> (context id, state) for every stored record
    pub records: BTreeMap<String, (String, TaskState)>,
    pub by_context: BTreeMap<String, BTreeSet<String>>,
    pub by_state: BTreeMap<TaskState, BTreeSet<String>>,
}

impl IndexSnapshot {
    /// Indices as they should look for the snapshot's records
    pub fn expected_indices(
        &self,
    ) -> (
        BTreeMap<String, BTreeSet<String>>,
        BTreeMap<TaskState, BTreeSet<String>>,
    ) {
        let mut by_context: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut by_state: BTreeMap<TaskState, BTreeSet<String>> = BTreeMap::new();
        for (id, (context_id, state)) in &self.records {
            by_context
                .entry(context_id.clone())
                .or_default()
                .insert(id.clone());
            by_state.entry(*state).or_default().insert(id.clone());
        }
        (by_context, by_state)
    }

    pub fn is_consistent(&self) -> bool {
        let (by_context, by_state) = self.expected_indices();
        by_context == self.by_context && by_state == self.by_state
    }
}

/// Single-process task store.
///
/// All state lives behind one lock. Mutations do their fallible work
/// (sanitizing, serializing, existence and capacity checks) before the
/// first edit, so a failed call leaves the store untouched and readers
/// never see a half-applied change.
pub struct InMemoryTaskProvider {
    state: RwLock<MemoryState>,
    policy: WritePolicy,
}

impl InMemoryTaskProvider {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            policy: WritePolicy::new(settings, TaskCodec::new(BACKEND)),
        }
    }

    fn codec(&self) -> &TaskCodec {
        self.policy.codec()
    }

    /// Number of physically stored records, expired ones included
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Insert a pre-built record as-is, replacing any record with the same id.
    ///
    /// Used to restore records exported from another store; the payload is
    /// not re-validated until it is read.
    pub async fn restore_record(&self, record: StoredRecord) {
        debug!(task_id = %record.task_id, "Restoring stored record");
        self.state.write().await.insert(record);
    }

    /// Copy of the primary store and both indices
    pub async fn index_snapshot(&self) -> IndexSnapshot {
        let state = self.state.read().await;
        IndexSnapshot {
            records: state
                .records
                .values()
                .map(|r| (r.task_id.clone(), (r.context_id.clone(), r.state)))
                .collect(),
            by_context: state
                .by_context
                .iter()
                .map(|(k, ids)| (k.clone(), ids.iter().cloned().collect()))
                .collect(),
            by_state: state
                .by_state
                .iter()
                .map(|(k, ids)| (*k, ids.iter().cloned().collect()))
                .collect(),
        }
    }
}

impl Default for InMemoryTaskProvider {
    fn default() -> Self {
        Self::new(StoreSettings::default())
    }
}

#[async_trait]
impl TaskStorageProvider for InMemoryTaskProvider {
    fn backend(&self) -> StorageBackend {
        BACKEND
    }

    async fn store_task(&self, task: Task, metadata: Option<TaskMetadata>) -> TaskStoreResult<()> {
        let task = self.policy.prepare(task)?;
        let metadata = self.policy.initial_metadata(metadata);
        let record = self.codec().serialize(&task, metadata.as_ref())?;

        let mut state = self.state.write().await;
        let (stored, in_context) = match state.records.get(&task.id) {
            Some(existing) if !existing.is_expired() => {
                return Err(TaskStoreError::for_task(
                    StoreOperation::Store,
                    BACKEND,
                    &task.id,
                    StorageErrorKind::AlreadyExists,
                ));
            }
            Some(expired) => {
                let same_context = usize::from(expired.context_id == task.context_id);
                (
                    state.records.len() - 1,
                    state.context_size(&task.context_id) - same_context,
                )
            }
            None => (state.records.len(), state.context_size(&task.context_id)),
        };
        self.policy.check_capacity(&task, stored, in_context)?;

        state.insert(record);
        debug!(task_id = %task.id, context_id = %task.context_id, state = %task.status.state, "Stored task");
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> TaskStoreResult<Option<Task>> {
        let state = self.state.read().await;
        state
            .live(task_id)
            .map(|record| self.codec().deserialize(record))
            .transpose()
    }

    async fn update_task(
        &self,
        task: Task,
        metadata: Option<TaskMetadata>,
    ) -> TaskStoreResult<()> {
        let task = self.policy.prepare(task)?;

        let mut state = self.state.write().await;
        let existing = state
            .live(&task.id)
            .ok_or_else(|| TaskStoreError::not_found(&task.id, BACKEND))?;
        if existing.context_id != task.context_id {
            return Err(TaskStoreError::for_task(
                StoreOperation::Update,
                BACKEND,
                &task.id,
                StorageErrorKind::Integrity(IntegrityViolation::ContextChanged {
                    stored: existing.context_id.clone(),
                    requested: task.context_id.clone(),
                }),
            ));
        }

        let metadata = TaskMetadata::merged(existing.metadata.clone(), metadata);
        let mut record = self.codec().serialize(&task, metadata.as_ref())?;
        record.succeed(existing);
        let previous_state = existing.state;

        state.insert(record);
        debug!(task_id = %task.id, from = %previous_state, to = %task.status.state, "Updated task");
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        new_state: TaskState,
        message: Option<Message>,
        timestamp: Option<String>,
    ) -> TaskStoreResult<Task> {
        let mut state = self.state.write().await;
        let existing = state
            .live(task_id)
            .ok_or_else(|| TaskStoreError::not_found(task_id, BACKEND))?;

        let mut task = self.codec().deserialize(existing)?;
        apply_status_update(
            &mut task,
            new_state,
            message,
            timestamp,
            self.policy.settings().enable_history,
        );
        let task = self.policy.prepare(task)?;
        let mut record = self.codec().serialize(&task, existing.metadata.as_ref())?;
        record.succeed(existing);

        state.insert(record);
        debug!(task_id = %task_id, state = %new_state, "Updated task status");
        Ok(task)
    }

    async fn find_tasks(&self, query: &TaskQuery) -> TaskStoreResult<Vec<Task>> {
        let state = self.state.read().await;
        let now = Utc::now();
        let matching: Vec<StoredRecord> = state
            .candidates(query)
            .filter(|r| !r.is_expired_at(now) && query.matches(r))
            .cloned()
            .collect();
        drop(state);

        query
            .paginate(matching)
            .iter()
            .map(|record| self.codec().deserialize(record))
            .collect()
    }

    async fn delete_task(&self, task_id: &str) -> TaskStoreResult<bool> {
        let removed = self.state.write().await.remove(task_id).is_some();
        debug!(task_id = %task_id, removed, "Deleted task");
        Ok(removed)
    }

    async fn delete_tasks_by_context(&self, context_id: &str) -> TaskStoreResult<usize> {
        let mut state = self.state.write().await;
        let ids: Vec<String> = state
            .by_context
            .get(context_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        for id in &ids {
            state.remove(id);
        }
        debug!(context_id = %context_id, count = ids.len(), "Deleted context tasks");
        Ok(ids.len())
    }

    async fn cleanup_expired_tasks(&self) -> TaskStoreResult<usize> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .records
            .values()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.task_id.clone())
            .collect();
        for id in &expired {
            state.remove(id);
            debug!(task_id = %id, "Cleaned up expired task");
        }

        let count = expired.len();
        if count > 0 {
            info!(count, backend = %BACKEND, "Cleaned up expired A2A tasks");
        }
        Ok(count)
    }

    async fn count_expired_tasks(&self) -> TaskStoreResult<usize> {
        let now = Utc::now();
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.is_expired_at(now))
            .count())
    }

    async fn get_task_stats(&self, context_id: Option<&str>) -> TaskStoreResult<TaskStats> {
        let state = self.state.read().await;
        let now = Utc::now();
        let stats = match context_id {
            Some(context_id) => TaskStats::from_records(
                state
                    .ids_to_records(state.by_context.get(context_id))
                    .filter(|r| !r.is_expired_at(now)),
            ),
            None => TaskStats::from_records(
                state.records.values().filter(|r| !r.is_expired_at(now)),
            ),
        };
        Ok(stats)
    }

    async fn health_check(&self) -> HealthReport {
        HealthReport::probe(self.policy.settings().operation_timeout(), async {
            let _guard = self.state.read().await;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> TaskStoreResult<()> {
        debug!(backend = %BACKEND, "Closed task provider");
        Ok(())
    }
}
