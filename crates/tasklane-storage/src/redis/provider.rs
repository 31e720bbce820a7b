use std::collections::{BTreeMap, HashMap};

use ::redis::{AsyncCommands, ErrorKind as RedisErrorKind, RedisError};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use tasklane_a2a::{Message, Task, TaskState};
use tasklane_core::{
    HealthReport, IntegrityViolation, RedisStorageConfig, StorageBackend, StorageErrorKind,
    StoreOperation, StoreSettings, StoredRecord, TaskCodec, TaskMetadata, TaskQuery, TaskStats,
    TaskStorageProvider, TaskStoreError, TaskStoreResult, WritePolicy, apply_status_update,
    with_timeout,
};
use tracing::{debug, info, warn};

use super::keys::{TOTAL_FIELD, TaskKeys, state_field};
use super::record::{self, EXPIRES_AT, STATE, optional_millis};
use super::scripts::{StoreOutcome, TaskScripts, UpdateOutcome};
use crate::MAX_CAS_RETRIES;

const BACKEND: StorageBackend = StorageBackend::Redis;
const SCAN_COUNT: usize = 200;

/// Task store on Redis.
///
/// Each task is a hash at `{prefix}task:{id}`, indexed by a set per context
/// at `{prefix}context:{contextId}`, with counters in `{prefix}stats`.
/// Records with a native TTL are listed in `{prefix}expiries`; writes and
/// sweeps use that index to drop what Redis expired from the context sets
/// and counters before checking capacity.
/// Writes go through Lua scripts; updates are compare-and-swap on the
/// record's `version` field. State-only and unscoped queries walk the
/// keyspace with `SCAN`, so they cost O(stored tasks).
pub struct RedisTaskProvider {
    pool: Pool,
    owns_pool: bool,
    keys: TaskKeys,
    scripts: TaskScripts,
    policy: WritePolicy,
}

impl RedisTaskProvider {
    /// Build a pool from `config` and verify the server answers.
    ///
    /// The pool belongs to the provider and is closed by [`close`](TaskStorageProvider::close).
    pub async fn connect(config: RedisStorageConfig) -> TaskStoreResult<Self> {
        config.validate().map_err(|e| {
            TaskStoreError::storage(
                StoreOperation::Connect,
                BACKEND,
                StorageErrorKind::InvalidConfig {
                    details: e.to_string(),
                },
            )
        })?;

        let pool = PoolConfig::from_url(config.url())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| {
                TaskStoreError::storage(
                    StoreOperation::Connect,
                    BACKEND,
                    StorageErrorKind::Connection {
                        details: format!("Failed to create connection pool: {}", e),
                    },
                )
            })?;

        let provider = Self::build(pool, true, config.settings);
        provider.ping(StoreOperation::Connect).await?;
        info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            prefix = %provider.keys.prefix(),
            "Connected Redis task provider"
        );
        Ok(provider)
    }

    /// Use a pool owned by the caller; `close` leaves it open.
    pub fn with_pool(pool: Pool, settings: StoreSettings) -> Self {
        Self::build(pool, false, settings)
    }

    fn build(pool: Pool, owns_pool: bool, settings: StoreSettings) -> Self {
        Self {
            pool,
            owns_pool,
            keys: TaskKeys::new(settings.key_prefix.clone()),
            scripts: TaskScripts::new(),
            policy: WritePolicy::new(settings, TaskCodec::new(BACKEND)),
        }
    }

    pub fn keys(&self) -> &TaskKeys {
        &self.keys
    }

    fn settings(&self) -> &StoreSettings {
        self.policy.settings()
    }

    async fn timed<T, F>(&self, operation: StoreOperation, future: F) -> TaskStoreResult<T>
    where
        F: std::future::Future<Output = TaskStoreResult<T>>,
    {
        with_timeout(self.settings().operation_timeout(), operation, BACKEND, future).await
    }

    async fn conn(&self, operation: StoreOperation) -> TaskStoreResult<Connection> {
        self.pool.get().await.map_err(|e| {
            TaskStoreError::storage(
                operation,
                BACKEND,
                StorageErrorKind::Connection {
                    details: format!("Failed to get connection from pool: {}", e),
                },
            )
        })
    }

    async fn ping(&self, operation: StoreOperation) -> TaskStoreResult<()> {
        self.timed(operation, async {
            let mut conn = self.conn(operation).await?;
            let _: String = ::redis::cmd("PING")
                .query_async(&mut *conn)
                .await
                .map_err(|e| redis_error(operation, None, &e))?;
            Ok(())
        })
        .await
    }

    async fn fetch(
        &self,
        conn: &mut Connection,
        operation: StoreOperation,
        task_id: &str,
    ) -> TaskStoreResult<Option<StoredRecord>> {
        let fields: HashMap<String, String> = conn
            .hgetall(self.keys.task(task_id))
            .await
            .map_err(|e| redis_error(operation, Some(task_id), &e))?;
        record::from_fields(fields)
    }

    async fn fetch_many(
        &self,
        conn: &mut Connection,
        operation: StoreOperation,
        keys: &[String],
    ) -> TaskStoreResult<Vec<StoredRecord>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = ::redis::pipe();
        for key in keys {
            pipe.hgetall(key);
        }
        let hashes: Vec<HashMap<String, String>> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| redis_error(operation, None, &e))?;

        let mut records = Vec::with_capacity(hashes.len());
        for fields in hashes {
            if let Some(record) = record::from_fields(fields)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn context_task_keys(
        &self,
        conn: &mut Connection,
        operation: StoreOperation,
        context_id: &str,
    ) -> TaskStoreResult<Vec<String>> {
        let ids: Vec<String> = conn
            .smembers(self.keys.context(context_id))
            .await
            .map_err(|e| redis_error(operation, None, &e))?;
        Ok(ids.iter().map(|id| self.keys.task(id)).collect())
    }

    async fn scan(
        &self,
        conn: &mut Connection,
        operation: StoreOperation,
        pattern: &str,
    ) -> TaskStoreResult<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut *conn)
                .await
                .map_err(|e| redis_error(operation, None, &e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    /// Live records matching the narrowest key set for `query`
    async fn candidates(
        &self,
        conn: &mut Connection,
        query: &TaskQuery,
    ) -> TaskStoreResult<Vec<StoredRecord>> {
        let operation = StoreOperation::Find;
        let records = if let Some(task_id) = &query.task_id {
            self.fetch(conn, operation, task_id)
                .await?
                .into_iter()
                .collect()
        } else if let Some(context_id) = &query.context_id {
            let keys = self.context_task_keys(conn, operation, context_id).await?;
            self.fetch_many(conn, operation, &keys).await?
        } else {
            let keys = self.scan(conn, operation, &self.keys.task_pattern()).await?;
            self.fetch_many(conn, operation, &keys).await?
        };

        let now = Utc::now();
        Ok(records
            .into_iter()
            .filter(|r| !r.is_expired_at(now) && query.matches(r))
            .collect())
    }

    /// Task keys whose `expiresAt` is at or before `now_ms`
    async fn expired_keys(
        &self,
        conn: &mut Connection,
        operation: StoreOperation,
        now_ms: i64,
    ) -> TaskStoreResult<Vec<String>> {
        let keys = self.scan(conn, operation, &self.keys.task_pattern()).await?;
        if keys.is_empty() {
            return Ok(keys);
        }
        let mut pipe = ::redis::pipe();
        for key in &keys {
            pipe.hget(key, EXPIRES_AT);
        }
        let expiries: Vec<Option<String>> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| redis_error(operation, None, &e))?;

        Ok(keys
            .into_iter()
            .zip(expiries)
            .filter(|(_, expires_at)| {
                expires_at
                    .as_deref()
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .is_some_and(|at| at <= now_ms)
            })
            .map(|(key, _)| key)
            .collect())
    }

    /// Drop context-set members whose hash is gone (native expiry) and
    /// recount the stats hash from the surviving records.
    ///
    /// Writes racing with this pass can leave the counters off until the
    /// next sweep.
    async fn reconcile_indices(&self, conn: &mut Connection) -> TaskStoreResult<usize> {
        let operation = StoreOperation::CleanupExpired;
        let mut pruned = 0;

        for context_key in self.scan(conn, operation, &self.keys.context_pattern()).await? {
            if self.keys.context_id_of(&context_key).is_none() {
                continue;
            }
            let ids: Vec<String> = conn
                .smembers(&context_key)
                .await
                .map_err(|e| redis_error(operation, None, &e))?;
            if ids.is_empty() {
                continue;
            }
            let mut pipe = ::redis::pipe();
            for id in &ids {
                pipe.exists(self.keys.task(id));
            }
            let present: Vec<bool> = pipe
                .query_async(&mut *conn)
                .await
                .map_err(|e| redis_error(operation, None, &e))?;
            let orphans: Vec<String> = ids
                .into_iter()
                .zip(present)
                .filter(|(_, present)| !present)
                .map(|(id, _)| id)
                .collect();
            if !orphans.is_empty() {
                let _: i64 = conn
                    .srem(&context_key, &orphans)
                    .await
                    .map_err(|e| redis_error(operation, None, &e))?;
                pruned += orphans.len();
            }
        }

        let task_keys = self.scan(conn, operation, &self.keys.task_pattern()).await?;
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        if !task_keys.is_empty() {
            let mut pipe = ::redis::pipe();
            for key in &task_keys {
                pipe.hget(key, STATE);
            }
            let states: Vec<Option<String>> = pipe
                .query_async(&mut *conn)
                .await
                .map_err(|e| redis_error(operation, None, &e))?;
            for state in states.into_iter().flatten() {
                if let Ok(state) = state.parse::<TaskState>() {
                    *counts.entry(state_field(state)).or_insert(0) += 1;
                    *counts.entry(TOTAL_FIELD.to_string()).or_insert(0) += 1;
                }
            }
        }

        let mut invocation = self.scripts.reset_stats.prepare_invoke();
        invocation.key(self.keys.stats());
        for (field, count) in &counts {
            invocation.arg(field).arg(*count);
        }
        let _: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| redis_error(operation, None, &e))?;

        Ok(pruned)
    }

    /// Run the CAS script for `record` replacing `existing`
    async fn swap(
        &self,
        conn: &mut Connection,
        operation: StoreOperation,
        existing: &StoredRecord,
        record: &StoredRecord,
    ) -> TaskStoreResult<UpdateOutcome> {
        let fields = record::to_fields(record)?;
        let mut invocation = self.scripts.update.prepare_invoke();
        invocation
            .key(self.keys.task(&record.task_id))
            .key(self.keys.stats())
            .key(self.keys.expiries())
            .key(self.keys.expiry_owners())
            .arg(Utc::now().timestamp_millis())
            .arg(existing.version.to_string())
            .arg(record.state.as_str())
            .arg(optional_millis(record.expires_at))
            .arg(&record.task_id);
        for (field, value) in &fields {
            invocation.arg(*field).arg(value);
        }
        let code: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| redis_error(operation, Some(&record.task_id), &e))?;
        UpdateOutcome::from_code(code).ok_or_else(|| unexpected_reply(operation, &record.task_id, code))
    }

    /// Read-modify-write loop shared by both update operations.
    ///
    /// `rewrite` turns the current record into the task to return and the
    /// record to write. A concurrent writer makes the script report a
    /// version mismatch, and the loop starts over from a fresh read.
    async fn compare_and_swap<F>(
        &self,
        operation: StoreOperation,
        task_id: &str,
        mut rewrite: F,
    ) -> TaskStoreResult<Task>
    where
        F: FnMut(&StoredRecord) -> TaskStoreResult<(Task, StoredRecord)> + Send,
    {
        let mut conn = self.conn(operation).await?;
        let mut expected = 0;
        for attempt in 1..=MAX_CAS_RETRIES {
            let existing = self
                .fetch(&mut conn, operation, task_id)
                .await?
                .filter(|r| !r.is_expired())
                .ok_or_else(|| TaskStoreError::not_found(task_id, BACKEND))?;
            expected = existing.version;

            let (task, record) = rewrite(&existing)?;
            match self.swap(&mut conn, operation, &existing, &record).await? {
                UpdateOutcome::Updated => return Ok(task),
                UpdateOutcome::Missing => return Err(TaskStoreError::not_found(task_id, BACKEND)),
                UpdateOutcome::VersionMismatch => {
                    debug!(task_id = %task_id, attempt, expected, "Version conflict, retrying");
                }
            }
        }

        warn!(task_id = %task_id, retries = MAX_CAS_RETRIES, "Giving up after repeated version conflicts");
        Err(TaskStoreError::for_task(
            operation,
            BACKEND,
            task_id,
            StorageErrorKind::VersionConflict { expected },
        ))
    }
}

#[async_trait]
impl TaskStorageProvider for RedisTaskProvider {
    fn backend(&self) -> StorageBackend {
        BACKEND
    }

    async fn store_task(&self, task: Task, metadata: Option<TaskMetadata>) -> TaskStoreResult<()> {
        let operation = StoreOperation::Store;
        let task = self.policy.prepare(task)?;
        let metadata = self.policy.initial_metadata(metadata);
        let record = self.policy.codec().serialize(&task, metadata.as_ref())?;
        let fields = record::to_fields(&record)?;
        let settings = self.settings();

        self.timed(operation, async {
            let mut conn = self.conn(operation).await?;
            let mut invocation = self.scripts.store.prepare_invoke();
            invocation
                .key(self.keys.task(&task.id))
                .key(self.keys.context(&task.context_id))
                .key(self.keys.stats())
                .key(self.keys.expiries())
                .key(self.keys.expiry_owners())
                .arg(Utc::now().timestamp_millis())
                .arg(self.keys.prefix())
                .arg(&task.id)
                .arg(&task.context_id)
                .arg(task.status.state.as_str())
                .arg(optional_millis(record.expires_at))
                .arg(optional_limit(settings.max_tasks))
                .arg(optional_limit(settings.max_tasks_per_context));
            for (field, value) in &fields {
                invocation.arg(*field).arg(value);
            }
            let code: i64 = invocation
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| redis_error(operation, Some(&task.id), &e))?;

            let kind = match StoreOutcome::from_code(code) {
                Some(StoreOutcome::Stored) => {
                    debug!(task_id = %task.id, context_id = %task.context_id, state = %task.status.state, "Stored task");
                    return Ok(());
                }
                Some(StoreOutcome::AlreadyExists) => StorageErrorKind::AlreadyExists,
                Some(StoreOutcome::StoreFull) => StorageErrorKind::CapacityExceeded {
                    limit: settings.max_tasks.unwrap_or_default(),
                },
                Some(StoreOutcome::ContextFull) => StorageErrorKind::ContextCapacityExceeded {
                    context_id: task.context_id.clone(),
                    limit: settings.max_tasks_per_context.unwrap_or_default(),
                },
                None => return Err(unexpected_reply(operation, &task.id, code)),
            };
            Err(TaskStoreError::for_task(operation, BACKEND, &task.id, kind))
        })
        .await
    }

    async fn get_task(&self, task_id: &str) -> TaskStoreResult<Option<Task>> {
        let operation = StoreOperation::Get;
        self.timed(operation, async {
            let mut conn = self.conn(operation).await?;
            self.fetch(&mut conn, operation, task_id)
                .await?
                .filter(|r| !r.is_expired())
                .map(|r| self.policy.codec().deserialize(&r))
                .transpose()
        })
        .await
    }

    async fn update_task(
        &self,
        task: Task,
        metadata: Option<TaskMetadata>,
    ) -> TaskStoreResult<()> {
        let operation = StoreOperation::Update;
        let task = self.policy.prepare(task)?;
        let codec = self.policy.codec();

        self.timed(operation, async {
            self.compare_and_swap(operation, &task.id, |existing| {
                if existing.context_id != task.context_id {
                    return Err(TaskStoreError::for_task(
                        operation,
                        BACKEND,
                        &task.id,
                        StorageErrorKind::Integrity(IntegrityViolation::ContextChanged {
                            stored: existing.context_id.clone(),
                            requested: task.context_id.clone(),
                        }),
                    ));
                }
                let metadata = TaskMetadata::merged(existing.metadata.clone(), metadata.clone());
                let mut record = codec.serialize(&task, metadata.as_ref())?;
                record.succeed(existing);
                Ok((task.clone(), record))
            })
            .await?;
            debug!(task_id = %task.id, state = %task.status.state, "Updated task");
            Ok(())
        })
        .await
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        new_state: TaskState,
        message: Option<Message>,
        timestamp: Option<String>,
    ) -> TaskStoreResult<Task> {
        let operation = StoreOperation::UpdateStatus;
        let keep_history = self.settings().enable_history;

        self.timed(operation, async {
            let task = self
                .compare_and_swap(operation, task_id, |existing| {
                    let mut task = self.policy.codec().deserialize(existing)?;
                    apply_status_update(
                        &mut task,
                        new_state,
                        message.clone(),
                        timestamp.clone(),
                        keep_history,
                    );
                    let task = self.policy.prepare(task)?;
                    let mut record = self
                        .policy
                        .codec()
                        .serialize(&task, existing.metadata.as_ref())?;
                    record.succeed(existing);
                    Ok((task, record))
                })
                .await?;
            debug!(task_id = %task_id, state = %new_state, "Updated task status");
            Ok(task)
        })
        .await
    }

    async fn find_tasks(&self, query: &TaskQuery) -> TaskStoreResult<Vec<Task>> {
        let operation = StoreOperation::Find;
        self.timed(operation, async {
            let mut conn = self.conn(operation).await?;
            let matching = self.candidates(&mut conn, query).await?;
            query
                .paginate(matching)
                .iter()
                .map(|record| self.policy.codec().deserialize(record))
                .collect()
        })
        .await
    }

    async fn delete_task(&self, task_id: &str) -> TaskStoreResult<bool> {
        let operation = StoreOperation::Delete;
        self.timed(operation, async {
            let mut conn = self.conn(operation).await?;
            let removed: i64 = self
                .scripts
                .delete
                .key(self.keys.task(task_id))
                .key(self.keys.stats())
                .key(self.keys.expiries())
                .key(self.keys.expiry_owners())
                .arg(self.keys.prefix())
                .arg(task_id)
                .arg("")
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| redis_error(operation, Some(task_id), &e))?;
            debug!(task_id = %task_id, removed = removed == 1, "Deleted task");
            Ok(removed == 1)
        })
        .await
    }

    async fn delete_tasks_by_context(&self, context_id: &str) -> TaskStoreResult<usize> {
        let operation = StoreOperation::DeleteByContext;
        self.timed(operation, async {
            let mut conn = self.conn(operation).await?;
            let removed: i64 = self
                .scripts
                .delete_context
                .key(self.keys.context(context_id))
                .key(self.keys.stats())
                .key(self.keys.expiries())
                .key(self.keys.expiry_owners())
                .arg(self.keys.prefix())
                .arg(context_id)
                .arg(Utc::now().timestamp_millis())
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| redis_error(operation, None, &e))?;
            let removed = usize::try_from(removed).unwrap_or_default();
            debug!(context_id = %context_id, count = removed, "Deleted context tasks");
            Ok(removed)
        })
        .await
    }

    async fn cleanup_expired_tasks(&self) -> TaskStoreResult<usize> {
        let operation = StoreOperation::CleanupExpired;
        self.timed(operation, async {
            let mut conn = self.conn(operation).await?;
            let now_ms = Utc::now().timestamp_millis();
            let mut count = 0;

            let vanished: i64 = self
                .scripts
                .prune
                .key(self.keys.stats())
                .key(self.keys.expiries())
                .key(self.keys.expiry_owners())
                .arg(self.keys.prefix())
                .arg(now_ms)
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| redis_error(operation, None, &e))?;
            if vanished > 0 {
                debug!(count = vanished, "Accounted for tasks expired by Redis");
            }

            for key in self.expired_keys(&mut conn, operation, now_ms).await? {
                let Some(task_id) = key.strip_prefix(&self.keys.task("")).map(str::to_string)
                else {
                    continue;
                };
                let removed: i64 = self
                    .scripts
                    .delete
                    .key(&key)
                    .key(self.keys.stats())
                    .key(self.keys.expiries())
                    .key(self.keys.expiry_owners())
                    .arg(self.keys.prefix())
                    .arg(&task_id)
                    .arg(now_ms)
                    .invoke_async(&mut *conn)
                    .await
                    .map_err(|e| redis_error(operation, Some(&task_id), &e))?;
                if removed == 1 {
                    debug!(task_id = %task_id, "Cleaned up expired task");
                    count += 1;
                }
            }

            match self.reconcile_indices(&mut conn).await {
                Ok(pruned) if pruned > 0 => {
                    info!(pruned, "Pruned context entries of natively expired tasks")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to reconcile Redis task indices"),
            }

            if count > 0 {
                info!(count, backend = %BACKEND, "Cleaned up expired A2A tasks");
            }
            Ok(count)
        })
        .await
    }

    async fn count_expired_tasks(&self) -> TaskStoreResult<usize> {
        let operation = StoreOperation::CleanupExpired;
        self.timed(operation, async {
            let mut conn = self.conn(operation).await?;
            let now_ms = Utc::now().timestamp_millis();
            Ok(self.expired_keys(&mut conn, operation, now_ms).await?.len())
        })
        .await
    }

    async fn get_task_stats(&self, context_id: Option<&str>) -> TaskStoreResult<TaskStats> {
        let operation = StoreOperation::Stats;
        self.timed(operation, async {
            let mut conn = self.conn(operation).await?;
            let keys = match context_id {
                Some(context_id) => self.context_task_keys(&mut conn, operation, context_id).await?,
                None => self.scan(&mut conn, operation, &self.keys.task_pattern()).await?,
            };
            let now = Utc::now();
            let records = self.fetch_many(&mut conn, operation, &keys).await?;
            Ok(TaskStats::from_records(records.iter().filter(|r| {
                !r.is_expired_at(now) && context_id.is_none_or(|c| r.context_id == c)
            })))
        })
        .await
    }

    async fn health_check(&self) -> HealthReport {
        HealthReport::probe(self.settings().operation_timeout(), async {
            let mut conn = self.pool.get().await.map_err(|e| e.to_string())?;
            let _: String = ::redis::cmd("PING")
                .query_async(&mut *conn)
                .await
                .map_err(|e| sanitize_error(&e))?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> TaskStoreResult<()> {
        if self.owns_pool {
            self.pool.close();
            info!(backend = %BACKEND, "Closed Redis connection pool");
        } else {
            debug!(backend = %BACKEND, "Leaving caller-owned Redis pool open");
        }
        Ok(())
    }
}

fn optional_limit(limit: Option<usize>) -> String {
    limit.map(|l| l.to_string()).unwrap_or_default()
}

fn unexpected_reply(operation: StoreOperation, task_id: &str, code: i64) -> TaskStoreError {
    TaskStoreError::for_task(
        operation,
        BACKEND,
        task_id,
        StorageErrorKind::Backend {
            details: format!("unexpected script reply {}", code),
        },
    )
}

fn redis_error(operation: StoreOperation, task_id: Option<&str>, error: &RedisError) -> TaskStoreError {
    let details = sanitize_error(error);
    let kind = if error.is_io_error() || error.is_connection_refusal() || error.is_timeout() {
        StorageErrorKind::Connection { details }
    } else {
        StorageErrorKind::Backend { details }
    };
    let err = TaskStoreError::storage(operation, BACKEND, kind);
    match task_id {
        Some(id) => err.with_task_id(id),
        None => err,
    }
}

/// Map Redis errors to messages that never echo server payloads or credentials
pub fn sanitize_error(error: &RedisError) -> String {
    match error.kind() {
        RedisErrorKind::AuthenticationFailed => "Authentication failed".to_string(),
        RedisErrorKind::TypeError => "Data type error".to_string(),
        RedisErrorKind::ExecAbortError => "Transaction aborted".to_string(),
        RedisErrorKind::BusyLoadingError => "Redis is loading data".to_string(),
        RedisErrorKind::NoScriptError => "Script not found".to_string(),
        RedisErrorKind::ReadOnly => "Redis is read-only".to_string(),
        _ if error.is_timeout() => "Operation timeout".to_string(),
        _ if error.is_io_error() || error.is_connection_refusal() => {
            "Connection error".to_string()
        }
        _ => "Redis operation failed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_empty_when_unbounded() {
        assert_eq!(optional_limit(None), "");
        assert_eq!(optional_limit(Some(25)), "25");
    }

    #[test]
    fn sanitized_errors_hide_server_details() {
        let err = RedisError::from((RedisErrorKind::TypeError, "WRONGTYPE", "secret-key".to_string()));
        assert_eq!(sanitize_error(&err), "Data type error");

        let mapped = redis_error(StoreOperation::Get, Some("t"), &err);
        assert_eq!(mapped.task_id(), Some("t"));
        assert!(!mapped.to_string().contains("secret-key"));
    }

    #[test]
    fn io_failures_are_connection_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = redis_error(StoreOperation::Connect, None, &RedisError::from(io));
        assert!(matches!(err.kind(), Some(StorageErrorKind::Connection { .. })));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn caller_owned_pool_is_left_open() {
        let pool = PoolConfig::from_url("redis://127.0.0.1:1/0")
            .create_pool(Some(Runtime::Tokio1))
            .unwrap();
        let provider = RedisTaskProvider::with_pool(pool.clone(), StoreSettings::default());
        provider.close().await.unwrap();
        assert!(!pool.is_closed());
        assert_eq!(provider.keys().stats(), "a2a:stats");
    }
}
