use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tasklane_a2a::{Message, Task, TaskState};
use tasklane_core::{
    HealthReport, IntegrityViolation, PostgresStorageConfig, StorageBackend, StorageErrorKind,
    StoreOperation, StoreSettings, StoredRecord, TaskCodec, TaskMetadata, TaskQuery, TaskStats,
    TaskStorageProvider, TaskStoreError, TaskStoreResult, WritePolicy, apply_status_update,
    with_timeout,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::row::RowIndex;
use tokio_postgres::types::FromSql;
use tokio_postgres::{Client, Error as PgError, NoTls, Row};
use tracing::{debug, error, info, warn};

use super::query::{
    RECORD_COLUMNS, build_find_query, build_stats_queries, store_sql, update_sql,
};
use super::schema::TaskSchema;
use crate::MAX_CAS_RETRIES;

const BACKEND: StorageBackend = StorageBackend::Postgres;

/// SQL rendered once for the configured table
struct Statements {
    store: String,
    update: String,
    select_one: String,
    delete: String,
    delete_context: String,
    cleanup_expired: String,
    count_expired: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        Self {
            store: store_sql(table),
            update: update_sql(table),
            select_one: format!("SELECT {RECORD_COLUMNS} FROM {table} WHERE task_id = $1"),
            delete: format!("DELETE FROM {table} WHERE task_id = $1"),
            delete_context: format!("DELETE FROM {table} WHERE context_id = $1"),
            cleanup_expired: format!(
                "DELETE FROM {table} WHERE expires_at IS NOT NULL AND expires_at <= NOW()"
            ),
            count_expired: format!(
                "SELECT COUNT(*) FROM {table} WHERE expires_at IS NOT NULL AND expires_at <= NOW()"
            ),
        }
    }
}

/// Task store on one PostgreSQL table.
///
/// Creates and migrates its table on construction. Inserts go through a
/// store function that checks capacity under advisory locks and only
/// replaces expired rows; updates are compare-and-swap on the `version`
/// column.
pub struct PostgresTaskProvider {
    client: Arc<Client>,
    /// Connection driver task, present only when the provider opened the client
    connection: Mutex<Option<JoinHandle<()>>>,
    table: String,
    statements: Statements,
    policy: WritePolicy,
}

impl PostgresTaskProvider {
    /// Open a connection from `config` and prepare the table.
    ///
    /// The connection belongs to the provider and is shut down by
    /// [`close`](TaskStorageProvider::close).
    pub async fn connect(config: PostgresStorageConfig) -> TaskStoreResult<Self> {
        validate(&config)?;
        if config.connection_string.trim().is_empty() {
            return Err(invalid_config("connection string cannot be empty"));
        }

        let operation = StoreOperation::Connect;
        let timeout = config.settings.operation_timeout();
        let (client, connection) = with_timeout(timeout, operation, BACKEND, async {
            tokio_postgres::connect(&config.connection_string, NoTls)
                .await
                .map_err(|e| pg_error(operation, None, &e))
        })
        .await?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        let provider = Self::build(
            Arc::new(client),
            Some(driver),
            config.table_name,
            config.settings,
        );
        if let Err(e) = provider.prepare_schema().await {
            provider.close().await?;
            return Err(e);
        }
        info!(table = %provider.table, "Connected PostgreSQL task provider");
        Ok(provider)
    }

    /// Use a client owned by the caller; `close` leaves it open.
    pub async fn with_client(
        client: Arc<Client>,
        table_name: impl Into<String>,
        settings: StoreSettings,
    ) -> TaskStoreResult<Self> {
        let config = PostgresStorageConfig {
            settings,
            connection_string: String::new(),
            table_name: table_name.into(),
        };
        validate(&config)?;

        let provider = Self::build(client, None, config.table_name, config.settings);
        provider.prepare_schema().await?;
        Ok(provider)
    }

    fn build(
        client: Arc<Client>,
        connection: Option<JoinHandle<()>>,
        table: String,
        settings: StoreSettings,
    ) -> Self {
        Self {
            client,
            connection: Mutex::new(connection),
            statements: Statements::new(&table),
            table,
            policy: WritePolicy::new(settings, TaskCodec::new(BACKEND)),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
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

    async fn prepare_schema(&self) -> TaskStoreResult<()> {
        let operation = StoreOperation::Connect;
        self.timed(operation, async {
            let applied = TaskSchema::new(&self.table)
                .migrate(&self.client)
                .await
                .map_err(|e| pg_error(operation, None, &e))?;
            if !applied.is_empty() {
                info!(table = %self.table, versions = ?applied, "Applied task table migrations");
            }
            Ok(())
        })
        .await
    }

    async fn fetch(
        &self,
        operation: StoreOperation,
        task_id: &str,
    ) -> TaskStoreResult<Option<StoredRecord>> {
        let row = self
            .client
            .query_opt(&self.statements.select_one, &[&task_id])
            .await
            .map_err(|e| pg_error(operation, Some(task_id), &e))?;
        row.as_ref()
            .map(|row| record_from_row(operation, row))
            .transpose()
    }

    /// Read-modify-write loop shared by both update operations.
    ///
    /// `rewrite` turns the current row into the task to return and the
    /// record to write; the write only lands if the row still carries the
    /// version that was read.
    async fn compare_and_swap<F>(
        &self,
        operation: StoreOperation,
        task_id: &str,
        mut rewrite: F,
    ) -> TaskStoreResult<Task>
    where
        F: FnMut(&StoredRecord) -> TaskStoreResult<(Task, StoredRecord)> + Send,
    {
        let mut expected = 0;
        for attempt in 1..=MAX_CAS_RETRIES {
            let existing = self
                .fetch(operation, task_id)
                .await?
                .filter(|r| !r.is_expired())
                .ok_or_else(|| TaskStoreError::not_found(task_id, BACKEND))?;
            expected = existing.version;

            let (task, record) = rewrite(&existing)?;
            let metadata = metadata_text(operation, &record)?;
            let expected_version = bigint(expected);
            let updated = self
                .client
                .execute(
                    &self.statements.update,
                    &[
                        &record.task_id,
                        &record.state.as_str(),
                        &record.task_data,
                        &record.status_message,
                        &record.status_timestamp,
                        &record.updated_at,
                        &record.expires_at,
                        &metadata,
                        &expected_version,
                    ],
                )
                .await
                .map_err(|e| pg_error(operation, Some(task_id), &e))?;
            if updated == 1 {
                return Ok(task);
            }
            debug!(task_id = %task_id, attempt, expected, "Version conflict, retrying");
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
impl TaskStorageProvider for PostgresTaskProvider {
    fn backend(&self) -> StorageBackend {
        BACKEND
    }

    async fn store_task(&self, task: Task, metadata: Option<TaskMetadata>) -> TaskStoreResult<()> {
        let operation = StoreOperation::Store;
        let task = self.policy.prepare(task)?;
        let metadata = self.policy.initial_metadata(metadata);
        let record = self.policy.codec().serialize(&task, metadata.as_ref())?;
        let metadata = metadata_text(operation, &record)?;
        let max_tasks = self.settings().max_tasks.map(bigint);
        let max_per_context = self.settings().max_tasks_per_context.map(bigint);

        self.timed(operation, async {
            let row = self
                .client
                .query_one(
                    &self.statements.store,
                    &[
                        &record.task_id,
                        &record.context_id,
                        &record.state.as_str(),
                        &record.task_data,
                        &record.status_message,
                        &record.status_timestamp,
                        &record.created_at,
                        &record.updated_at,
                        &record.expires_at,
                        &metadata,
                        &max_tasks,
                        &max_per_context,
                    ],
                )
                .await
                .map_err(|e| pg_error(operation, Some(&task.id), &e))?;
            let code: i32 = column(operation, &row, 0)?;

            let kind = match code {
                1 => {
                    debug!(task_id = %task.id, context_id = %task.context_id, state = %task.status.state, "Stored task");
                    return Ok(());
                }
                0 => StorageErrorKind::AlreadyExists,
                -1 => StorageErrorKind::CapacityExceeded {
                    limit: self.settings().max_tasks.unwrap_or_default(),
                },
                -2 => StorageErrorKind::ContextCapacityExceeded {
                    context_id: task.context_id.clone(),
                    limit: self.settings().max_tasks_per_context.unwrap_or_default(),
                },
                other => StorageErrorKind::Backend {
                    details: format!("unexpected store function result {}", other),
                },
            };
            Err(TaskStoreError::for_task(operation, BACKEND, &task.id, kind))
        })
        .await
    }

    async fn get_task(&self, task_id: &str) -> TaskStoreResult<Option<Task>> {
        let operation = StoreOperation::Get;
        self.timed(operation, async {
            self.fetch(operation, task_id)
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
        let built = build_find_query(&self.table, query);
        self.timed(operation, async {
            let rows = self
                .client
                .query(&built.sql, &built.params())
                .await
                .map_err(|e| pg_error(operation, None, &e))?;
            rows.iter()
                .map(|row| {
                    let record = record_from_row(operation, row)?;
                    self.policy.codec().deserialize(&record)
                })
                .collect()
        })
        .await
    }

    async fn delete_task(&self, task_id: &str) -> TaskStoreResult<bool> {
        let operation = StoreOperation::Delete;
        self.timed(operation, async {
            let removed = self
                .client
                .execute(&self.statements.delete, &[&task_id])
                .await
                .map_err(|e| pg_error(operation, Some(task_id), &e))?;
            debug!(task_id = %task_id, removed = removed > 0, "Deleted task");
            Ok(removed > 0)
        })
        .await
    }

    async fn delete_tasks_by_context(&self, context_id: &str) -> TaskStoreResult<usize> {
        let operation = StoreOperation::DeleteByContext;
        self.timed(operation, async {
            let removed = self
                .client
                .execute(&self.statements.delete_context, &[&context_id])
                .await
                .map_err(|e| pg_error(operation, None, &e))?;
            let removed = usize::try_from(removed).unwrap_or_default();
            debug!(context_id = %context_id, count = removed, "Deleted context tasks");
            Ok(removed)
        })
        .await
    }

    async fn cleanup_expired_tasks(&self) -> TaskStoreResult<usize> {
        let operation = StoreOperation::CleanupExpired;
        self.timed(operation, async {
            let removed = self
                .client
                .execute(&self.statements.cleanup_expired, &[])
                .await
                .map_err(|e| pg_error(operation, None, &e))?;
            let count = usize::try_from(removed).unwrap_or_default();
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
            let row = self
                .client
                .query_one(&self.statements.count_expired, &[])
                .await
                .map_err(|e| pg_error(operation, None, &e))?;
            let count: i64 = column(operation, &row, 0)?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
        .await
    }

    async fn get_task_stats(&self, context_id: Option<&str>) -> TaskStoreResult<TaskStats> {
        let operation = StoreOperation::Stats;
        let (by_state, bounds) = build_stats_queries(&self.table, context_id);
        self.timed(operation, async {
            let rows = self
                .client
                .query(&by_state.sql, &by_state.params())
                .await
                .map_err(|e| pg_error(operation, None, &e))?;
            let mut stats = TaskStats::default();
            for row in &rows {
                let state: String = column(operation, row, 0)?;
                let count: i64 = column(operation, row, 1)?;
                let count = u64::try_from(count).unwrap_or_default();
                match state.parse::<TaskState>() {
                    Ok(state) => {
                        stats.total_tasks += count;
                        *stats.tasks_by_state.entry(state).or_insert(0) += count;
                    }
                    Err(_) => warn!(state = %state, count, "Skipping rows with unknown task state"),
                }
            }

            let row = self
                .client
                .query_one(&bounds.sql, &bounds.params())
                .await
                .map_err(|e| pg_error(operation, None, &e))?;
            let oldest: Option<DateTime<Utc>> = column(operation, &row, 0)?;
            let newest: Option<DateTime<Utc>> = column(operation, &row, 1)?;
            stats.oldest_task = oldest;
            stats.newest_task = newest;
            Ok(stats)
        })
        .await
    }

    async fn health_check(&self) -> HealthReport {
        HealthReport::probe(self.settings().operation_timeout(), async {
            self.client
                .simple_query("SELECT 1")
                .await
                .map(|_| ())
                .map_err(|e| sanitize_error(&e))
        })
        .await
    }

    async fn close(&self) -> TaskStoreResult<()> {
        match self.connection.lock().await.take() {
            Some(driver) => {
                driver.abort();
                info!(table = %self.table, "Closed PostgreSQL connection");
            }
            None => debug!(table = %self.table, "No provider-owned PostgreSQL connection to close"),
        }
        Ok(())
    }
}

impl Drop for PostgresTaskProvider {
    fn drop(&mut self) {
        if let Some(driver) = self.connection.get_mut().take() {
            driver.abort();
        }
    }
}

fn validate(config: &PostgresStorageConfig) -> TaskStoreResult<()> {
    config.validate().map_err(|e| invalid_config(e.to_string()))
}

fn invalid_config(details: impl Into<String>) -> TaskStoreError {
    TaskStoreError::storage(
        StoreOperation::Connect,
        BACKEND,
        StorageErrorKind::InvalidConfig {
            details: details.into(),
        },
    )
}

fn bigint(value: impl TryInto<i64>) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

fn metadata_text(operation: StoreOperation, record: &StoredRecord) -> TaskStoreResult<Option<String>> {
    record
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| {
            TaskStoreError::for_task(
                operation,
                BACKEND,
                &record.task_id,
                StorageErrorKind::Serialization {
                    details: e.to_string(),
                },
            )
        })
}

fn record_from_row(operation: StoreOperation, row: &Row) -> TaskStoreResult<StoredRecord> {
    let task_id: String = column(operation, row, "task_id")?;
    let state_raw: String = column(operation, row, "state")?;
    let state = state_raw.parse::<TaskState>().map_err(|_| {
        TaskStoreError::for_task(
            operation,
            BACKEND,
            &task_id,
            StorageErrorKind::Integrity(IntegrityViolation::UnknownState { value: state_raw.clone() }),
        )
    })?;
    let metadata: Option<String> = column(operation, row, "metadata")?;
    let metadata = metadata
        .map(|raw| serde_json::from_str::<TaskMetadata>(&raw))
        .transpose()
        .map_err(|e| {
            TaskStoreError::for_task(
                operation,
                BACKEND,
                &task_id,
                StorageErrorKind::Serialization {
                    details: e.to_string(),
                },
            )
        })?;
    let version: i64 = column(operation, row, "version")?;

    Ok(StoredRecord {
        context_id: column(operation, row, "context_id")?,
        state,
        task_data: column(operation, row, "task_data")?,
        status_message: column(operation, row, "status_message")?,
        status_timestamp: column(operation, row, "status_timestamp")?,
        created_at: column(operation, row, "created_at")?,
        updated_at: column(operation, row, "updated_at")?,
        expires_at: column(operation, row, "expires_at")?,
        metadata,
        version: u64::try_from(version).unwrap_or_default(),
        task_id,
    })
}

fn column<'a, I, T>(operation: StoreOperation, row: &'a Row, index: I) -> TaskStoreResult<T>
where
    I: RowIndex + fmt::Display,
    T: FromSql<'a>,
{
    let label = index.to_string();
    row.try_get(index).map_err(|e| {
        TaskStoreError::storage(
            operation,
            BACKEND,
            StorageErrorKind::Backend {
                details: format!("column {}: {}", label, e),
            },
        )
    })
}

fn pg_error(operation: StoreOperation, task_id: Option<&str>, error: &PgError) -> TaskStoreError {
    let details = sanitize_error(error);
    let kind = if error.as_db_error().is_none() && details == "Connection failed" {
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

/// Map PostgreSQL errors to messages that never echo row data or credentials
pub fn sanitize_error(error: &PgError) -> String {
    if let Some(db) = error.as_db_error() {
        format!("Database operation failed ({})", db.code().code())
    } else if error.is_closed() || error.to_string().contains("connection") {
        "Connection failed".to_string()
    } else if error.to_string().contains("authentication") {
        "Authentication failed".to_string()
    } else if error.to_string().contains("timeout") {
        "Operation timed out".to_string()
    } else {
        "Database error occurred".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_target_the_configured_table() {
        let statements = Statements::new("agent_tasks");
        assert!(statements.select_one.contains("FROM agent_tasks WHERE task_id = $1"));
        assert!(statements.delete_context.starts_with("DELETE FROM agent_tasks"));
        assert!(statements.cleanup_expired.contains("expires_at <= NOW()"));
        assert!(statements.store.starts_with("SELECT agent_tasks_store("));
    }

    #[test]
    fn unsafe_table_names_are_rejected_before_connecting() {
        let config = PostgresStorageConfig::new("postgres://localhost/db")
            .with_table_name("tasks; DROP TABLE users");
        let err = validate(&config).unwrap_err();
        assert!(matches!(
            err.kind(),
            Some(StorageErrorKind::InvalidConfig { .. })
        ));
    }

    #[test]
    fn oversized_limits_saturate_as_bigint() {
        assert_eq!(bigint(7_u64), 7);
        assert_eq!(bigint(u64::MAX), i64::MAX);
        assert_eq!(bigint(usize::MAX), i64::MAX);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connect_error() {
        let config = PostgresStorageConfig::new("host=127.0.0.1 port=1 user=nobody dbname=none connect_timeout=1");
        let err = match PostgresTaskProvider::connect(config).await {
            Ok(_) => panic!("connected to a closed port"),
            Err(e) => e,
        };
        assert_eq!(err.backend(), StorageBackend::Postgres);
        assert!(err.kind().is_some());
    }
}
