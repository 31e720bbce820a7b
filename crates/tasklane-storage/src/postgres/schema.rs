//! Versioned, idempotent schema for the task table.

use tokio_postgres::Client;

use super::query::store_function_sql;

/// One schema step for the task table
#[derive(Debug, Clone)]
pub struct TaskMigration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: String,
}

/// Migrations for a task table, applied in version order
pub struct TaskSchema {
    table: String,
    migrations: Vec<TaskMigration>,
}

impl TaskSchema {
    /// `table` must already be a validated identifier
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        let migrations = Self::default_migrations(&table);
        Self { table, migrations }
    }

    pub fn migrations(&self) -> &[TaskMigration] {
        &self.migrations
    }

    fn migrations_table(&self) -> String {
        format!("{}_schema_migrations", self.table)
    }

    fn default_migrations(table: &str) -> Vec<TaskMigration> {
        vec![
            TaskMigration {
                version: 1,
                description: "Task table with context, state and creation indices",
                up_sql: format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        task_id TEXT PRIMARY KEY,
                        context_id TEXT NOT NULL,
                        state TEXT NOT NULL,
                        task_data JSONB NOT NULL,
                        status_message JSONB,
                        status_timestamp TIMESTAMPTZ,
                        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                        expires_at TIMESTAMPTZ,
                        metadata JSONB
                    );

                    CREATE INDEX IF NOT EXISTS idx_{table}_context_id ON {table}(context_id);
                    CREATE INDEX IF NOT EXISTS idx_{table}_state ON {table}(state);
                    CREATE INDEX IF NOT EXISTS idx_{table}_created_at ON {table}(created_at);
                    CREATE INDEX IF NOT EXISTS idx_{table}_expires_at ON {table}(expires_at)
                        WHERE expires_at IS NOT NULL;
                    "#
                ),
            },
            TaskMigration {
                version: 2,
                description: "Row version for compare-and-swap updates",
                up_sql: format!(
                    "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS version BIGINT NOT NULL DEFAULT 1;"
                ),
            },
            TaskMigration {
                version: 3,
                description: "Store function with capacity checks under advisory locks",
                up_sql: store_function_sql(table),
            },
        ]
    }

    /// Bring the table up to the latest version.
    ///
    /// Every statement is idempotent, so concurrent first starts are safe.
    /// Returns the versions applied by this call.
    pub async fn migrate(&self, client: &Client) -> Result<Vec<i32>, tokio_postgres::Error> {
        let migrations_table = self.migrations_table();
        client
            .batch_execute(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {migrations_table} (
                    version INTEGER PRIMARY KEY,
                    description TEXT NOT NULL,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );
                "#
            ))
            .await?;

        let current: i32 = client
            .query_one(
                &format!("SELECT COALESCE(MAX(version), 0) FROM {migrations_table}"),
                &[],
            )
            .await?
            .try_get(0)?;

        let mut applied = Vec::new();
        for migration in self.migrations.iter().filter(|m| m.version > current) {
            client.batch_execute(&migration.up_sql).await?;
            client
                .execute(
                    &format!(
                        "INSERT INTO {migrations_table} (version, description) VALUES ($1, $2) \
                         ON CONFLICT (version) DO NOTHING"
                    ),
                    &[&migration.version, &migration.description],
                )
                .await?;
            applied.push(migration.version);
        }
        Ok(applied)
    }
}
