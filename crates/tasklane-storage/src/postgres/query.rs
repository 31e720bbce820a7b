//! SQL text for the task table.
//!
//! Table names are validated identifiers, so they are interpolated; every
//! value travels as a bind parameter.

use chrono::{DateTime, Utc};
use tasklane_core::TaskQuery;
use tokio_postgres::types::ToSql;

/// Columns selected for a stored record, JSONB read back as text
pub const RECORD_COLUMNS: &str = "task_id, context_id, state, task_data::text AS task_data, \
     status_message::text AS status_message, status_timestamp, created_at, updated_at, \
     expires_at, metadata::text AS metadata, version";

/// Predicate excluding expired records
pub const LIVE: &str = "(expires_at IS NULL OR expires_at > NOW())";

/// Ordering shared with every other backend
pub const RESULT_ORDER: &str = "status_timestamp DESC NULLS LAST, created_at DESC, task_id ASC";

/// An owned bind parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Timestamp(DateTime<Utc>),
    BigInt(i64),
}

impl SqlParam {
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlParam::Text(v) => v,
            SqlParam::Timestamp(v) => v,
            SqlParam::BigInt(v) => v,
        }
    }
}

/// A statement plus its parameters in `$n` order
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl BuiltQuery {
    pub fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params.iter().map(SqlParam::as_sql).collect()
    }
}

#[derive(Default)]
struct WhereClause {
    conditions: Vec<String>,
    params: Vec<SqlParam>,
}

impl WhereClause {
    fn live() -> Self {
        Self {
            conditions: vec![LIVE.to_string()],
            params: Vec::new(),
        }
    }

    fn bind(&mut self, param: SqlParam) -> usize {
        self.params.push(param);
        self.params.len()
    }

    fn push(&mut self, column_expr: &str, op: &str, param: SqlParam) {
        let n = self.bind(param);
        self.conditions.push(format!("{column_expr} {op} ${n}"));
    }

    fn render(&self) -> String {
        self.conditions.join(" AND ")
    }
}

/// One conjunctive `SELECT` for `query` over live records
pub fn build_find_query(table: &str, query: &TaskQuery) -> BuiltQuery {
    let mut clause = WhereClause::live();
    if let Some(task_id) = &query.task_id {
        clause.push("task_id", "=", SqlParam::Text(task_id.clone()));
    }
    if let Some(context_id) = &query.context_id {
        clause.push("context_id", "=", SqlParam::Text(context_id.clone()));
    }
    if let Some(state) = query.state {
        clause.push("state", "=", SqlParam::Text(state.as_str().to_string()));
    }
    if let Some(since) = query.since {
        clause.push(
            "COALESCE(status_timestamp, updated_at)",
            ">=",
            SqlParam::Timestamp(since),
        );
    }
    if let Some(until) = query.until {
        clause.push(
            "COALESCE(status_timestamp, updated_at)",
            "<=",
            SqlParam::Timestamp(until),
        );
    }

    let mut sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {table} WHERE {} ORDER BY {RESULT_ORDER}",
        clause.render()
    );
    if let Some(limit) = query.limit {
        let n = clause.bind(SqlParam::BigInt(clamp(limit)));
        sql.push_str(&format!(" LIMIT ${n}"));
    }
    if let Some(offset) = query.offset.filter(|o| *o > 0) {
        let n = clause.bind(SqlParam::BigInt(clamp(offset)));
        sql.push_str(&format!(" OFFSET ${n}"));
    }

    BuiltQuery {
        sql,
        params: clause.params,
    }
}

/// `GROUP BY state` counts and creation-time bounds over live records
pub fn build_stats_queries(table: &str, context_id: Option<&str>) -> (BuiltQuery, BuiltQuery) {
    let mut clause = WhereClause::live();
    if let Some(context_id) = context_id {
        clause.push("context_id", "=", SqlParam::Text(context_id.to_string()));
    }
    let filter = clause.render();
    let by_state = BuiltQuery {
        sql: format!("SELECT state, COUNT(*) FROM {table} WHERE {filter} GROUP BY state"),
        params: clause.params.clone(),
    };
    let bounds = BuiltQuery {
        sql: format!("SELECT MIN(created_at), MAX(created_at) FROM {table} WHERE {filter}"),
        params: clause.params,
    };
    (by_state, bounds)
}

/// Call of the store function created by the schema.
///
/// Returns 1 when stored, 0 when a live record holds the id, -1 when the
/// table is full and -2 when the context is full.
///
/// Params: 1 task_id, 2 context_id, 3 state, 4 task_data, 5 status_message,
/// 6 status_timestamp, 7 created_at, 8 updated_at, 9 expires_at,
/// 10 metadata, 11 max_tasks, 12 max_tasks_per_context.
pub fn store_sql(table: &str) -> String {
    format!(
        "SELECT {table}_store($1::text, $2::text, $3::text, $4::text::jsonb, $5::text::jsonb, \
         $6::timestamptz, $7::timestamptz, $8::timestamptz, $9::timestamptz, $10::text::jsonb, \
         $11::bigint, $12::bigint)"
    )
}

/// Store function counting capacity and inserting under advisory locks.
///
/// The locks are transaction scoped, and every statement in the body reads
/// a fresh snapshot, so a concurrent store that held the lock has committed
/// before the counts are taken. The insert may only replace an expired row.
pub fn store_function_sql(table: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {table}_store(
    p_task_id TEXT, p_context_id TEXT, p_state TEXT, p_task_data JSONB,
    p_status_message JSONB, p_status_timestamp TIMESTAMPTZ, p_created_at TIMESTAMPTZ,
    p_updated_at TIMESTAMPTZ, p_expires_at TIMESTAMPTZ, p_metadata JSONB,
    p_max_tasks BIGINT, p_max_per_context BIGINT
) RETURNS INTEGER
LANGUAGE plpgsql VOLATILE AS $store$
DECLARE
    affected INTEGER;
BEGIN
    IF p_max_tasks IS NOT NULL THEN
        PERFORM pg_advisory_xact_lock(hashtext('{table}'));
    END IF;
    IF p_max_per_context IS NOT NULL THEN
        PERFORM pg_advisory_xact_lock(hashtext('{table}'), hashtext(p_context_id));
    END IF;

    IF EXISTS (SELECT 1 FROM {table} WHERE task_id = p_task_id AND {LIVE}) THEN
        RETURN 0;
    END IF;
    IF p_max_tasks IS NOT NULL
        AND (SELECT COUNT(*) FROM {table} WHERE task_id <> p_task_id) >= p_max_tasks THEN
        RETURN -1;
    END IF;
    IF p_max_per_context IS NOT NULL
        AND (SELECT COUNT(*) FROM {table}
             WHERE context_id = p_context_id AND task_id <> p_task_id) >= p_max_per_context THEN
        RETURN -2;
    END IF;

    INSERT INTO {table} (task_id, context_id, state, task_data, status_message,
        status_timestamp, created_at, updated_at, expires_at, metadata, version)
    VALUES (p_task_id, p_context_id, p_state, p_task_data, p_status_message,
        p_status_timestamp, p_created_at, p_updated_at, p_expires_at, p_metadata, 1)
    ON CONFLICT (task_id) DO UPDATE SET
        context_id = EXCLUDED.context_id,
        state = EXCLUDED.state,
        task_data = EXCLUDED.task_data,
        status_message = EXCLUDED.status_message,
        status_timestamp = EXCLUDED.status_timestamp,
        created_at = EXCLUDED.created_at,
        updated_at = EXCLUDED.updated_at,
        expires_at = EXCLUDED.expires_at,
        metadata = EXCLUDED.metadata,
        version = 1
    WHERE {table}.expires_at IS NOT NULL AND {table}.expires_at <= NOW();
    GET DIAGNOSTICS affected = ROW_COUNT;
    IF affected = 0 THEN
        RETURN 0;
    END IF;
    RETURN 1;
END
$store$;"#
    )
}

/// Version-checked update of a live row.
///
/// Params: 1 task_id, 2 state, 3 task_data, 4 status_message,
/// 5 status_timestamp, 6 updated_at, 7 expires_at, 8 metadata,
/// 9 expected version.
pub fn update_sql(table: &str) -> String {
    format!(
        r#"UPDATE {table} SET
    state = $2,
    task_data = $3::text::jsonb,
    status_message = $4::text::jsonb,
    status_timestamp = $5,
    updated_at = $6,
    expires_at = $7,
    metadata = $8::text::jsonb,
    version = version + 1
WHERE task_id = $1 AND version = $9 AND {LIVE}"#
    )
}

fn clamp(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
