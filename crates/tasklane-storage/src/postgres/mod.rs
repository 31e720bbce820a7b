//! PostgreSQL task provider.
//!
//! - `schema`: versioned migrations for the task table
//! - `query`: SQL text and bind parameters
//! - `provider`: [`PostgresTaskProvider`] over a `tokio-postgres` client

pub mod provider;
pub mod query;
pub mod schema;

pub use provider::{PostgresTaskProvider, sanitize_error};
pub use schema::{TaskMigration, TaskSchema};
