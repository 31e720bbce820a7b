//! # Tasklane Storage Backends
//!
//! Networked implementations of [`TaskStorageProvider`]:
//!
//! - **[RedisTaskProvider]**: hashes, context sets and counters with
//!   Lua-scripted atomic writes and native key expiry (requires `redis` feature)
//! - **[PostgresTaskProvider]**: one indexed table with version-checked
//!   updates (requires `postgres` feature)
//!
//! The in-process provider lives in `tasklane-core`. [`connect_provider`]
//! builds any of the three from a [`StorageConfig`].
//!
//! ## Feature Flags
//!
//! - `redis`: Redis backend
//! - `postgres`: PostgreSQL backend
//! - `redis-tests` / `postgres-tests`: integration tests against live servers
//!
//! [`TaskStorageProvider`]: tasklane_core::TaskStorageProvider
//! [`StorageConfig`]: tasklane_core::StorageConfig

pub mod factory;

#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "redis")]
pub use self::redis::RedisTaskProvider;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub use self::postgres::PostgresTaskProvider;

pub use factory::connect_provider;

/// Attempts a version-checked update makes before giving up with
/// `VersionConflict`
pub const MAX_CAS_RETRIES: u32 = 5;
