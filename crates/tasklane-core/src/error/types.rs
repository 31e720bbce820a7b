//! Strongly-typed error building blocks.
//!
//! Backends, operations and failure categories are enums rather than
//! strings so callers can match on them and logs stay uniform.

use std::fmt;

/// Storage backend a provider is running on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageBackend {
    InMemory,
    Redis,
    Postgres,
}

impl StorageBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageBackend::InMemory => "in-memory",
            StorageBackend::Redis => "redis",
            StorageBackend::Postgres => "postgres",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task store operation that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Store,
    Get,
    Update,
    UpdateStatus,
    Find,
    Delete,
    DeleteByContext,
    CleanupExpired,
    Stats,
    Connect,
    Close,
    Serialize,
    Deserialize,
    Sanitize,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOperation::Store => "store",
            StoreOperation::Get => "get",
            StoreOperation::Update => "update",
            StoreOperation::UpdateStatus => "update-status",
            StoreOperation::Find => "find",
            StoreOperation::Delete => "delete",
            StoreOperation::DeleteByContext => "delete-by-context",
            StoreOperation::CleanupExpired => "cleanup-expired",
            StoreOperation::Stats => "stats",
            StoreOperation::Connect => "connect",
            StoreOperation::Close => "close",
            StoreOperation::Serialize => "serialize",
            StoreOperation::Deserialize => "deserialize",
            StoreOperation::Sanitize => "sanitize",
        };
        f.write_str(name)
    }
}

/// Structural invariant a task or stored payload failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    /// Stored payload is not a JSON object
    NotAnObject,
    MissingId,
    MissingContextId,
    /// `kind` is absent or not `"task"`
    InvalidKind { found: Option<String> },
    StatusNotAnObject,
    MissingState,
    UnknownState { value: String },
    HistoryNotArray,
    ArtifactsNotArray,
    /// Flattened record field disagrees with the embedded task
    ProjectionMismatch { field: &'static str },
    /// An update tried to move a task to another context
    ContextChanged { stored: String, requested: String },
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityViolation::NotAnObject => write!(f, "task payload is not an object"),
            IntegrityViolation::MissingId => write!(f, "task id is missing or empty"),
            IntegrityViolation::MissingContextId => {
                write!(f, "task contextId is missing or empty")
            }
            IntegrityViolation::InvalidKind { found: Some(kind) } => {
                write!(f, "task kind must be \"task\", found \"{}\"", kind)
            }
            IntegrityViolation::InvalidKind { found: None } => {
                write!(f, "task kind is missing")
            }
            IntegrityViolation::StatusNotAnObject => write!(f, "task status is not an object"),
            IntegrityViolation::MissingState => write!(f, "task status.state is missing"),
            IntegrityViolation::UnknownState { value } => {
                write!(f, "task status.state '{}' is not a known state", value)
            }
            IntegrityViolation::HistoryNotArray => write!(f, "task history is not an array"),
            IntegrityViolation::ArtifactsNotArray => {
                write!(f, "task artifacts is not an array")
            }
            IntegrityViolation::ProjectionMismatch { field } => {
                write!(f, "stored {} does not match the embedded task", field)
            }
            IntegrityViolation::ContextChanged { stored, requested } => write!(
                f,
                "task contextId cannot change from '{}' to '{}'",
                stored, requested
            ),
        }
    }
}

/// Categories of storage failure
#[derive(Debug, Clone, PartialEq)]
pub enum StorageErrorKind {
    /// Payload could not be encoded or decoded
    Serialization { details: String },

    /// Payload decoded but violates a structural invariant
    Integrity(IntegrityViolation),

    /// A live task with the same id is already stored
    AlreadyExists,

    /// Store-wide task limit reached
    CapacityExceeded { limit: usize },

    /// Per-context task limit reached
    ContextCapacityExceeded { context_id: String, limit: usize },

    /// Concurrent writer changed the record first
    VersionConflict { expected: u64 },

    /// Backend call exceeded the operation timeout
    Timeout { after_ms: u64 },

    /// Connection to the backend failed
    Connection { details: String },

    /// Backend rejected or failed the command
    Backend { details: String },

    /// Provider configuration is unusable
    InvalidConfig { details: String },
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::Serialization { details } => {
                write!(f, "serialization error: {}", details)
            }
            StorageErrorKind::Integrity(violation) => {
                write!(f, "integrity violation: {}", violation)
            }
            StorageErrorKind::AlreadyExists => write!(f, "task already exists"),
            StorageErrorKind::CapacityExceeded { limit } => {
                write!(f, "task capacity exhausted (limit: {})", limit)
            }
            StorageErrorKind::ContextCapacityExceeded { context_id, limit } => write!(
                f,
                "context '{}' task capacity exhausted (limit: {})",
                context_id, limit
            ),
            StorageErrorKind::VersionConflict { expected } => write!(
                f,
                "record changed concurrently (expected version {})",
                expected
            ),
            StorageErrorKind::Timeout { after_ms } => {
                write!(f, "operation timed out after {}ms", after_ms)
            }
            StorageErrorKind::Connection { details } => write!(f, "connection error: {}", details),
            StorageErrorKind::Backend { details } => write!(f, "backend error: {}", details),
            StorageErrorKind::InvalidConfig { details } => {
                write!(f, "invalid configuration: {}", details)
            }
        }
    }
}
