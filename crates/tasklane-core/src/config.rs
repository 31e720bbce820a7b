//! Task store configuration.
//!
//! Configuration is discriminated by backend `type` (`memory`, `redis`,
//! `postgres`) and shares one block of [`StoreSettings`]. It can be built
//! in code, deserialized, or loaded from the environment.
//!
//! # Environment Variables
//!
//! - `TASKLANE_STORE_TYPE` - `memory`, `redis` or `postgres` (default: memory)
//! - `TASKLANE_MAX_TASKS` - Store-wide task limit, `0` for unlimited (default: 10000)
//! - `TASKLANE_MAX_TASKS_PER_CONTEXT` - Per-context limit, `0` for unlimited (default: 1000)
//! - `TASKLANE_KEY_PREFIX` - Redis key prefix (default: "a2a:")
//! - `TASKLANE_DEFAULT_TTL` - Default record lifetime, e.g. `24h` (default: none)
//! - `TASKLANE_CLEANUP_INTERVAL` - Cleanup cadence, e.g. `5m` (default: 5m)
//! - `TASKLANE_OPERATION_TIMEOUT` - Per-call backend timeout (default: 5s)
//! - `TASKLANE_ENABLE_HISTORY` - Persist message history (default: true)
//! - `TASKLANE_ENABLE_ARTIFACTS` - Persist artifacts (default: true)
//! - `TASKLANE_REDIS_HOST` / `TASKLANE_REDIS_PORT` / `TASKLANE_REDIS_DB` /
//!   `TASKLANE_REDIS_PASSWORD` - Redis connection (default: 127.0.0.1:6379, db 0)
//! - `TASKLANE_POSTGRES_URL` - PostgreSQL connection string (required for postgres)
//! - `TASKLANE_POSTGRES_TABLE` - Task table name (default: "a2a_tasks")

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Missing required environment variable '{key}'")]
    MissingEnvVar { key: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Settings shared by every backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Store-wide task limit
    pub max_tasks: Option<usize>,
    /// Per-context task limit
    pub max_tasks_per_context: Option<usize>,
    /// Prefix for backend keys
    pub key_prefix: String,
    /// Lifetime given to tasks stored without an explicit expiry
    pub default_ttl_secs: Option<u64>,
    /// Cadence for a cleanup service driving this store
    pub cleanup_interval_secs: u64,
    /// Upper bound for any single backend call
    pub operation_timeout_ms: u64,
    pub enable_history: bool,
    pub enable_artifacts: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_tasks: Some(10_000),
            max_tasks_per_context: Some(1_000),
            key_prefix: "a2a:".to_string(),
            default_ttl_secs: None,
            cleanup_interval_secs: 300,
            operation_timeout_ms: 5_000,
            enable_history: true,
            enable_artifacts: true,
        }
    }
}

impl StoreSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn with_max_tasks(mut self, limit: Option<usize>) -> Self {
        self.max_tasks = limit;
        self
    }

    pub fn with_max_tasks_per_context(mut self, limit: Option<usize>) -> Self {
        self.max_tasks_per_context = limit;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl_secs = ttl.map(|ttl| ttl.as_secs());
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_secs = interval.as_secs();
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_history(mut self, enabled: bool) -> Self {
        self.enable_history = enabled;
        self
    }

    pub fn with_artifacts(mut self, enabled: bool) -> Self {
        self.enable_artifacts = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tasks == Some(0) {
            return Err(ConfigError::ValidationError(
                "max_tasks must be greater than 0 when set".to_string(),
            ));
        }
        if self.max_tasks_per_context == Some(0) {
            return Err(ConfigError::ValidationError(
                "max_tasks_per_context must be greater than 0 when set".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "operation_timeout must be greater than 0".to_string(),
            ));
        }
        if self.key_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::ValidationError(
                "key_prefix cannot contain whitespace".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-process backend configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStorageConfig {
    #[serde(flatten)]
    pub settings: StoreSettings,
}

/// Redis backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisStorageConfig {
    #[serde(flatten)]
    pub settings: StoreSettings,
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            settings: StoreSettings::default(),
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
        }
    }
}

impl RedisStorageConfig {
    /// Connection URL for the configured host, port and database
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings.validate()?;
        if self.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "redis host cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "redis port cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// PostgreSQL backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresStorageConfig {
    #[serde(flatten)]
    pub settings: StoreSettings,
    #[serde(default)]
    pub connection_string: String,
    #[serde(default = "default_table_name")]
    pub table_name: String,
}

fn default_table_name() -> String {
    "a2a_tasks".to_string()
}

impl Default for PostgresStorageConfig {
    fn default() -> Self {
        Self {
            settings: StoreSettings::default(),
            connection_string: String::new(),
            table_name: default_table_name(),
        }
    }
}

impl PostgresStorageConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Validate settings and the table name.
    ///
    /// The table name is interpolated into SQL, so only ASCII letters,
    /// digits and underscores are allowed and it must not start with a digit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings.validate()?;
        validate_identifier(&self.table_name)
    }
}

pub(crate) fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.len() > 63 {
        return Err(ConfigError::ValidationError(format!(
            "table name must be 1-63 characters, got {}",
            name.len()
        )));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(ConfigError::ValidationError(
            "table name cannot start with a digit".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::ValidationError(format!(
            "table name '{}' may only contain letters, digits and underscores",
            name
        )));
    }
    Ok(())
}

/// Backend-discriminated store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory(MemoryStorageConfig),
    Redis(RedisStorageConfig),
    #[serde(alias = "relational")]
    Postgres(PostgresStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(MemoryStorageConfig::default())
    }
}

impl StorageConfig {
    pub fn settings(&self) -> &StoreSettings {
        match self {
            StorageConfig::Memory(c) => &c.settings,
            StorageConfig::Redis(c) => &c.settings,
            StorageConfig::Postgres(c) => &c.settings,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            StorageConfig::Memory(c) => c.settings.validate(),
            StorageConfig::Redis(c) => c.validate(),
            StorageConfig::Postgres(c) => c.validate(),
        }
    }

    /// Load configuration from `TASKLANE_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut settings = StoreSettings::default();

        if let Some(limit) = env.usize("TASKLANE_MAX_TASKS")? {
            settings.max_tasks = (limit > 0).then_some(limit);
        }
        if let Some(limit) = env.usize("TASKLANE_MAX_TASKS_PER_CONTEXT")? {
            settings.max_tasks_per_context = (limit > 0).then_some(limit);
        }
        if let Some(prefix) = env.string("TASKLANE_KEY_PREFIX") {
            settings.key_prefix = prefix;
        }
        if let Some(ttl) = env.duration("TASKLANE_DEFAULT_TTL")? {
            settings.default_ttl_secs = Some(ttl.as_secs());
        }
        if let Some(interval) = env.duration("TASKLANE_CLEANUP_INTERVAL")? {
            settings.cleanup_interval_secs = interval.as_secs();
        }
        if let Some(timeout) = env.duration("TASKLANE_OPERATION_TIMEOUT")? {
            settings.operation_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(enabled) = env.bool("TASKLANE_ENABLE_HISTORY")? {
            settings.enable_history = enabled;
        }
        if let Some(enabled) = env.bool("TASKLANE_ENABLE_ARTIFACTS")? {
            settings.enable_artifacts = enabled;
        }

        let store_type = env
            .string("TASKLANE_STORE_TYPE")
            .unwrap_or_else(|| "memory".to_string());
        let config = match store_type.to_lowercase().as_str() {
            "memory" | "in-memory" => StorageConfig::Memory(MemoryStorageConfig { settings }),
            "redis" => {
                let mut redis = RedisStorageConfig {
                    settings,
                    ..RedisStorageConfig::default()
                };
                if let Some(host) = env.string("TASKLANE_REDIS_HOST") {
                    redis.host = host;
                }
                if let Some(port) = env.parse::<u16>("TASKLANE_REDIS_PORT")? {
                    redis.port = port;
                }
                if let Some(db) = env.parse::<u32>("TASKLANE_REDIS_DB")? {
                    redis.db = db;
                }
                redis.password = env.string("TASKLANE_REDIS_PASSWORD");
                StorageConfig::Redis(redis)
            }
            "postgres" | "relational" => {
                let connection_string =
                    env.string("TASKLANE_POSTGRES_URL")
                        .ok_or_else(|| ConfigError::MissingEnvVar {
                            key: "TASKLANE_POSTGRES_URL".to_string(),
                        })?;
                let mut postgres = PostgresStorageConfig {
                    settings,
                    ..PostgresStorageConfig::new(connection_string)
                };
                if let Some(table) = env.string("TASKLANE_POSTGRES_TABLE") {
                    postgres.table_name = table;
                }
                StorageConfig::Postgres(postgres)
            }
            other => {
                return Err(ConfigError::InvalidEnvVar {
                    key: "TASKLANE_STORE_TYPE".to_string(),
                    message: format!("unknown store type '{other}', expected memory/redis/postgres"),
                });
            }
        };

        config.validate()?;
        Ok(config)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(val) => val
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidEnvVar {
                    key: key.to_string(),
                    message: format!("invalid value '{val}': {e}"),
                }),
            None => Ok(None),
        }
    }

    fn usize(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        self.parse::<usize>(key)
    }

    fn bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.string(key) {
            Some(val) => match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Some(true)),
                "false" | "0" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidEnvVar {
                    key: key.to_string(),
                    message: format!(
                        "invalid boolean value '{val}', expected true/false/1/0/yes/no/on/off"
                    ),
                }),
            },
            None => Ok(None),
        }
    }

    fn duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        match self.string(key) {
            Some(val) => humantime::parse_duration(val.trim())
                .map(Some)
                .map_err(|e| ConfigError::InvalidEnvVar {
                    key: key.to_string(),
                    message: format!("invalid duration '{val}': {e}"),
                }),
            None => Ok(None),
        }
    }
}
