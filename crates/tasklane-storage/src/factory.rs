//! Provider construction from a [`StorageConfig`].

use std::sync::Arc;

use tasklane_core::{
    InMemoryTaskProvider, StorageBackend, StorageConfig, StorageErrorKind, StoreOperation,
    TaskStorageProvider, TaskStoreError, TaskStoreResult,
};
use tracing::info;

/// Build the provider `config` names.
///
/// Networked backends connect (and, for PostgreSQL, migrate) before this
/// returns. Asking for a backend whose cargo feature is disabled is an
/// `InvalidConfig` error rather than a silent fallback.
pub async fn connect_provider(
    config: &StorageConfig,
) -> TaskStoreResult<Arc<dyn TaskStorageProvider>> {
    let backend = backend_of(config);
    config.validate().map_err(|e| invalid_config(backend, e.to_string()))?;

    let provider: Arc<dyn TaskStorageProvider> = match config {
        StorageConfig::Memory(memory) => {
            Arc::new(InMemoryTaskProvider::new(memory.settings.clone()))
        }
        #[cfg(feature = "redis")]
        StorageConfig::Redis(redis) => {
            Arc::new(crate::RedisTaskProvider::connect(redis.clone()).await?)
        }
        #[cfg(not(feature = "redis"))]
        StorageConfig::Redis(_) => return Err(feature_disabled(backend, "redis")),
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres(postgres) => {
            Arc::new(crate::PostgresTaskProvider::connect(postgres.clone()).await?)
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres(_) => return Err(feature_disabled(backend, "postgres")),
    };

    info!(backend = %backend, "Task storage provider ready");
    Ok(provider)
}

fn backend_of(config: &StorageConfig) -> StorageBackend {
    match config {
        StorageConfig::Memory(_) => StorageBackend::InMemory,
        StorageConfig::Redis(_) => StorageBackend::Redis,
        StorageConfig::Postgres(_) => StorageBackend::Postgres,
    }
}

fn invalid_config(backend: StorageBackend, details: String) -> TaskStoreError {
    TaskStoreError::storage(
        StoreOperation::Connect,
        backend,
        StorageErrorKind::InvalidConfig { details },
    )
}

#[allow(dead_code)]
fn feature_disabled(backend: StorageBackend, feature: &str) -> TaskStoreError {
    invalid_config(
        backend,
        format!(
            "{} backend requested but tasklane-storage was built without the `{}` feature",
            backend, feature
        ),
    )
}
