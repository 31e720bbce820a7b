//! Policy-driven background reaper.
//!
//! The service only talks to the [`TaskStorageProvider`] contract, so the
//! same policy runs unchanged on every backend. One cycle:
//!
//! 1. sweep expired records,
//! 2. trim completed tasks beyond `max_completed_tasks`,
//! 3. trim failed tasks beyond `max_failed_tasks`,
//! 4. delete terminal tasks older than `max_age` unless their state is retained.
//!
//! A failing step is recorded in the report and the cycle carries on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tasklane_a2a::{Task, TaskState};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::provider::TaskStorageProvider;
use crate::query::TaskQuery;
use crate::serialization::parse_timestamp;

/// Retention policy for the cleanup service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Time between cycles
    pub interval_secs: u64,
    /// Terminal tasks older than this are deleted
    pub max_age_secs: u64,
    pub max_completed_tasks: usize,
    pub max_failed_tasks: usize,
    /// Terminal states exempt from age-based deletion
    pub retain_states: Vec<TaskState>,
    /// Upper bound on deletions per step and cycle
    pub batch_size: usize,
    /// Report what would be deleted without deleting
    pub dry_run: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            max_age_secs: 7 * 24 * 3600,
            max_completed_tasks: 1000,
            max_failed_tasks: 500,
            retain_states: Vec::new(),
            batch_size: 100,
            dry_run: false,
        }
    }
}

impl CleanupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_secs = interval.as_secs();
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = max_age.as_secs();
        self
    }

    pub fn with_max_completed_tasks(mut self, limit: usize) -> Self {
        self.max_completed_tasks = limit;
        self
    }

    pub fn with_max_failed_tasks(mut self, limit: usize) -> Self {
        self.max_failed_tasks = limit;
        self
    }

    pub fn with_retain_states(mut self, states: Vec<TaskState>) -> Self {
        self.retain_states = states;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cleanup interval must be at least one second".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "cleanup batch_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one cleanup cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub expired_cleaned: usize,
    pub excess_completed_cleaned: usize,
    pub excess_failed_cleaned: usize,
    pub aged_cleaned: usize,
    pub total_cleaned: usize,
    pub errors: Vec<String>,
    pub dry_run: bool,
    pub duration_ms: u64,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Periodic cleanup over any task storage provider.
///
/// A service owns at most one background loop; `start` on a running
/// service is a no-op.
pub struct CleanupService {
    provider: Arc<dyn TaskStorageProvider>,
    config: CleanupConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupService {
    pub fn new(provider: Arc<dyn TaskStorageProvider>, config: CleanupConfig) -> Self {
        Self {
            provider,
            config,
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Run one cycle now and then every `interval` in the background.
    ///
    /// Returns `Ok(false)` without spawning when the service is disabled
    /// or already running.
    pub async fn start(&self) -> Result<bool, ConfigError> {
        if !self.config.enabled {
            warn!("Cleanup service is disabled, not starting");
            return Ok(false);
        }
        self.config.validate()?;

        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Cleanup service already running");
            return Ok(false);
        }

        let provider = Arc::clone(&self.provider);
        let config = self.config.clone();
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                run_cycle(provider.as_ref(), &config).await;
            }
        }));

        info!(
            backend = %self.provider.backend(),
            interval_secs = self.config.interval_secs,
            dry_run = self.config.dry_run,
            "Cleanup service started"
        );
        Ok(true)
    }

    /// Cancel the background loop, if any
    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
            info!("Cleanup service stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Run a single cycle in the caller's task
    pub async fn run_once(&self) -> CleanupReport {
        run_cycle(self.provider.as_ref(), &self.config).await
    }
}

impl Drop for CleanupService {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_cycle(provider: &dyn TaskStorageProvider, config: &CleanupConfig) -> CleanupReport {
    let started = Instant::now();
    let mut report = CleanupReport {
        dry_run: config.dry_run,
        ..CleanupReport::default()
    };

    if config.dry_run {
        match provider.count_expired_tasks().await {
            Ok(count) => info!(count, "Dry run: would sweep expired tasks"),
            Err(e) => report.errors.push(format!("expired sweep: {e}")),
        }
    } else {
        match provider.cleanup_expired_tasks().await {
            Ok(count) => report.expired_cleaned = count,
            Err(e) => report.errors.push(format!("expired sweep: {e}")),
        }
    }

    report.excess_completed_cleaned = trim_surplus(
        provider,
        config,
        TaskState::Completed,
        config.max_completed_tasks,
        &mut report.errors,
    )
    .await;
    report.excess_failed_cleaned = trim_surplus(
        provider,
        config,
        TaskState::Failed,
        config.max_failed_tasks,
        &mut report.errors,
    )
    .await;
    report.aged_cleaned = delete_aged(provider, config, &mut report.errors).await;

    report.total_cleaned = report.expired_cleaned
        + report.excess_completed_cleaned
        + report.excess_failed_cleaned
        + report.aged_cleaned;
    report.duration_ms = started.elapsed().as_millis() as u64;

    if report.errors.is_empty() {
        info!(
            total = report.total_cleaned,
            expired = report.expired_cleaned,
            completed = report.excess_completed_cleaned,
            failed = report.excess_failed_cleaned,
            aged = report.aged_cleaned,
            dry_run = report.dry_run,
            "Cleanup cycle finished"
        );
    } else {
        warn!(
            total = report.total_cleaned,
            errors = report.errors.len(),
            "Cleanup cycle finished with errors"
        );
    }
    report
}

/// Delete the oldest tasks in `state` beyond `limit`, at most one batch.
async fn trim_surplus(
    provider: &dyn TaskStorageProvider,
    config: &CleanupConfig,
    state: TaskState,
    limit: usize,
    errors: &mut Vec<String>,
) -> usize {
    let query = TaskQuery::new()
        .with_state(state)
        .with_limit(limit.saturating_add(config.batch_size));
    let mut tasks = match provider.find_tasks(&query).await {
        Ok(tasks) => tasks,
        Err(e) => {
            errors.push(format!("{state} surplus: {e}"));
            return 0;
        }
    };
    if tasks.len() <= limit {
        return 0;
    }

    tasks.sort_by_key(status_time);
    let surplus = tasks.len() - limit;
    if config.dry_run {
        info!(state = %state, count = surplus, "Dry run: would delete surplus tasks");
        return 0;
    }
    delete_all(provider, &tasks[..surplus], &format!("{state} surplus"), errors).await
}

/// Delete terminal tasks older than `max_age` whose state is not retained.
async fn delete_aged(
    provider: &dyn TaskStorageProvider,
    config: &CleanupConfig,
    errors: &mut Vec<String>,
) -> usize {
    let cutoff = chrono::Duration::from_std(config.max_age())
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut deleted = 0;

    for state in TaskState::TERMINAL {
        if config.retain_states.contains(&state) {
            continue;
        }
        let query = TaskQuery::new()
            .with_state(state)
            .until(cutoff)
            .with_limit(config.batch_size);
        let tasks = match provider.find_tasks(&query).await {
            Ok(tasks) => tasks,
            Err(e) => {
                errors.push(format!("{state} age: {e}"));
                continue;
            }
        };
        if tasks.is_empty() {
            continue;
        }
        if config.dry_run {
            info!(state = %state, count = tasks.len(), "Dry run: would delete aged tasks");
            continue;
        }
        deleted += delete_all(provider, &tasks, &format!("{state} age"), errors).await;
    }
    deleted
}

async fn delete_all(
    provider: &dyn TaskStorageProvider,
    tasks: &[Task],
    step: &str,
    errors: &mut Vec<String>,
) -> usize {
    let mut deleted = 0;
    for task in tasks {
        match provider.delete_task(&task.id).await {
            Ok(true) => {
                deleted += 1;
                debug!(task_id = %task.id, step, "Cleanup deleted task");
            }
            Ok(false) => {}
            Err(e) => errors.push(format!("{step}: {e}")),
        }
    }
    deleted
}

/// Sort key putting untimestamped tasks first, then oldest first
fn status_time(task: &Task) -> Option<DateTime<Utc>> {
    task.status.timestamp.as_deref().and_then(parse_timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryTaskProvider;
    use crate::record::TaskMetadata;
    use tasklane_a2a::TaskStatus;

    fn at(ts: &str, id: &str, state: TaskState) -> Task {
        Task::new(id, "ctx").with_status(TaskStatus::new(state).with_timestamp(ts))
    }

    async fn provider_with(tasks: Vec<Task>) -> Arc<InMemoryTaskProvider> {
        let provider = Arc::new(InMemoryTaskProvider::default());
        for task in tasks {
            provider.store_task(task, None).await.unwrap();
        }
        provider
    }

    #[tokio::test]
    async fn trims_oldest_completed_surplus() {
        let provider = provider_with(vec![
            at("2024-01-01T00:00:00Z", "t1", TaskState::Completed),
            at("2024-01-02T00:00:00Z", "t2", TaskState::Completed),
        ])
        .await;
        let service = CleanupService::new(
            provider.clone(),
            CleanupConfig::new()
                .with_max_completed_tasks(1)
                .with_max_age(Duration::from_secs(100 * 365 * 24 * 3600)),
        );

        let report = service.run_once().await;
        assert_eq!(report.excess_completed_cleaned, 1);
        assert_eq!(report.total_cleaned, 1);
        assert!(report.is_clean());
        assert!(provider.get_task("t1").await.unwrap().is_none());
        assert!(provider.get_task("t2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dry_run_never_mutates() {
        let provider = provider_with(vec![
            at("2000-01-01T00:00:00Z", "old-failed", TaskState::Failed),
            at("2000-01-02T00:00:00Z", "old-done", TaskState::Completed),
        ])
        .await;
        provider
            .store_task(
                Task::new("expired", "ctx"),
                Some(TaskMetadata::expiring_at(Utc::now() - chrono::Duration::seconds(1))),
            )
            .await
            .unwrap();

        let service = CleanupService::new(
            provider.clone(),
            CleanupConfig::new()
                .with_dry_run(true)
                .with_max_completed_tasks(0)
                .with_max_failed_tasks(0),
        );
        let report = service.run_once().await;

        assert!(report.dry_run);
        assert_eq!(report.total_cleaned, 0);
        assert_eq!(report.expired_cleaned, 0);
        assert_eq!(provider.len().await, 3);
    }

    #[tokio::test]
    async fn ages_out_unretained_terminal_states() {
        let provider = provider_with(vec![
            at("2000-01-01T00:00:00Z", "old-failed", TaskState::Failed),
            at("2000-01-01T00:00:00Z", "old-canceled", TaskState::Canceled),
            at("2000-01-01T00:00:00Z", "old-working", TaskState::Working),
        ])
        .await;
        let service = CleanupService::new(
            provider.clone(),
            CleanupConfig::new()
                .with_max_age(Duration::from_secs(24 * 3600))
                .with_retain_states(vec![TaskState::Canceled]),
        );

        let report = service.run_once().await;
        assert_eq!(report.aged_cleaned, 1);
        assert!(provider.get_task("old-failed").await.unwrap().is_none());
        assert!(provider.get_task("old-canceled").await.unwrap().is_some());
        assert!(provider.get_task("old-working").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn start_is_single_owner_and_stop_cancels() {
        let provider = provider_with(Vec::new()).await;
        let service = CleanupService::new(
            provider,
            CleanupConfig::new().with_interval(Duration::from_secs(60)),
        );

        assert!(service.start().await.unwrap());
        assert!(!service.start().await.unwrap());
        assert!(service.is_running().await);

        service.stop().await;
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn disabled_service_does_not_start() {
        let provider = provider_with(Vec::new()).await;
        let service = CleanupService::new(provider, CleanupConfig::new().with_enabled(false));
        assert!(!service.start().await.unwrap());
        assert!(!service.is_running().await);
    }

    #[test]
    fn rejects_zero_interval() {
        let config = CleanupConfig::new().with_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
