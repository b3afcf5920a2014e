//! Sync Manager - Orchestrates synchronization operations
//!
//! Coordinates between the local cache, the remote store and connectivity.
//! Handles:
//! - Routing writes: remote (with retries) when online, cache when offline
//! - Flushing unsynced plans when connectivity returns
//! - Status bookkeeping (Synced / Pending / Error / Offline) per year
//! - Serialising writes per year while different years run concurrently

use super::clock::{Clock, SystemClock};
use super::connectivity::{ConnectionStatus, ConnectivityObserver, HttpProbe};
use super::error::SyncError;
use super::models::{SyncConfig, SyncStatus, YearPlan};
use super::remote::{HttpRemoteStore, RemoteStore};
use super::retry::RetryPolicy;
use super::validator;
use crate::cache::{CacheError, PlanCache, PlanCacheConfig};
use crate::db::{Database, DbError};
use chrono::Datelike;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Aggregate result of a flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Plans a remote write was attempted for
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Plans that were already synced (or gone) when their turn came
    pub skipped: usize,
    /// Remote calls made across all plans
    pub total_attempts: u32,
    pub errors: Vec<String>,
}

enum FlushOutcome {
    Synced { attempts: u32 },
    Failed { attempts: u32, error: SyncError },
    Skipped,
}

struct ObserverTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    remote: Arc<dyn RemoteStore>,
    cache: PlanCache,
    connectivity: ConnectivityObserver,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    user_id: String,
    year_locks: Arc<StdMutex<HashMap<i32, Arc<AsyncMutex<()>>>>>,
    observer: Arc<StdMutex<Option<ObserverTask>>>,
    deferred_flush: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl SyncManager {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: PlanCache,
        connectivity: ConnectivityObserver,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            cache,
            connectivity,
            retry,
            clock,
            user_id: user_id.into(),
            year_locks: Arc::new(StdMutex::new(HashMap::new())),
            observer: Arc::new(StdMutex::new(None)),
            deferred_flush: Arc::new(StdMutex::new(None)),
        }
    }

    /// Wire up the HTTP remote store and probe described by `config`
    pub fn from_config(
        config: &SyncConfig,
        db: Arc<Database>,
        access_token: impl Into<String>,
    ) -> Result<Self, SyncManagerError> {
        if !config.enabled {
            return Err(SyncManagerError::SyncDisabled);
        }
        let user_id = config
            .user_id
            .clone()
            .ok_or(SyncManagerError::NotSignedIn)?;
        validator::validate_user_id(&user_id)?;

        let remote = HttpRemoteStore::new(&config.api_base_url, user_id.clone())?
            .with_token(access_token);
        let probe = HttpProbe::new(&config.connectivity_probe_url)?;

        // Offline until the first probe says otherwise
        let connectivity = ConnectivityObserver::new(
            Arc::new(probe),
            Duration::from_secs(config.connectivity_poll_secs),
            ConnectionStatus::Unavailable,
        );

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = PlanCache::with_config(
            db,
            clock.clone(),
            PlanCacheConfig {
                freshness: chrono::Duration::minutes(config.cache_freshness_minutes),
                ..PlanCacheConfig::default()
            },
        );

        log::info!(
            "Sync manager configured for {} on {} ({})",
            user_id,
            config.device_name,
            config.api_base_url
        );

        Ok(Self::new(
            Arc::new(remote),
            cache,
            connectivity,
            RetryPolicy::from(config),
            clock,
            user_id,
        ))
    }

    /// Same as [`SyncManager::from_config`] with the config stored in `db`
    pub fn from_database(
        db: Arc<Database>,
        access_token: impl Into<String>,
    ) -> Result<Self, SyncManagerError> {
        let config = SyncConfig::load(&db)?;
        Self::from_config(&config, db, access_token)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start observing connectivity
    ///
    /// Loss marks unsynced plans Offline; restoration marks them Pending and
    /// flushes.
    pub fn start(&self) -> Result<(), SyncManagerError> {
        let mut observer = self.observer.lock().unwrap_or_else(|e| e.into_inner());
        if observer.is_some() {
            return Err(SyncManagerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut subscription = self.connectivity.subscribe();
        let manager = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    status = subscription.next() => match status {
                        Some(ConnectionStatus::Available) => manager.on_connectivity_restored().await,
                        Some(ConnectionStatus::Unavailable) => manager.on_connectivity_lost().await,
                        None => break,
                    },
                }
            }
            log::debug!("Connectivity observation ended");
        });

        *observer = Some(ObserverTask { cancel, handle });
        log::info!("Sync manager started for {}", self.user_id);
        Ok(())
    }

    /// Stop observing connectivity and release the listener
    pub async fn stop(&self) -> Result<(), SyncManagerError> {
        let task = self
            .observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SyncManagerError::NotRunning)?;

        task.cancel.cancel();
        task.handle.abort();
        // Cancelled join errors are expected here
        let _ = task.handle.await;

        if let Some(deferred) = self.deferred_flush.lock().unwrap_or_else(|e| e.into_inner()).take() {
            deferred.abort();
        }

        log::info!("Sync manager stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Save a plan, remotely if possible
    ///
    /// Returns `true` when the plan was written remotely or cached for a
    /// later flush (offline), `false` when the remote write failed and the
    /// plan was cached with `Error`.
    pub async fn save_with_sync(&self, plan: &YearPlan) -> Result<bool, SyncManagerError> {
        validator::validate_plan(plan)?;

        let lock = self.year_lock(plan.year);
        let _guard = lock.lock().await;
        self.save_locked(plan.clone()).await
    }

    /// Edit one month of a year, creating the plan if needed
    pub async fn update_month_content(
        &self,
        year: i32,
        month: u8,
        content: &str,
    ) -> Result<bool, SyncManagerError> {
        validator::validate_year_for_planning(year, self.clock.now().year())?;
        validator::validate_month_index(month)?;
        validator::validate_month_content(content)?;
        if let Some(warning) = validator::content_length_warning(content) {
            log::warn!("Month {} of {} content close to the length limit ({:?})", month, year, warning);
        }

        let lock = self.year_lock(year);
        let _guard = lock.lock().await;

        let base = match self.cache.get_plan(year).await? {
            Some(plan) => plan,
            None => self.fetch_base(year).await?,
        };
        let updated = base.update_month(month, content, self.clock.now())?;

        // Only a plan known to match the remote copy can take a field-level update
        if !(self.connectivity.is_online() && base.sync_status == SyncStatus::Synced) {
            return self.save_locked(updated).await;
        }

        let month_data = updated
            .month(month)
            .cloned()
            .ok_or_else(|| SyncError::validation("month", "Month missing from plan"))?;
        self.cache.put(&updated).await?;

        let remote = &self.remote;
        let month_ref = &month_data;
        let outcome = self
            .retry
            .execute(&format!("Month update {}/{}", year, month), move |_| {
                remote.update_month_content(year, month_ref)
            })
            .await;

        match outcome.result {
            Ok(()) => {
                self.cache.put(&updated.mark_as_synced(self.clock.now())).await?;
                log::info!("Month {} of {} synced", month, year);
                Ok(true)
            }
            Err(e) => {
                log::warn!("Month {} of {} failed to sync: {}", month, year, e);
                self.cache.put(&updated.mark_sync_error()).await?;
                Ok(false)
            }
        }
    }

    /// Caller holds the year lock
    async fn save_locked(&self, plan: YearPlan) -> Result<bool, SyncManagerError> {
        if !self.connectivity.is_online() {
            self.cache.put(&plan.mark_offline()).await?;
            log::info!("Offline: year plan {} cached for later sync", plan.year);
            self.schedule_flush_when_online();
            return Ok(true);
        }

        match self.write_remote(&plan).await? {
            FlushOutcome::Failed { .. } => Ok(false),
            FlushOutcome::Synced { .. } | FlushOutcome::Skipped => Ok(true),
        }
    }

    /// Cache as Pending, write through the retry policy, cache the result
    async fn write_remote(&self, plan: &YearPlan) -> Result<FlushOutcome, SyncManagerError> {
        let pending = plan.mark_pending();
        self.cache.put(&pending).await?;

        let remote = &self.remote;
        let pending_ref = &pending;
        let outcome = self
            .retry
            .execute(&format!("Year plan {} save", plan.year), move |_| {
                remote.save_year_plan(pending_ref)
            })
            .await;

        match outcome.result {
            Ok(()) => {
                self.cache
                    .put(&pending.mark_as_synced(self.clock.now()))
                    .await?;
                log::info!(
                    "Year plan {} synced (version: {}, attempts: {})",
                    plan.year,
                    plan.version,
                    outcome.attempts
                );
                Ok(FlushOutcome::Synced {
                    attempts: outcome.attempts,
                })
            }
            Err(error) => {
                self.cache.put(&pending.mark_sync_error()).await?;
                log::warn!(
                    "Year plan {} failed to sync after {} attempt(s): {}",
                    plan.year,
                    outcome.attempts,
                    error
                );
                Ok(FlushOutcome::Failed {
                    attempts: outcome.attempts,
                    error,
                })
            }
        }
    }

    /// Remote copy when online, an empty plan when offline or absent remotely
    ///
    /// A failed fetch is returned as is: writing an empty base would replace
    /// the remote document.
    async fn fetch_base(&self, year: i32) -> Result<YearPlan, SyncManagerError> {
        if self.connectivity.is_online() {
            let remote = &self.remote;
            let outcome = self
                .retry
                .execute(&format!("Year plan {} fetch", year), move |_| {
                    remote.get_year_plan(year)
                })
                .await;

            match outcome.result {
                Ok(Some(plan)) => return Ok(plan.mark_as_synced(self.clock.now())),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Could not fetch year plan {}, edit not applied: {}", year, e);
                    return Err(e.into());
                }
            }
        }

        Ok(YearPlan::create_empty(year, self.user_id.clone(), self.clock.now()))
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Push every unsynced plan to the remote store
    ///
    /// Fails with `NetworkUnavailable` while offline, leaving the cache as is.
    pub async fn flush_pending(&self) -> Result<FlushReport, SyncManagerError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::NetworkUnavailable.into());
        }

        let years = self.cache.unsynced_years()?;
        let mut report = FlushReport::default();
        if years.is_empty() {
            return Ok(report);
        }

        log::info!("Flushing {} unsynced year plan(s)", years.len());
        let results = join_all(years.iter().map(|&year| self.flush_one(year))).await;

        for (year, result) in years.iter().zip(results) {
            match result {
                Ok(FlushOutcome::Synced { attempts }) => {
                    report.attempted += 1;
                    report.synced += 1;
                    report.total_attempts += attempts;
                }
                Ok(FlushOutcome::Failed { attempts, error }) => {
                    report.attempted += 1;
                    report.failed += 1;
                    report.total_attempts += attempts;
                    report.errors.push(format!("{}: {}", year, error));
                }
                Ok(FlushOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    log::error!("Flush of year plan {} aborted: {}", year, e);
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", year, e));
                }
            }
        }

        log::info!(
            "Flush completed: {} synced, {} failed, {} skipped ({} remote attempts)",
            report.synced,
            report.failed,
            report.skipped,
            report.total_attempts
        );
        Ok(report)
    }

    async fn flush_one(&self, year: i32) -> Result<FlushOutcome, SyncManagerError> {
        let lock = self.year_lock(year);
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent save may have synced it
        let plan = match self.cache.get_plan(year).await? {
            Some(plan) if plan.sync_status.needs_sync() => plan,
            _ => return Ok(FlushOutcome::Skipped),
        };

        self.write_remote(&plan).await
    }

    fn schedule_flush_when_online(&self) {
        // The observer task flushes on restoration by itself
        if self.is_running() {
            return;
        }

        let mut deferred = self.deferred_flush.lock().unwrap_or_else(|e| e.into_inner());
        if deferred.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No tokio runtime, deferred flush not scheduled");
            return;
        };

        let manager = self.clone();
        let mut subscription = self.connectivity.subscribe();
        *deferred = Some(runtime.spawn(async move {
            loop {
                match subscription.next().await {
                    Some(ConnectionStatus::Available) => break,
                    Some(ConnectionStatus::Unavailable) => continue,
                    None => return,
                }
            }
            drop(subscription);
            manager.on_connectivity_restored().await;
        }));

        log::debug!("Deferred flush scheduled for when connectivity returns");
    }

    // ========================================================================
    // Connectivity transitions
    // ========================================================================

    async fn on_connectivity_lost(&self) {
        let changed = self
            .retag_unsynced(
                |status| matches!(status, SyncStatus::Pending | SyncStatus::Error),
                YearPlan::mark_offline,
            )
            .await;

        if changed > 0 {
            log::info!("Connectivity lost: {} year plan(s) marked offline", changed);
        }
    }

    async fn on_connectivity_restored(&self) {
        let changed = self
            .retag_unsynced(|status| status == SyncStatus::Offline, YearPlan::mark_pending)
            .await;
        log::info!("Connectivity restored: {} offline year plan(s) pending", changed);

        match self.flush_pending().await {
            Ok(report) if report.failed > 0 => {
                log::warn!("Flush after reconnect left {} plan(s) in error", report.failed)
            }
            Ok(_) => {}
            Err(e) => log::warn!("Flush after reconnect failed: {}", e),
        }
    }

    /// Re-tag cached unsynced plans whose status matches `select`
    async fn retag_unsynced<S, M>(&self, select: S, retag: M) -> usize
    where
        S: Fn(SyncStatus) -> bool,
        M: Fn(&YearPlan) -> YearPlan,
    {
        let years = match self.cache.unsynced_years() {
            Ok(years) => years,
            Err(e) => {
                log::error!("Failed to read unsynced plans: {}", e);
                return 0;
            }
        };

        let mut changed = 0;
        for year in years {
            let lock = self.year_lock(year);
            let _guard = lock.lock().await;

            match self.cache.get_plan(year).await {
                Ok(Some(plan)) if select(plan.sync_status) => {
                    if let Err(e) = self.cache.put(&retag(&plan)).await {
                        log::error!("Failed to update status of year plan {}: {}", year, e);
                    } else {
                        changed += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => log::error!("Failed to read year plan {}: {}", year, e),
            }
        }
        changed
    }

    // ========================================================================
    // Reads & deletes
    // ========================================================================

    /// Current view of a year plan
    ///
    /// A local unsynced snapshot wins over the remote copy. Offline, or when
    /// the remote store is unreachable, the cached snapshot is returned.
    pub async fn get_year_plan(&self, year: i32) -> Result<Option<YearPlan>, SyncManagerError> {
        validator::validate_year(year)?;

        let cached = self.cache.get_plan(year).await?;
        if cached.as_ref().map_or(false, |p| p.sync_status.needs_sync()) {
            return Ok(cached);
        }
        if !self.connectivity.is_online() {
            return Ok(cached);
        }
        if cached.is_some() && self.cache.is_fresh(year).await? {
            return Ok(cached);
        }

        let remote = &self.remote;
        let outcome = self
            .retry
            .execute(&format!("Year plan {} fetch", year), move |_| {
                remote.get_year_plan(year)
            })
            .await;

        match outcome.result {
            Ok(Some(plan)) => {
                let lock = self.year_lock(year);
                let _guard = lock.lock().await;

                // An edit made while fetching wins
                if let Some(local) = self.cache.get_plan(year).await? {
                    if local.sync_status.needs_sync() {
                        return Ok(Some(local));
                    }
                }

                let plan = plan.mark_as_synced(self.clock.now());
                self.cache.put(&plan).await?;
                Ok(Some(plan))
            }
            Ok(None) => {
                if cached.is_some() {
                    log::info!("Year plan {} no longer exists remotely", year);
                    self.cache.remove(year).await?;
                }
                Ok(None)
            }
            Err(e) if cached.is_some() && e.recovery_strategy().serves_cache() => {
                log::warn!("Serving cached year plan {}: {}", year, e);
                Ok(cached)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn sync_status(&self, year: i32) -> Result<Option<SyncStatus>, SyncManagerError> {
        Ok(self.cache.get_plan(year).await?.map(|p| p.sync_status))
    }

    /// Delete remotely, then evict from the cache. Requires connectivity.
    pub async fn delete_year_plan(&self, year: i32) -> Result<(), SyncManagerError> {
        validator::validate_year(year)?;
        if !self.connectivity.is_online() {
            return Err(SyncError::NetworkUnavailable.into());
        }

        let lock = self.year_lock(year);
        let _guard = lock.lock().await;

        let remote = &self.remote;
        self.retry
            .execute(&format!("Year plan {} delete", year), move |_| {
                remote.delete_year_plan(year)
            })
            .await
            .result?;

        self.cache.remove(year).await?;
        log::info!("Year plan {} deleted", year);
        Ok(())
    }

    /// Years with a local snapshot not yet written remotely
    pub fn pending_years(&self) -> Result<Vec<i32>, SyncManagerError> {
        Ok(self.cache.unsynced_years()?)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connectivity(&self) -> &ConnectivityObserver {
        &self.connectivity
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn year_lock(&self, year: i32) -> Arc<AsyncMutex<()>> {
        self.year_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(year)
            .or_default()
            .clone()
    }
}

/// Sync manager errors
#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Sync is disabled")]
    SyncDisabled,

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Sync manager is already running")]
    AlreadyRunning,

    #[error("Sync manager is not running")]
    NotRunning,

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl SyncManagerError {
    /// The sync taxonomy error, if this is one
    pub fn as_sync_error(&self) -> Option<&SyncError> {
        match self {
            Self::Sync(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::ManualClock;
    use crate::sync::connectivity::ManualNetwork;
    use crate::sync::fakes::ScriptedRemote;
    use chrono::{TimeZone, Utc};

    fn manager(online: bool) -> (SyncManager, Arc<ScriptedRemote>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let initial = if online {
            ConnectionStatus::Available
        } else {
            ConnectionStatus::Unavailable
        };
        let remote = Arc::new(ScriptedRemote::new());
        let manager = SyncManager::new(
            remote.clone(),
            PlanCache::new(db, clock.clone()),
            ConnectivityObserver::new(Arc::new(ManualNetwork::new(online)), Duration::ZERO, initial),
            RetryPolicy::new(3, Duration::ZERO),
            clock,
            "user-1",
        );
        (manager, remote)
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (manager, _) = manager(true);

        assert!(manager.start().is_ok());
        assert!(manager.is_running());
        assert!(matches!(manager.start(), Err(SyncManagerError::AlreadyRunning)));
        assert_eq!(manager.connectivity().subscriber_count(), 1);

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
        assert_eq!(manager.connectivity().subscriber_count(), 0);
        assert!(matches!(manager.stop().await, Err(SyncManagerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_from_config_requires_user() {
        let db = Arc::new(Database::in_memory().unwrap());

        let config = SyncConfig::default();
        assert!(matches!(
            SyncManager::from_config(&config, db.clone(), "token"),
            Err(SyncManagerError::NotSignedIn)
        ));

        let disabled = SyncConfig {
            enabled: false,
            ..SyncConfig::default()
        };
        assert!(matches!(
            SyncManager::from_config(&disabled, db.clone(), "token"),
            Err(SyncManagerError::SyncDisabled)
        ));

        let mut config = SyncConfig::default();
        config.user_id = Some("user-1".to_string());
        config.connectivity_poll_secs = 0;
        config.save(&db).unwrap();

        let manager = SyncManager::from_database(db, "token").unwrap();
        assert_eq!(manager.user_id(), "user-1");
        assert!(!manager.connectivity().is_online());
    }

    #[tokio::test]
    async fn test_invalid_plan_is_not_cached() {
        let (manager, remote) = manager(true);
        let mut plan = YearPlan::create_empty(2024, "user-1", Utc::now());
        plan.months.truncate(3);

        let err = manager.save_with_sync(&plan).await.unwrap_err();
        assert!(matches!(
            err.as_sync_error(),
            Some(SyncError::ValidationError { .. })
        ));
        assert_eq!(manager.sync_status(2024).await.unwrap(), None);
        assert_eq!(remote.save_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_requires_connectivity() {
        let (manager, remote) = manager(false);

        let err = manager.delete_year_plan(2024).await.unwrap_err();
        assert_eq!(err.as_sync_error(), Some(&SyncError::NetworkUnavailable));
        assert_eq!(remote.delete_calls(), 0);
    }
}
