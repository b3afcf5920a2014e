//! # Dingo Sync
//!
//! Offline-first synchronization core for the Dingo goal tracker's year
//! planner: connectivity observation, cached writes, flush on reconnect and
//! bounded retries against the remote document store.

pub mod cache;
pub mod db;
pub mod sync;

pub use cache::{CacheError, CacheStats, CachedYearPlan, PlanCache, PlanCacheConfig};
pub use db::{Database, DbError, DbResult};
pub use sync::{
    FlushReport, SyncConfig, SyncError, SyncManager, SyncManagerError, SyncStatus, YearPlan,
};

use std::path::PathBuf;
use std::sync::Arc;
use sync::{BackgroundScheduler, SchedulerError};

const DB_FILE_NAME: &str = "dingo.db";

/// Load `.env` and initialise the logger (default level: info).
///
/// Safe to call more than once.
pub fn init_logging() {
    dotenvy::dotenv().ok();

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Platform data directory for the local database
pub fn default_data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("io", "sukhuat", "dingo").map(|dirs| dirs.data_dir().to_path_buf())
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Cannot determine data directory")]
    NoDataDir,

    #[error("Failed to create data directory: {0}")]
    DataDir(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Manager(#[from] SyncManagerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Everything the host app needs: storage, sync manager, scheduler
pub struct SyncService {
    db: Arc<Database>,
    manager: SyncManager,
    scheduler: BackgroundScheduler,
}

impl SyncService {
    /// Open the database at `db_path` and build the sync stack from its stored config
    pub async fn open(db_path: PathBuf, access_token: impl Into<String>) -> Result<Self, ServiceError> {
        log::info!("Database path: {:?}", db_path);
        let db = Arc::new(Database::new(db_path)?);

        let manager = SyncManager::from_database(db.clone(), access_token)?;
        let scheduler = BackgroundScheduler::new(db.clone());
        scheduler.load_config().await?;

        Ok(Self { db, manager, scheduler })
    }

    /// [`SyncService::open`] in the platform data directory
    pub async fn open_default(access_token: impl Into<String>) -> Result<Self, ServiceError> {
        let data_dir = default_data_dir().ok_or(ServiceError::NoDataDir)?;
        std::fs::create_dir_all(&data_dir)?;
        Self::open(data_dir.join(DB_FILE_NAME), access_token).await
    }

    /// Start connectivity observation and, if enabled, the periodic flush
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.manager.start()?;

        if self.scheduler.get_config().await.enabled {
            self.scheduler.start(self.manager.clone()).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        if self.scheduler.is_running() {
            self.scheduler.stop().await?;
        }
        if self.manager.is_running() {
            self.manager.stop().await?;
        }

        log::info!("Sync service shut down");
        Ok(())
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    pub fn scheduler(&self) -> &BackgroundScheduler {
        &self.scheduler
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync::SchedulerConfig;

    fn seed_config(path: &std::path::Path) {
        let db = Database::new(path.to_path_buf()).unwrap();
        let mut config = SyncConfig::default();
        config.user_id = Some("user-1".to_string());
        config.connectivity_poll_secs = 0;
        config.save(&db).unwrap();
        db.set_setting(
            "scheduler_config",
            &SchedulerConfig {
                enabled: true,
                interval_minutes: 15,
                last_run: None,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }

    #[tokio::test]
    async fn test_open_requires_signed_in_user() {
        let dir = tempfile::tempdir().unwrap();
        let result = SyncService::open(dir.path().join(DB_FILE_NAME), "token").await;

        assert!(matches!(
            result,
            Err(ServiceError::Manager(SyncManagerError::NotSignedIn))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DB_FILE_NAME);
        seed_config(&path);

        let service = SyncService::open(path, "token").await.unwrap();
        service.start().await.unwrap();
        assert!(service.manager().is_running());
        assert!(service.scheduler().is_running());

        // Push-only connectivity starts offline
        let plan = YearPlan::create_empty(2024, "user-1", chrono::Utc::now());
        assert!(service.manager().save_with_sync(&plan).await.unwrap());
        assert_eq!(
            service.manager().sync_status(2024).await.unwrap(),
            Some(SyncStatus::Offline)
        );

        service.shutdown().await.unwrap();
        assert!(!service.manager().is_running());
        assert!(!service.scheduler().is_running());
    }
}
