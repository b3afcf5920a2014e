//! Sync Module - Offline-first year plan synchronization
//!
//! Keeps the local year plan cache and the remote document store in step:
//! - Writes go to the remote store when online (with bounded retries)
//! - Writes are cached as `Offline` when not, and flushed on reconnect
//! - Every failure is classified into [`SyncError`]
//!
//! Architecture:
//! - Connectivity: `watch`-based observer with a lazily started poller
//! - Consistency: last writer wins per year, writes serialised per year
//! - Storage: SQLite-backed cache with an in-memory front

pub mod clock;
pub mod connectivity;
pub mod error;
pub mod manager;
pub mod models;
pub mod rate_limit;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod validator;

#[cfg(test)]
pub(crate) mod fakes;


// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use connectivity::{
    ConnectionStatus, ConnectivityObserver, ConnectivityProbe, ConnectivitySubscription,
    HttpProbe, ManualNetwork, NetworkChecker, NetworkQuality, NetworkType,
};
pub use error::{RecoveryStrategy, SyncError};
pub use manager::{FlushReport, SyncManager, SyncManagerError};
pub use models::{MonthData, SyncConfig, SyncStatus, YearPlan, YearPlanStatistics};
pub use rate_limit::{InMemoryRateLimitStore, RateLimitStore, RateLimiter};
pub use remote::{HttpRemoteStore, RemoteStore};
pub use retry::{BackoffStrategy, RetryOutcome, RetryPolicy};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
