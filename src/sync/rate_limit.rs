//! Sliding-window rate limiter
//!
//! Request timestamps live in a [`RateLimitStore`] owned by the caller, so
//! several limiters (or a restart) can share one view of recent requests.
//! Time comes from the injected [`Clock`].
//!
//! The sync manager does not consult it. Hosts gate user-triggered actions
//! (manual sync, sign-in attempts) with it before calling into the manager.

use super::clock::Clock;
use super::error::SyncError;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

pub const DEFAULT_MAX_REQUESTS: usize = 3;

/// Storage for request timestamps, keyed by identifier
pub trait RateLimitStore: Send + Sync {
    fn timestamps(&self, key: &str) -> Vec<DateTime<Utc>>;
    fn push(&self, key: &str, at: DateTime<Utc>);
    /// Keep only timestamps at or after `cutoff`; drops keys left empty
    fn retain_since(&self, cutoff: DateTime<Utc>) -> usize;
}

#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    entries: StdMutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn timestamps(&self, key: &str) -> Vec<DateTime<Utc>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn push(&self, key: &str, at: DateTime<Utc>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_default()
            .push(at);
    }

    fn retain_since(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;

        entries.retain(|_, stamps| {
            let before = stamps.len();
            stamps.retain(|at| *at >= cutoff);
            removed += before - stamps.len();
            !stamps.is_empty()
        });

        removed
    }
}

/// At most `max_requests` per `window` for each identifier
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    /// Defaults: 3 requests per hour
    pub fn new(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_limits(store, clock, DEFAULT_MAX_REQUESTS, Duration::hours(1))
    }

    pub fn with_limits(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        max_requests: usize,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            max_requests,
            window,
        }
    }

    fn recent(&self, key: &str) -> Vec<DateTime<Utc>> {
        let cutoff = self.clock.now() - self.window;
        let mut recent: Vec<_> = self
            .store
            .timestamps(key)
            .into_iter()
            .filter(|at| *at > cutoff)
            .collect();
        recent.sort_unstable();
        recent
    }

    /// `Err(RateLimitExceeded)` if `key` has used up its window
    pub fn check(&self, key: &str) -> Result<(), SyncError> {
        if self.recent(key).len() >= self.max_requests {
            log::warn!("Rate limit exceeded for {}", key);
            return Err(SyncError::RateLimitExceeded);
        }
        Ok(())
    }

    pub fn record(&self, key: &str) {
        self.store.push(key, self.clock.now());
    }

    /// `check` then `record`
    pub fn try_acquire(&self, key: &str) -> Result<(), SyncError> {
        self.check(key)?;
        self.record(key);
        Ok(())
    }

    pub fn remaining(&self, key: &str) -> usize {
        self.max_requests.saturating_sub(self.recent(key).len())
    }

    /// Time until the oldest request in the window expires, if limited
    pub fn retry_after(&self, key: &str) -> Option<Duration> {
        let recent = self.recent(key);
        if recent.len() < self.max_requests {
            return None;
        }
        let oldest = recent.first()?;
        Some(*oldest + self.window - self.clock.now())
    }

    /// Drop timestamps that fell out of the window
    pub fn evict_expired(&self) -> usize {
        let removed = self.store.retain_since(self.clock.now() - self.window);
        if removed > 0 {
            log::debug!("Evicted {} expired rate limit entries", removed);
        }
        removed
    }
}
