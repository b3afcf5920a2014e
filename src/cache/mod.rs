//! Year plan cache - last-known snapshot of each year plan
//!
//! Two layers:
//! - Durable: `year_plan_cache` table, one row per year, survives restarts
//! - Hot: moka in-memory cache in front of it (LRU + TTL)
//!
//! Writes go through both layers. A newer write replaces the previous
//! snapshot of the same year; snapshots are never merged.

use crate::db::{Database, DbError};
use crate::sync::clock::Clock;
use crate::sync::models::{SyncStatus, YearPlan};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use rusqlite::params;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Plan cache configuration
pub struct PlanCacheConfig {
    /// Maximum number of plans kept in memory
    pub max_capacity: u64,

    /// Time-to-live of the in-memory copy (in seconds)
    pub ttl_secs: u64,

    /// How long a snapshot counts as fresh
    pub freshness: chrono::Duration,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 32,
            ttl_secs: 1800,
            freshness: chrono::Duration::hours(1),
        }
    }
}

/// A cached snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct CachedYearPlan {
    pub plan: YearPlan,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Corrupt cache entry for year {year}: {reason}")]
    Corrupt { year: i32, reason: String },
}

/// Durable year plan cache with an in-memory front
#[derive(Clone)]
pub struct PlanCache {
    db: Arc<Database>,
    hot: Arc<Cache<i32, CachedYearPlan>>,
    clock: Arc<dyn Clock>,
    freshness: chrono::Duration,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl PlanCache {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(db, clock, PlanCacheConfig::default())
    }

    pub fn with_config(db: Arc<Database>, clock: Arc<dyn Clock>, config: PlanCacheConfig) -> Self {
        let hot = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();

        Self {
            db,
            hot: Arc::new(hot),
            clock,
            freshness: config.freshness,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Store a snapshot, replacing any previous one for the same year
    pub async fn put(&self, plan: &YearPlan) -> Result<CachedYearPlan, CacheError> {
        let cached_at = self.clock.now();
        let json = serde_json::to_string(plan).map_err(|e| CacheError::Corrupt {
            year: plan.year,
            reason: e.to_string(),
        })?;

        self.db.execute(
            r#"
            INSERT OR REPLACE INTO year_plan_cache (year, plan_json, sync_status, cached_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                plan.year,
                json,
                plan.sync_status.as_str(),
                cached_at.to_rfc3339(),
                plan.version as i64,
            ],
        )?;

        let entry = CachedYearPlan {
            plan: plan.clone(),
            cached_at,
        };
        self.hot.insert(plan.year, entry.clone()).await;

        log::debug!(
            "Cached year plan {} (status: {}, version: {})",
            plan.year,
            plan.sync_status.as_str(),
            plan.version
        );
        Ok(entry)
    }

    /// Get the cached snapshot for a year
    pub async fn get(&self, year: i32) -> Result<Option<CachedYearPlan>, CacheError> {
        if let Some(entry) = self.hot.get(&year).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let row = self.db.query_opt(
            "SELECT plan_json, cached_at FROM year_plan_cache WHERE year = ?1",
            params![year],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;

        match row {
            Some((json, cached_at)) => {
                let entry = decode_row(year, &json, &cached_at)?;
                self.hot.insert(year, entry.clone()).await;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    pub async fn get_plan(&self, year: i32) -> Result<Option<YearPlan>, CacheError> {
        Ok(self.get(year).await?.map(|entry| entry.plan))
    }

    /// Whether the snapshot for `year` was written within the freshness window
    pub async fn is_fresh(&self, year: i32) -> Result<bool, CacheError> {
        Ok(self
            .get(year)
            .await?
            .map_or(false, |entry| self.clock.now() - entry.cached_at < self.freshness))
    }

    /// Drop the snapshot for a year
    pub async fn remove(&self, year: i32) -> Result<bool, CacheError> {
        self.hot.invalidate(&year).await;
        let deleted = self
            .db
            .execute("DELETE FROM year_plan_cache WHERE year = ?1", params![year])?;

        log::debug!("Cleared cache for year {}", year);
        Ok(deleted > 0)
    }

    /// Drop every snapshot
    pub async fn clear(&self) -> Result<usize, CacheError> {
        self.hot.invalidate_all();
        self.hot.run_pending_tasks().await;
        let deleted = self.db.execute("DELETE FROM year_plan_cache", params![])?;

        log::info!("Cleared all year plan cache ({} entries)", deleted);
        Ok(deleted)
    }

    /// All cached years, ascending
    pub fn cached_years(&self) -> Result<Vec<i32>, CacheError> {
        Ok(self.db.query(
            "SELECT year FROM year_plan_cache ORDER BY year ASC",
            params![],
            |row| row.get(0),
        )?)
    }

    /// Years whose snapshot is not `Synced`, ascending
    ///
    /// Reads the status column only, so a corrupt snapshot does not hide the others.
    pub fn unsynced_years(&self) -> Result<Vec<i32>, CacheError> {
        Ok(self.db.query(
            "SELECT year FROM year_plan_cache WHERE sync_status != ?1 ORDER BY year ASC",
            params![SyncStatus::Synced.as_str()],
            |row| row.get(0),
        )?)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests > 0 {
            (hits as f64 / total_requests as f64) * 100.0
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            total_requests,
            hit_rate,
            entry_count: self.hot.entry_count(),
        }
    }

    /// Reset cache statistics
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

fn decode_row(year: i32, json: &str, cached_at: &str) -> Result<CachedYearPlan, CacheError> {
    let plan: YearPlan = serde_json::from_str(json).map_err(|e| CacheError::Corrupt {
        year,
        reason: e.to_string(),
    })?;
    let cached_at = DateTime::parse_from_rfc3339(cached_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CacheError::Corrupt {
            year,
            reason: e.to_string(),
        })?;

    Ok(CachedYearPlan { plan, cached_at })
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,

    /// Cache hit rate (percentage)
    pub hit_rate: f64,

    /// Plans currently held in memory
    pub entry_count: u64,
}
