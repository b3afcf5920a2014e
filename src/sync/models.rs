//! Sync Data Models
//!
//! Defines the data structures that move between the local cache and the
//! remote document store.
//!
//! Data Categories:
//! - SyncConfig: Sync settings (remote endpoint, retry budget, probe)
//! - SyncStatus: Lifecycle tag of a cached entity
//! - YearPlan / MonthData: The year-planner document and its months

use super::error::SyncError;
use super::retry::BackoffStrategy;
use crate::db::{Database, DbResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const SYNC_CONFIG_KEY: &str = "sync_config";

pub const MONTHS_IN_YEAR: usize = 12;

const MONTH_NAMES: [&str; MONTHS_IN_YEAR] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

// ============================================================================
// Sync Configuration
// ============================================================================

/// Sync configuration
///
/// Defaults can be overridden from `DINGO_*` environment variables and the
/// whole struct is persisted in the settings table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Whether sync is enabled
    pub enabled: bool,

    /// Signed-in user ID (owner of the remote documents)
    pub user_id: Option<String>,

    /// Unique device identifier (UUID v4)
    pub device_id: String,

    /// Device name (hostname by default)
    pub device_name: String,

    /// Base URL of the remote document store
    pub api_base_url: String,

    /// URL probed to decide whether the network is usable
    pub connectivity_probe_url: String,

    /// Seconds between connectivity probes (0 = push-only)
    pub connectivity_poll_secs: u64,

    /// Retry budget per remote write
    pub max_retry_attempts: u32,

    /// Base delay between attempts, in milliseconds
    pub retry_delay_ms: u64,

    pub backoff: BackoffStrategy,

    /// How long a cached snapshot counts as fresh
    pub cache_freshness_minutes: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_id: None,
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: get_default_device_name(),
            api_base_url: "https://api.dingo.app/v1".to_string(),
            connectivity_probe_url: "https://clients3.google.com/generate_204".to_string(),
            connectivity_poll_secs: 5,
            max_retry_attempts: 3,
            retry_delay_ms: 5000,
            backoff: BackoffStrategy::Linear,
            cache_freshness_minutes: 60,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `DINGO_*` environment variables
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DINGO_API_BASE_URL") {
            config.api_base_url = url;
        }
        if let Ok(user_id) = std::env::var("DINGO_USER_ID") {
            config.user_id = Some(user_id);
        }
        if let Ok(url) = std::env::var("DINGO_PROBE_URL") {
            config.connectivity_probe_url = url;
        }
        if let Some(secs) = env_parse("DINGO_CONNECTIVITY_POLL_SECS") {
            config.connectivity_poll_secs = secs;
        }
        if let Some(attempts) = env_parse("DINGO_MAX_RETRY_ATTEMPTS") {
            config.max_retry_attempts = attempts;
        }
        if let Some(ms) = env_parse("DINGO_RETRY_DELAY_MS") {
            config.retry_delay_ms = ms;
        }

        config
    }

    /// Load from the settings table, falling back to defaults
    pub fn load(db: &Database) -> DbResult<Self> {
        Ok(db.get_setting(SYNC_CONFIG_KEY)?.unwrap_or_default())
    }

    pub fn save(&self, db: &Database) -> DbResult<()> {
        db.set_setting(SYNC_CONFIG_KEY, self)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get default device name from hostname
fn get_default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Dingo Device".to_string())
}

// ============================================================================
// Sync Status
// ============================================================================

/// Whether a cached entity matches the remote copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Matches the remote copy
    Synced,
    /// Local changes waiting for a remote write
    Pending,
    /// Remote write failed after the retry budget (or terminally)
    Error,
    /// Written while offline; flushed when connectivity returns
    Offline,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }

    pub fn needs_sync(&self) -> bool {
        *self != Self::Synced
    }
}

// ============================================================================
// Year Planner
// ============================================================================

/// One month of a year plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthData {
    /// 1-12 (January = 1)
    pub index: u8,
    pub name: String,
    pub content: String,
    pub word_count: usize,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub is_pending_sync: bool,
}

impl MonthData {
    pub fn create_empty(index: u8, now: DateTime<Utc>) -> Result<Self, SyncError> {
        let name = month_name(index).ok_or_else(|| {
            SyncError::validation("month", format!("Invalid month index: {}. Must be 1-12.", index))
        })?;

        Ok(Self {
            index,
            name: name.to_string(),
            content: String::new(),
            word_count: 0,
            last_modified: now,
            is_pending_sync: false,
        })
    }

    /// All 12 months with empty content
    pub fn empty_year(now: DateTime<Utc>) -> Vec<Self> {
        MONTH_NAMES
            .iter()
            .zip(1u8..)
            .map(|(name, index)| Self {
                index,
                name: name.to_string(),
                content: String::new(),
                word_count: 0,
                last_modified: now,
                is_pending_sync: false,
            })
            .collect()
    }

    /// Replace content and recompute the word count
    pub fn update_content(&self, content: &str, now: DateTime<Utc>) -> Self {
        Self {
            content: content.to_string(),
            word_count: count_words(content),
            last_modified: now,
            is_pending_sync: true,
            ..self.clone()
        }
    }

    pub fn mark_as_synced(&self) -> Self {
        Self {
            is_pending_sync: false,
            ..self.clone()
        }
    }
}

pub fn month_name(index: u8) -> Option<&'static str> {
    MONTH_NAMES.get(usize::from(index).checked_sub(1)?).copied()
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// A year plan: the cached, synchronised document, keyed by year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearPlan {
    pub year: i32,
    pub user_id: String,
    pub months: Vec<MonthData>,
    pub sync_status: SyncStatus,
    pub last_synced: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every local edit
    #[serde(default)]
    pub version: u64,
}

impl YearPlan {
    pub fn create_empty(year: i32, user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            year,
            user_id: user_id.into(),
            months: MonthData::empty_year(now),
            sync_status: SyncStatus::Pending,
            last_synced: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Update content for one month (1-12)
    pub fn update_month(
        &self,
        month_index: u8,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, SyncError> {
        if self.month(month_index).is_none() {
            return Err(SyncError::validation(
                "month",
                "Month index must be between 1 and 12",
            ));
        }

        let months = self
            .months
            .iter()
            .map(|m| {
                if m.index == month_index {
                    m.update_content(content, now)
                } else {
                    m.clone()
                }
            })
            .collect();

        Ok(Self {
            months,
            sync_status: SyncStatus::Pending,
            updated_at: now,
            version: self.version + 1,
            ..self.clone()
        })
    }

    pub fn month(&self, month_index: u8) -> Option<&MonthData> {
        self.months.iter().find(|m| m.index == month_index)
    }

    pub fn mark_as_synced(&self, now: DateTime<Utc>) -> Self {
        Self {
            months: self.months.iter().map(MonthData::mark_as_synced).collect(),
            sync_status: SyncStatus::Synced,
            last_synced: Some(now),
            ..self.clone()
        }
    }

    pub fn mark_sync_error(&self) -> Self {
        self.with_status(SyncStatus::Error)
    }

    pub fn mark_offline(&self) -> Self {
        self.with_status(SyncStatus::Offline)
    }

    pub fn mark_pending(&self) -> Self {
        self.with_status(SyncStatus::Pending)
    }

    fn with_status(&self, sync_status: SyncStatus) -> Self {
        Self {
            sync_status,
            ..self.clone()
        }
    }

    pub fn statistics(&self) -> YearPlanStatistics {
        YearPlanStatistics {
            total_words: self.months.iter().map(|m| m.word_count).sum(),
            months_with_content: self
                .months
                .iter()
                .filter(|m| !m.content.trim().is_empty())
                .count(),
            total_months: MONTHS_IN_YEAR,
            pending_sync: self.months.iter().filter(|m| m.is_pending_sync).count(),
            last_activity: self
                .months
                .iter()
                .map(|m| m.last_modified)
                .max()
                .unwrap_or(self.updated_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearPlanStatistics {
    pub total_words: usize,
    pub months_with_content: usize,
    pub total_months: usize,
    pub pending_sync: usize,
    pub last_activity: DateTime<Utc>,
}

impl YearPlanStatistics {
    pub fn completion_percentage(&self) -> f32 {
        if self.total_months == 0 {
            return 0.0;
        }
        (self.months_with_content as f32 / self.total_months as f32) * 100.0
    }
}

// ============================================================================
// Tests
// ============================================================================
