//! Remote Store - HTTP communication with the document API
//!
//! Year plans live at `{base}/users/{user_id}/year_plans/{year}`:
//! - PUT writes the whole document (last writer wins per year)
//! - PATCH `/months/{index}` updates a single month
//! - GET returns the document, 404 means it does not exist yet
//! - DELETE removes it
//!
//! Every failure is mapped into [`SyncError`].

use super::error::SyncError;
use super::models::{MonthData, SyncStatus, YearPlan};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Remote document store for year plans
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get_year_plan(&self, year: i32) -> Result<Option<YearPlan>, SyncError>;

    /// Write the full document; overwrites any remote copy of the same year
    async fn save_year_plan(&self, plan: &YearPlan) -> Result<(), SyncError>;

    /// Field-level update of one month
    async fn update_month_content(&self, year: i32, month: &MonthData) -> Result<(), SyncError>;

    async fn delete_year_plan(&self, year: i32) -> Result<(), SyncError>;

    async fn year_plan_exists(&self, year: i32) -> Result<bool, SyncError> {
        Ok(self.get_year_plan(year).await?.is_some())
    }

    /// Years with a remote document, ascending
    async fn list_years(&self) -> Result<Vec<i32>, SyncError>;
}

/// reqwest-backed [`RemoteStore`]
pub struct HttpRemoteStore {
    client: Client,
    base_url: Url,
    user_id: String,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, user_id: impl Into<String>) -> Result<Self, SyncError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::validation("api_base_url", e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::validation("api_base_url", "URL cannot be a base"));
        }

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| SyncError::UnknownError(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            user_id: user_id.into(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn with_token(self, token: impl Into<String>) -> Self {
        Self {
            access_token: Arc::new(RwLock::new(Some(token.into()))),
            ..self
        }
    }

    /// Set access token (after sign-in)
    pub async fn set_token(&self, token: String) {
        *self.access_token.write().await = Some(token);
    }

    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token (sign-out)
    pub async fn clear_token(&self) {
        *self.access_token.write().await = None;
    }

    fn plans_url(&self, tail: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["users", self.user_id.as_str(), "year_plans"])
                .extend(tail);
        }
        url
    }

    fn plan_url(&self, year: i32) -> Url {
        self.plans_url(&[year.to_string().as_str()])
    }

    async fn token(&self) -> Result<String, SyncError> {
        self.get_token().await.ok_or(SyncError::AuthenticationExpired)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn get_year_plan(&self, year: i32) -> Result<Option<YearPlan>, SyncError> {
        let token = self.token().await?;

        let response = self
            .client
            .get(self.plan_url(year))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let document: YearPlanDocument = handle_response(response).await?;
        if document.year != year {
            return Err(SyncError::DataCorruption(format!(
                "year_plan {} returned as {}",
                year, document.year
            )));
        }
        Ok(Some(document.into_plan()))
    }

    async fn save_year_plan(&self, plan: &YearPlan) -> Result<(), SyncError> {
        let token = self.token().await?;

        let response = self
            .client
            .put(self.plan_url(plan.year))
            .bearer_auth(token)
            .json(&YearPlanDocument::from(plan))
            .send()
            .await?;

        handle_empty(response).await
    }

    async fn update_month_content(&self, year: i32, month: &MonthData) -> Result<(), SyncError> {
        let token = self.token().await?;
        let year = year.to_string();
        let index = month.index.to_string();
        let url = self.plans_url(&[year.as_str(), "months", index.as_str()]);

        let response = self
            .client
            .patch(url)
            .bearer_auth(token)
            .json(&MonthPatch {
                content: &month.content,
                word_count: month.word_count,
                last_modified: month.last_modified,
            })
            .send()
            .await?;

        handle_empty(response).await
    }

    async fn delete_year_plan(&self, year: i32) -> Result<(), SyncError> {
        let token = self.token().await?;

        let response = self
            .client
            .delete(self.plan_url(year))
            .bearer_auth(token)
            .send()
            .await?;

        // Already gone
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        handle_empty(response).await
    }

    async fn list_years(&self) -> Result<Vec<i32>, SyncError> {
        let token = self.token().await?;

        let response = self
            .client
            .get(self.plans_url(&[]))
            .bearer_auth(token)
            .send()
            .await?;

        let mut listing: YearListResponse = handle_response(response).await?;
        listing.years.sort_unstable();
        listing.years.dedup();
        Ok(listing.years)
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Remote representation of a year plan (no local sync bookkeeping)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct YearPlanDocument {
    year: i32,
    user_id: String,
    months: Vec<MonthDocument>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MonthDocument {
    index: u8,
    name: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    word_count: usize,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct MonthPatch<'a> {
    content: &'a str,
    word_count: usize,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct YearListResponse {
    years: Vec<i32>,
}

impl From<&YearPlan> for YearPlanDocument {
    fn from(plan: &YearPlan) -> Self {
        Self {
            year: plan.year,
            user_id: plan.user_id.clone(),
            months: plan
                .months
                .iter()
                .map(|m| MonthDocument {
                    index: m.index,
                    name: m.name.clone(),
                    content: m.content.clone(),
                    word_count: m.word_count,
                    last_modified: m.last_modified,
                })
                .collect(),
            created_at: plan.created_at,
            updated_at: plan.updated_at,
            version: plan.version,
        }
    }
}

impl YearPlanDocument {
    /// A remote copy matches the remote store by definition
    fn into_plan(self) -> YearPlan {
        YearPlan {
            year: self.year,
            user_id: self.user_id,
            months: self
                .months
                .into_iter()
                .map(|m| MonthData {
                    index: m.index,
                    name: m.name,
                    content: m.content,
                    word_count: m.word_count,
                    last_modified: m.last_modified,
                    is_pending_sync: false,
                })
                .collect(),
            sync_status: SyncStatus::Synced,
            last_synced: Some(self.updated_at),
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version,
        }
    }
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncError> {
    if response.status().is_success() {
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    } else {
        Err(handle_error(response).await)
    }
}

async fn handle_empty(response: reqwest::Response) -> Result<(), SyncError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncError
async fn handle_error(response: reqwest::Response) -> SyncError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let err = SyncError::from_status(status, &body);
    log::debug!("Remote store returned {}: {}", status, err);
    err
}

// ============================================================================
// Tests
// ============================================================================
