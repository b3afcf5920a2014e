//! Input validation for year plans
//!
//! All failures are [`SyncError::ValidationError`], which is terminal: a
//! rejected write is neither cached nor sent.

use super::error::SyncError;
use super::models::{YearPlan, MONTHS_IN_YEAR};

pub const MIN_YEAR: i32 = 1900;
pub const MAX_YEAR: i32 = 2200;
pub const MAX_CONTENT_LENGTH: usize = 50_000;
pub const MIN_USER_ID_LENGTH: usize = 3;
pub const MAX_USER_ID_LENGTH: usize = 128;

/// How far back / ahead a user may plan, relative to the current year
pub const MAX_YEARS_IN_PAST: i32 = 10;
pub const MAX_YEARS_IN_FUTURE: i32 = 5;

/// Approaching the content limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentWarning {
    /// Over 80% of the limit
    Approaching,
    /// Over 95% of the limit
    NearLimit,
}

pub fn validate_year(year: i32) -> Result<(), SyncError> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(SyncError::validation(
            "year",
            format!("Year must be between {} and {}", MIN_YEAR, MAX_YEAR),
        ));
    }
    Ok(())
}

pub fn validate_month_index(index: u8) -> Result<(), SyncError> {
    if !(1..=MONTHS_IN_YEAR as u8).contains(&index) {
        return Err(SyncError::validation(
            "month",
            "Month index must be between 1 and 12",
        ));
    }
    Ok(())
}

pub fn validate_month_content(content: &str) -> Result<(), SyncError> {
    let length = content.chars().count();
    if length > MAX_CONTENT_LENGTH {
        return Err(SyncError::validation(
            "content",
            format!(
                "Content too long ({} characters, max {})",
                length, MAX_CONTENT_LENGTH
            ),
        ));
    }
    Ok(())
}

pub fn validate_user_id(user_id: &str) -> Result<(), SyncError> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(SyncError::validation("user_id", "User ID cannot be empty"));
    }

    let length = trimmed.chars().count();
    if !(MIN_USER_ID_LENGTH..=MAX_USER_ID_LENGTH).contains(&length) {
        return Err(SyncError::validation(
            "user_id",
            format!(
                "User ID must be between {} and {} characters",
                MIN_USER_ID_LENGTH, MAX_USER_ID_LENGTH
            ),
        ));
    }
    Ok(())
}

/// Validate a whole plan before it is cached or written
pub fn validate_plan(plan: &YearPlan) -> Result<(), SyncError> {
    validate_year(plan.year)?;
    validate_user_id(&plan.user_id)?;

    if plan.months.len() != MONTHS_IN_YEAR {
        return Err(SyncError::validation(
            "months",
            format!("Expected {} months, got {}", MONTHS_IN_YEAR, plan.months.len()),
        ));
    }

    for (expected, month) in (1u8..).zip(&plan.months) {
        validate_month_index(month.index)?;
        if month.index != expected {
            return Err(SyncError::validation(
                "months",
                format!("Month {} is out of order", month.index),
            ));
        }
        validate_month_content(&month.content)?;
    }

    Ok(())
}

/// Whether a year is inside the planning window around `current_year`
pub fn validate_year_for_planning(year: i32, current_year: i32) -> Result<(), SyncError> {
    validate_year(year)?;

    if year < current_year - MAX_YEARS_IN_PAST {
        return Err(SyncError::validation(
            "year",
            format!("Cannot plan more than {} years in the past", MAX_YEARS_IN_PAST),
        ));
    }
    if year > current_year + MAX_YEARS_IN_FUTURE {
        return Err(SyncError::validation(
            "year",
            format!("Cannot plan more than {} years in the future", MAX_YEARS_IN_FUTURE),
        ));
    }
    Ok(())
}

pub fn content_length_warning(content: &str) -> Option<ContentWarning> {
    let length = content.chars().count();
    if length * 100 > MAX_CONTENT_LENGTH * 95 {
        Some(ContentWarning::NearLimit)
    } else if length * 100 > MAX_CONTENT_LENGTH * 80 {
        Some(ContentWarning::Approaching)
    } else {
        None
    }
}
