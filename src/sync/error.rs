//! Sync Error Taxonomy
//!
//! Every failure coming back from the remote store or the network is folded
//! into [`SyncError`]. The retry policy only looks at
//! [`SyncError::is_retryable`] to decide whether another attempt is allowed.
//!
//! Retryable: NetworkUnavailable, ServerUnavailable, RateLimitExceeded.
//! Everything else is terminal and fails after a single attempt.

use reqwest::StatusCode;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Network unavailable")]
    NetworkUnavailable,

    #[error("Server unavailable")]
    ServerUnavailable,

    #[error("Authentication expired - sign in required")]
    AuthenticationExpired,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid {field}: {message}")]
    ValidationError { field: String, message: String },

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Data corruption detected in {0}")]
    DataCorruption(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Unknown error: {0}")]
    UnknownError(String),
}

/// What a caller should do about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry through the retry policy
    RetryWithBackoff,
    /// The session is gone; the user has to sign in again
    RequireReauth,
    /// Serve the last cached snapshot instead
    FallbackToCache,
    /// Surface the error, nothing will fix it automatically
    NoRecovery,
}

impl RecoveryStrategy {
    /// Whether a cached snapshot is an acceptable answer
    pub fn serves_cache(&self) -> bool {
        matches!(self, Self::RetryWithBackoff | Self::FallbackToCache)
    }
}

impl SyncError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable | Self::ServerUnavailable | Self::RateLimitExceeded
        )
    }

    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            Self::NetworkUnavailable | Self::ServerUnavailable | Self::RateLimitExceeded => {
                RecoveryStrategy::RetryWithBackoff
            }
            Self::AuthenticationExpired | Self::PermissionDenied(_) => RecoveryStrategy::RequireReauth,
            Self::DataCorruption(_) => RecoveryStrategy::FallbackToCache,
            Self::ValidationError { .. } | Self::QuotaExceeded(_) | Self::UnknownError(_) => {
                RecoveryStrategy::NoRecovery
            }
        }
    }

    /// Map an HTTP error status (and its body) into the taxonomy
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        // Backend error codes win over the bare status
        if let Some(err) = Self::from_backend_code(body) {
            return err;
        }

        match status {
            StatusCode::UNAUTHORIZED => Self::AuthenticationExpired,
            StatusCode::FORBIDDEN => Self::PermissionDenied("remote".to_string()),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Self::validation("request", non_empty_or(body, status.as_str()))
            }
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimitExceeded,
            StatusCode::INSUFFICIENT_STORAGE | StatusCode::PAYLOAD_TOO_LARGE => {
                Self::QuotaExceeded("remote_storage".to_string())
            }
            StatusCode::REQUEST_TIMEOUT => Self::ServerUnavailable,
            s if s.is_server_error() => Self::ServerUnavailable,
            s => Self::UnknownError(format!("{}: {}", s, body)),
        }
    }

    /// Map a free-form error message into the taxonomy.
    ///
    /// Recognises the document store's status codes; anything else is unknown.
    pub fn from_message(message: &str) -> Self {
        Self::from_backend_code(message).unwrap_or_else(|| Self::UnknownError(message.to_string()))
    }

    fn from_backend_code(message: &str) -> Option<Self> {
        if message.contains("PERMISSION_DENIED") {
            Some(Self::PermissionDenied("document_store".to_string()))
        } else if message.contains("QUOTA_EXCEEDED") {
            Some(Self::QuotaExceeded("document_store".to_string()))
        } else if message.contains("UNAUTHENTICATED") {
            Some(Self::AuthenticationExpired)
        } else if message.contains("RESOURCE_EXHAUSTED") {
            Some(Self::RateLimitExceeded)
        } else if message.contains("UNAVAILABLE") {
            Some(Self::ServerUnavailable)
        } else if message.contains("DATA_LOSS") {
            Some(Self::DataCorruption("document_store".to_string()))
        } else {
            None
        }
    }
}

fn non_empty_or(body: &str, fallback: &str) -> String {
    if body.trim().is_empty() {
        fallback.to_string()
    } else {
        body.trim().to_string()
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::ServerUnavailable
        } else if e.is_connect() || e.is_request() {
            Self::NetworkUnavailable
        } else if e.is_decode() || e.is_body() {
            Self::DataCorruption("response_body".to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status, "")
        } else {
            Self::UnknownError(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::DataCorruption(format!("json: {}", e))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::NetworkUnavailable.is_retryable());
        assert!(SyncError::ServerUnavailable.is_retryable());
        assert!(SyncError::RateLimitExceeded.is_retryable());

        assert!(!SyncError::AuthenticationExpired.is_retryable());
        assert!(!SyncError::PermissionDenied("x".into()).is_retryable());
        assert!(!SyncError::validation("year", "bad").is_retryable());
        assert!(!SyncError::DataCorruption("x".into()).is_retryable());
        assert!(!SyncError::QuotaExceeded("x".into()).is_retryable());
        assert!(!SyncError::UnknownError("boom".into()).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            SyncError::from_status(StatusCode::UNAUTHORIZED, ""),
            SyncError::AuthenticationExpired
        );
        assert!(matches!(
            SyncError::from_status(StatusCode::FORBIDDEN, ""),
            SyncError::PermissionDenied(_)
        ));
        assert_eq!(
            SyncError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            SyncError::RateLimitExceeded
        );
        assert_eq!(
            SyncError::from_status(StatusCode::SERVICE_UNAVAILABLE, "down"),
            SyncError::ServerUnavailable
        );
        assert!(matches!(
            SyncError::from_status(StatusCode::INSUFFICIENT_STORAGE, ""),
            SyncError::QuotaExceeded(_)
        ));

        match SyncError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "content too long") {
            SyncError::ValidationError { field, message } => {
                assert_eq!(field, "request");
                assert_eq!(message, "content too long");
            }
            other => panic!("unexpected mapping: {:?}", other),
        }
    }

    #[test]
    fn test_backend_code_overrides_status() {
        let err = SyncError::from_status(
            StatusCode::BAD_REQUEST,
            r#"{"error":"RESOURCE_EXHAUSTED: slow down"}"#,
        );
        assert_eq!(err, SyncError::RateLimitExceeded);
    }

    #[test]
    fn test_message_mapping() {
        assert!(matches!(
            SyncError::from_message("PERMISSION_DENIED: Access denied"),
            SyncError::PermissionDenied(_)
        ));
        assert!(matches!(
            SyncError::from_message("QUOTA_EXCEEDED"),
            SyncError::QuotaExceeded(_)
        ));
        assert_eq!(
            SyncError::from_message("UNAUTHENTICATED"),
            SyncError::AuthenticationExpired
        );
        assert_eq!(
            SyncError::from_message("UNAVAILABLE: backend restarting"),
            SyncError::ServerUnavailable
        );
        assert!(matches!(
            SyncError::from_message("DATA_LOSS"),
            SyncError::DataCorruption(_)
        ));
        assert_eq!(
            SyncError::from_message("something odd"),
            SyncError::UnknownError("something odd".to_string())
        );
    }

    #[test]
    fn test_recovery_strategy() {
        assert_eq!(
            SyncError::NetworkUnavailable.recovery_strategy(),
            RecoveryStrategy::RetryWithBackoff
        );
        assert_eq!(
            SyncError::AuthenticationExpired.recovery_strategy(),
            RecoveryStrategy::RequireReauth
        );
        assert_eq!(
            SyncError::DataCorruption("x".into()).recovery_strategy(),
            RecoveryStrategy::FallbackToCache
        );
        assert_eq!(
            SyncError::UnknownError("x".into()).recovery_strategy(),
            RecoveryStrategy::NoRecovery
        );

        assert!(RecoveryStrategy::RetryWithBackoff.serves_cache());
        assert!(RecoveryStrategy::FallbackToCache.serves_cache());
        assert!(!RecoveryStrategy::RequireReauth.serves_cache());
    }
}
