//! Error types for morsel operations

use crate::{Action, AuthTier};
use std::time::Duration;
use thiserror::Error;

/// Rate limiter errors.
///
/// These are meant to reach the end user ("try again in N seconds"), so
/// they carry enough structure to render a message without string parsing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limited on {action}, retry after {retry_after_secs}s")]
    RateLimited {
        action: Action,
        retry_after_secs: u64,
    },

    #[error("Action {action} is not available to {tier} callers")]
    ActionDisallowed { action: Action, tier: AuthTier },

    #[error("Unknown action: {name}")]
    UnknownAction { name: String },
}

impl RateLimitError {
    /// Build a `RateLimited` error from an exact wait, rounding up to whole
    /// seconds with a floor of one second.
    pub fn rate_limited(action: Action, retry_after: Duration) -> Self {
        let mut secs = retry_after.as_secs();
        if retry_after.subsec_nanos() > 0 {
            secs += 1;
        }
        Self::RateLimited {
            action,
            retry_after_secs: secs.max(1),
        }
    }

    /// Whether the caller may retry the same action later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Seconds to wait before retrying, if the error is retryable.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Search session lifecycle errors.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Search session expired")]
    Expired,

    #[error("Search session already consumed")]
    Consumed,

    #[error("Search session was invalidated")]
    Invalidated,

    #[error("Search session is not active")]
    NotActive,
}

/// Geohash and tile key errors. Internal to the tile index.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeohashError {
    #[error("Geohash precision {0} out of range 1..=12")]
    InvalidPrecision(usize),

    #[error("Invalid geohash character {0:?}")]
    InvalidCharacter(char),

    #[error("Malformed tile key: {0}")]
    MalformedTileKey(String),
}

/// Backing store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {reason}")]
    Backend { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Classification of an upstream provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// The provider did not answer in time.
    Timeout,
    /// Network or provider outage.
    Unavailable,
    /// The provider answered with a rejection status.
    Rejected { status: u16 },
    /// The provider answered with something we could not interpret.
    InvalidResponse,
}

/// A failed upstream call.
///
/// `Clone` so the coalescer can deliver the identical error to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Upstream {operation} failed ({kind:?}): {message}")]
pub struct UpstreamError {
    pub operation: String,
    pub kind: UpstreamErrorKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(
        operation: impl Into<String>,
        kind: UpstreamErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::new(operation, UpstreamErrorKind::Timeout, "request timed out")
    }

    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, UpstreamErrorKind::Unavailable, message)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for the provider-access layer.
#[derive(Debug, Clone, Error)]
pub enum GateError {
    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Upstream(#[from] UpstreamError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Request superseded by a newer request")]
    Cancelled,
}

/// Result type alias for gate operations.
pub type GateResult<T> = Result<T, GateError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_rounds_up_to_whole_seconds() {
        let err = RateLimitError::rate_limited(Action::Search, Duration::from_millis(1500));
        assert_eq!(err.retry_after_secs(), Some(2));

        let err = RateLimitError::rate_limited(Action::Search, Duration::from_secs(3));
        assert_eq!(err.retry_after_secs(), Some(3));
    }

    #[test]
    fn test_rate_limited_has_one_second_floor() {
        let err = RateLimitError::rate_limited(Action::Search, Duration::ZERO);
        assert_eq!(err.retry_after_secs(), Some(1));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_action_disallowed_is_not_retryable() {
        let err = RateLimitError::ActionDisallowed {
            action: Action::Photo,
            tier: AuthTier::Anonymous,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after_secs(), None);
        let msg = err.to_string();
        assert!(msg.contains("photo"));
        assert!(msg.contains("anonymous"));
    }

    #[test]
    fn test_upstream_error_display() {
        let err = UpstreamError::new(
            "fetch_detail",
            UpstreamErrorKind::Rejected { status: 429 },
            "quota exceeded",
        );
        let msg = err.to_string();
        assert!(msg.contains("fetch_detail"));
        assert!(msg.contains("429"));
        assert!(msg.contains("quota exceeded"));
    }

    #[test]
    fn test_gate_error_from_conversions() {
        let err: GateError = SessionError::Consumed.into();
        assert!(matches!(err, GateError::Session(SessionError::Consumed)));

        let err: GateError = UpstreamError::timeout("fetch_tile").into();
        assert!(matches!(err, GateError::Upstream(_)));
    }
}
