//! Error type definitions for the IPTV gateway
//!
//! Two layers: `AppError` covers configuration, database and web plumbing;
//! `StreamError` carries the stream-request outcomes that map onto HTTP
//! statuses for downstream clients.

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Outcome of a stream request or of a single variant attempt.
///
/// The surface strings are not contractual; the variants are. Handlers map
/// these onto response statuses, and the attachment loop decides per kind
/// whether the next variant is worth trying.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("channel {0} not found")]
    ChannelNotFound(i64),

    #[error("invalid credentials")]
    UserInvalid,

    #[error("account expired")]
    AccountExpired,

    #[error("user {username} at connection limit ({max})")]
    UserAtCapacity { username: String, max: i64 },

    #[error("source {source_id} at capacity ({max} streams)")]
    SourceAtCapacity { source_id: i64, max: i64 },

    #[error("upstream unreachable: {message}")]
    UpstreamUnreachable { message: String },

    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16 },

    #[error("upstream stalled (no bytes within read window)")]
    UpstreamStalled,

    #[error("upstream request cancelled")]
    UpstreamCancelled,

    #[error("reconnect budget exhausted")]
    MaxReconnectsExceeded,

    #[error("all {attempts} variant(s) failed")]
    AllVariantsFailed { attempts: usize },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<AppError> for StreamError {
    fn from(e: AppError) -> Self {
        StreamError::Internal {
            message: e.to_string(),
        }
    }
}

impl StreamError {
    /// HTTP status this error surfaces as when it terminates a request.
    pub fn http_status(&self) -> u16 {
        match self {
            StreamError::ChannelNotFound(_) => 404,
            StreamError::UserInvalid => 401,
            StreamError::AccountExpired => 403,
            StreamError::UserAtCapacity { .. } => 429,
            StreamError::SourceAtCapacity { .. } => 503,
            StreamError::AllVariantsFailed { .. } => 502,
            StreamError::UpstreamUnreachable { .. }
            | StreamError::UpstreamStatus { .. }
            | StreamError::UpstreamStalled
            | StreamError::UpstreamCancelled
            | StreamError::MaxReconnectsExceeded => 502,
            StreamError::Internal { .. } => 500,
        }
    }

    /// Whether the attachment loop should move on to the next variant after
    /// this failure. Capacity and upstream faults are variant-local; user
    /// and credential faults are not.
    pub fn is_variant_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::SourceAtCapacity { .. }
                | StreamError::UpstreamUnreachable { .. }
                | StreamError::UpstreamStatus { .. }
                | StreamError::UpstreamStalled
        )
    }

    /// Optional upstream HTTP status recorded alongside failed attempts.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            StreamError::UpstreamStatus { status } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(StreamError::ChannelNotFound(9).http_status(), 404);
        assert_eq!(StreamError::UserInvalid.http_status(), 401);
        assert_eq!(StreamError::AccountExpired.http_status(), 403);
        assert_eq!(
            StreamError::UserAtCapacity {
                username: "u".into(),
                max: 1
            }
            .http_status(),
            429
        );
        assert_eq!(
            StreamError::SourceAtCapacity {
                source_id: 1,
                max: 2
            }
            .http_status(),
            503
        );
        assert_eq!(StreamError::AllVariantsFailed { attempts: 3 }.http_status(), 502);
    }

    #[test]
    fn variant_retry_policy() {
        assert!(StreamError::UpstreamStatus { status: 502 }.is_variant_retryable());
        assert!(StreamError::SourceAtCapacity {
            source_id: 1,
            max: 1
        }
        .is_variant_retryable());
        assert!(!StreamError::UserInvalid.is_variant_retryable());
        assert!(!StreamError::UserAtCapacity {
            username: "u".into(),
            max: 1
        }
        .is_variant_retryable());
        assert!(!StreamError::ChannelNotFound(1).is_variant_retryable());
    }
}
