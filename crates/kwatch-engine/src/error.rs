//! Engine-wide error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the notification pipeline and its registries.
#[derive(Error, Debug)]
pub enum Error {
    /// A regex subscription failed to compile. Rejected at subscribe time,
    /// so malformed patterns never reach the matcher.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A per-user ceiling was hit (subscription count or similar).
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The user's rolling notification ceiling was hit. The notification is
    /// dropped and counted, never retried.
    #[error("rate limited: user {0} exceeded the notification ceiling")]
    RateLimited(i64),

    /// The external send interface failed in a retryable way.
    #[error("transient send failure: {0}")]
    TransientSend(String),

    /// The external send interface rejected the notification permanently.
    #[error("permanent send failure: {0}")]
    PermanentSend(String),

    /// A single pattern evaluation exceeded its time budget. The subscription
    /// is skipped for this message; other subscriptions are unaffected.
    #[error("match timed out after {budget_ms}ms for pattern '{pattern}'")]
    MatchTimeout { pattern: String, budget_ms: u64 },

    /// The (owner, pattern, kind) tuple is already registered.
    #[error("duplicate subscription: {0}")]
    DuplicateSubscription(String),

    /// No subscription matched the given owner/pattern.
    #[error("subscription not found: {0}")]
    NotFound(String),

    /// Serialization error (subscriptions at rest).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors (file-backed store).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<crate::sender::SendError> for Error {
    fn from(err: crate::sender::SendError) -> Self {
        match err {
            crate::sender::SendError::Transient(msg) => Error::TransientSend(msg),
            crate::sender::SendError::Permanent(msg) => Error::PermanentSend(msg),
        }
    }
}

impl Error {
    /// Create an invalid-pattern error.
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Create a quota-exceeded error.
    pub fn quota(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
