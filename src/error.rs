//! Error taxonomy shared by the store, the policy pipeline and the relay.

use thiserror::Error;

/// Convenience alias used throughout the core.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the relay core.
///
/// The `Display` output of the admission-related variants doubles as the
/// machine-readable reason sent back in `OK` and `CLOSED` messages, so each
/// starts with a NIP-01 prefix.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed id, signature, size or shape. Never retried.
    #[error("invalid: {0}")]
    Validation(String),

    /// Kind not allowed or group role insufficient. Never retried.
    #[error("restricted: {0}")]
    Authorization(String),

    /// The author is publishing faster than the configured budget.
    #[error("rate-limited: {0}")]
    RateLimited(String),

    /// Backing engine unavailable or failing. The client may retry.
    #[error("error: storage failure: {0}")]
    Storage(String),

    /// Stored bytes failed a checksum or could not be decoded.
    #[error("error: corrupt record: {0}")]
    Corruption(String),

    #[error("not found")]
    NotFound,

    #[error("not authorized")]
    NotAuthorized,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Error::Authorization(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Whether a client may reasonably resubmit the same event later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_) | Error::RateLimited(_))
    }
}
