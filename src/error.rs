//! Error types for each layer of the crate.

use std::time::Duration;
use thiserror::Error;

/// Local persistence failures (SQLite queue, settings, keyring).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("offline queue is full ({limit} actions); the action was not saved")]
    QuotaExceeded { limit: usize },

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("pending action {0} not found")]
    NotFound(String),

    #[error("corrupt queue row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("credential store error: {0}")]
    Credential(String),

    #[error("failed to prepare data directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Outcome of a failed backend call, classified for retry decisions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("cannot reach backend: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("session is not authorized (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("backend is busy, retry later (HTTP 429)")]
    Backpressure { retry_after_secs: Option<u64> },

    #[error("backend server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("invalid response from backend: {0}")]
    InvalidResponse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Map a non-success HTTP status to its error class.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => ApiError::Unauthorized { status },
            408 => ApiError::Network(format!("request timeout (HTTP 408): {message}")),
            429 => ApiError::Backpressure {
                retry_after_secs: None,
            },
            s if s >= 500 => ApiError::Server { status: s, message },
            s => ApiError::Rejected { status: s, message },
        }
    }

    /// Network failures, timeouts and server errors are worth replaying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_)
                | ApiError::Timeout(_)
                | ApiError::Server { .. }
                | ApiError::Backpressure { .. }
                | ApiError::InvalidResponse(_)
        )
    }
}

/// Push permission/token lifecycle failures. A declined prompt is not one.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("push provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode push token record: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
