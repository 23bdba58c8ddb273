//! Error types for ingestion operations

use crate::extraction::ExtractionAttempt;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error types for ingestion operations
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("No {kind} available for {item_id} after {} attempts", .attempts.len())]
    ExtractionExhausted {
        item_id: String,
        kind: &'static str,
        attempts: Vec<ExtractionAttempt>,
    },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// True for errors that no amount of retrying can fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Failure of a single extraction attempt through one identity
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Network, blocking or identity problem; worth retrying on another identity
    #[error("transient: {0}")]
    Transient(String),

    /// The method definitively has nothing for this item
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        // 404s mean the resource is gone for everyone, not just this identity
        if err.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            FetchError::Unavailable(err.to_string())
        } else {
            FetchError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        // Garbled payloads usually come from consent or captcha interstitials
        FetchError::Transient(format!("unparseable response: {}", err))
    }
}
