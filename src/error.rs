use thiserror::Error;

use crate::models::AccessBlocked;

/// Errors produced by the Kinin API client
#[derive(Debug, Error)]
pub enum KininError {
    /// No bearer token available; raised before any request is sent
    #[error("{0}")]
    AuthMissing(String),

    /// The account is not entitled to use the service (distinguished 403)
    #[error("access_blocked")]
    AccessBlocked(AccessBlocked),

    #[error("API error {status}: {detail}")]
    Api { status: u16, detail: String },

    /// Response body could not be decoded; carries the raw text
    #[error("Failed to decode response body: {0}")]
    Decode(String),

    #[error("{0}")]
    Validation(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Local store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KininError {
    pub fn is_access_blocked(&self) -> bool {
        matches!(self, KininError::AccessBlocked(_))
    }

    pub fn is_auth_missing(&self) -> bool {
        matches!(self, KininError::AuthMissing(_))
    }

    /// Text for the dismissible top-level error banner.
    ///
    /// Access-blocked errors switch the whole UI into the restricted view
    /// instead, so they never produce a banner.
    pub fn banner_message(&self) -> Option<String> {
        match self {
            KininError::AccessBlocked(_) => None,
            other => Some(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, KininError>;
