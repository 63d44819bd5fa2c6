use crate::signal_store::Platform;
use thiserror::Error;

/// Failure talking to an external platform.
///
/// Transient errors may succeed when retried later; permanent ones will not
/// until the identifier or configuration is fixed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("{platform} transient error: {message}")]
    Transient { platform: Platform, message: String },

    #[error("{platform} permanent error: {message}")]
    Permanent { platform: Platform, message: String },
}

impl SourceError {
    pub fn transient(platform: Platform, message: impl Into<String>) -> Self {
        SourceError::Transient {
            platform,
            message: message.into(),
        }
    }

    pub fn permanent(platform: Platform, message: impl Into<String>) -> Self {
        SourceError::Permanent {
            platform,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient { .. })
    }

    pub fn platform(&self) -> Platform {
        match self {
            SourceError::Transient { platform, .. } | SourceError::Permanent { platform, .. } => {
                *platform
            }
        }
    }

    /// Label used for metrics.
    pub fn kind_label(&self) -> &'static str {
        if self.is_transient() {
            "transient"
        } else {
            "permanent"
        }
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(platform: Platform, status: reqwest::StatusCode) -> Self {
        let message = format!("HTTP {}", status);
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            Self::transient(platform, message)
        } else {
            Self::permanent(platform, message)
        }
    }

    /// Network failures, timeouts and unreadable bodies are all worth retrying.
    pub fn from_reqwest(platform: Platform, err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::from_status(platform, status),
            None => Self::transient(platform, err.to_string()),
        }
    }
}
