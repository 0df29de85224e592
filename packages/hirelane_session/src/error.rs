//! Error types and failure classification for the session client.

use reqwest::StatusCode;

/// Coarse classification of a failed request, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Server,
    Network,
    Other,
}

impl ErrorClass {
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            422 => Self::Validation,
            429 => Self::RateLimited,
            500..=599 => Self::Server,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Network => "network",
            Self::Other => "other",
        }
    }
}

/// Why a refresh attempt failed. Cloneable so every caller waiting on the
/// same in-flight refresh receives the outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh rejected with status {0}")]
    Rejected(u16),

    #[error("refresh request failed: {0}")]
    Network(String),

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Terminal: the credential could not be renewed and has been cleared.
    #[error("session expired")]
    SessionExpired,

    #[error("request failed with status {status}")]
    Status {
        status: StatusCode,
        class: ErrorClass,
        body: String,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::SessionExpired => "session_expired",
            Self::Status { class, .. } => class.as_str(),
            Self::Network(_) => "network",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Decode(_) => "decode",
            Self::Refresh(_) => "refresh_failed",
        }
    }

    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Status { class, .. } => Some(*class),
            Self::Network(_) => Some(ErrorClass::Network),
            _ => None,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Network(e) => e.status(),
            _ => None,
        }
    }
}
