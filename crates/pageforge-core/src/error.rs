//! Error types for PageForge

use std::time::Duration;

/// Result type alias using PageForge's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for PageForge operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or malformed request input (API key, content)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The upstream rejected the API key
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Upstream capacity or rate-limit signal
    #[error("upstream overloaded: {0}")]
    Overloaded(String),

    /// A response arrived but no text could be extracted from it
    #[error("no content could be extracted: {0}")]
    Extraction(String),

    /// A generation attempt ran out of its time budget
    #[error("deadline exceeded after {:.2}s", .0.as_secs_f64())]
    DeadlineExceeded(Duration),

    /// Any other upstream failure
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Every generation strategy failed; carries the last cause
    #[error("all generation strategies failed: {0}")]
    Exhausted(Box<Error>),

    /// The client disconnected before generation finished
    #[error("request cancelled by client")]
    Cancelled,

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Network/IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a new authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a new overload error
    pub fn overloaded(msg: impl Into<String>) -> Self {
        Self::Overloaded(msg.into())
    }

    /// Create a new upstream error
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the retry policy should re-attempt after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Overloaded(_))
    }

    /// Errors that end a request immediately instead of advancing the fallback cascade
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::Authentication(_) | Self::Cancelled
        )
    }

    /// Whether this error (or the cause it wraps) is a deadline expiry
    pub fn is_deadline(&self) -> bool {
        match self {
            Self::DeadlineExceeded(_) => true,
            Self::Exhausted(inner) => inner.is_deadline(),
            _ => false,
        }
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Authentication(_) => "authentication",
            Self::Overloaded(_) => "overloaded",
            Self::Extraction(_) => "extraction",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::Upstream(_) => "upstream",
            Self::Exhausted(_) => "exhausted",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::DeadlineExceeded(Duration::ZERO)
        } else {
            // the request URL can carry the API key
            Self::Upstream(err.without_url().to_string())
        }
    }
}
