//! Error types for lexmill.

use thiserror::Error;

/// Result type alias using lexmill's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failure reported by (or while talking to) the LLM provider.
///
/// The submitter retries only the kinds for which [`is_retryable`](Self::is_retryable)
/// returns true; everything else fails the work item on the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    /// Request rate limit hit (not an exhausted quota).
    RateLimited,
    /// Billing quota exhausted.
    QuotaExceeded,
    /// 5xx from the provider.
    Server,
    /// Request timed out before a response arrived.
    Timeout,
    /// TCP/TLS level failure.
    Connection,
    /// Missing or invalid credentials.
    Authentication,
    /// Credentials valid but not allowed to use the resource.
    PermissionDenied,
    /// Malformed request (schema, prompt too long, unknown parameter).
    InvalidRequest,
    /// Task handle or model unknown to the provider.
    NotFound,
    /// Provider not configured in this process.
    Unavailable,
    /// Anything the classifier did not recognise.
    Unknown,
}

impl ProviderErrorKind {
    /// Human-readable prefix used in `last_error` messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RateLimited => "Rate limit exceeded",
            Self::QuotaExceeded => "Quota exceeded",
            Self::Server => "Provider server error",
            Self::Timeout => "Request timed out",
            Self::Connection => "Connection error",
            Self::Authentication => "Authentication error",
            Self::PermissionDenied => "Permission denied",
            Self::InvalidRequest => "Invalid request",
            Self::NotFound => "Not found at provider",
            Self::Unavailable => "Provider unavailable",
            Self::Unknown => "Provider error",
        }
    }

    /// Whether a submission failing with this kind should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Server | Self::Timeout | Self::Connection
        )
    }
}

/// Core error type for lexmill operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// LLM job not found
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// Work item not found
    #[error("Work item not found: {0}")]
    WorkItemNotFound(i64),

    /// Scope resolved to zero records
    #[error("Scope matched no records")]
    EmptyScope,

    /// Scope exceeds the per-job item ceiling
    #[error("Scope too large: {count} records exceeds the maximum of {max}")]
    ScopeTooLarge { count: i64, max: i64 },

    /// LLM provider call failed
    #[error("{}: {}", .kind.label(), .message)]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    /// Clustering service call failed
    #[error("Clustering error: {0}")]
    Clustering(String),

    /// Template rendering failed
    #[error("Render error: {0}")]
    Render(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a provider error of the given kind.
    pub fn provider(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Error::Provider {
            kind,
            message: message.into(),
        }
    }

    /// Provider classification, if this is a provider error.
    pub fn provider_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            Error::Provider { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// True when the failure is transient and the call may be retried.
    pub fn is_retryable(&self) -> bool {
        self.provider_kind().is_some_and(|k| k.is_retryable())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
