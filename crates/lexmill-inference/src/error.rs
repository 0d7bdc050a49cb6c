//! Classification of provider failures.
//!
//! Maps HTTP status codes and the provider's error body onto
//! [`ProviderErrorKind`], which decides whether the submitter retries.

use serde::Deserialize;

use lexmill_core::{Error, ProviderErrorKind};

/// Error envelope returned by OpenAI-compatible APIs.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub error: ApiError,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl ApiError {
    fn mentions(&self, needle: &str) -> bool {
        self.code.as_deref() == Some(needle) || self.error_type.as_deref() == Some(needle)
    }
}

/// Classify an HTTP status plus parsed error body.
///
/// A 429 carrying `insufficient_quota` is an exhausted quota, not a rate
/// limit, and is never retried.
pub fn classify_status(status: u16, error: &ApiError) -> ProviderErrorKind {
    match status {
        401 => ProviderErrorKind::Authentication,
        403 => ProviderErrorKind::PermissionDenied,
        429 if error.mentions("insufficient_quota") => ProviderErrorKind::QuotaExceeded,
        429 => ProviderErrorKind::RateLimited,
        400 | 413 | 422 => ProviderErrorKind::InvalidRequest,
        404 => ProviderErrorKind::NotFound,
        408 => ProviderErrorKind::Timeout,
        500..=599 => ProviderErrorKind::Server,
        _ => ProviderErrorKind::Unknown,
    }
}

/// Build an [`Error::Provider`] from a non-success response body.
pub fn from_response(status: u16, body: &str) -> Error {
    let parsed: ApiErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let kind = classify_status(status, &parsed.error);
    let message = if parsed.error.message.is_empty() {
        format!("HTTP {}: {}", status, truncate(body, 200))
    } else {
        format!("HTTP {}: {}", status, parsed.error.message)
    };
    Error::provider(kind, message)
}

/// Build an [`Error::Provider`] from a transport-level failure.
pub fn from_reqwest(e: reqwest::Error) -> Error {
    let kind = if e.is_timeout() {
        ProviderErrorKind::Timeout
    } else if e.is_connect() || e.is_request() {
        ProviderErrorKind::Connection
    } else if e.is_decode() {
        ProviderErrorKind::InvalidRequest
    } else if let Some(status) = e.status() {
        classify_status(status.as_u16(), &ApiError::default())
    } else {
        ProviderErrorKind::Unknown
    };
    Error::provider(kind, e.to_string())
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
