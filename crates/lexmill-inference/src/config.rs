//! Environment-driven configuration for the provider and clustering clients.

use std::env;
use std::time::Duration;

use lexmill_core::defaults;

/// Default OpenAI-compatible API endpoint.
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// Provider client configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the OpenAI-compatible API (no trailing `/responses`).
    pub base_url: String,
    /// API key; without one the provider is unavailable.
    pub api_key: Option<String>,
    /// Model used when a job does not name one.
    pub default_model: String,
    pub timeout: Duration,
    /// Optional organization header.
    pub organization: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            api_key: None,
            default_model: defaults::LLM_JOB_MODEL.to_string(),
            timeout: Duration::from_secs(defaults::PROVIDER_TIMEOUT_SECS),
            organization: None,
        }
    }
}

impl ProviderConfig {
    /// Read `OPENAI_BASE_URL`, `OPENAI_API_KEY`, `LLM_JOB_MODEL`,
    /// `OPENAI_TIMEOUT` and `OPENAI_ORGANIZATION`.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            base_url: env::var("OPENAI_BASE_URL").unwrap_or(base.base_url),
            api_key: env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            default_model: env::var("LLM_JOB_MODEL").unwrap_or(base.default_model),
            timeout: env::var("OPENAI_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(base.timeout),
            organization: env::var("OPENAI_ORGANIZATION").ok(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// True when an API key is present.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Clustering service client configuration.
#[derive(Debug, Clone)]
pub struct ClusteringConfig {
    /// Endpoint URL; `None` disables clustering.
    pub url: Option<String>,
    pub timeout: Duration,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(defaults::CLUSTER_TIMEOUT_SECS),
        }
    }
}

impl ClusteringConfig {
    /// Read `CLUSTERING_URL` and `CLUSTERING_TIMEOUT`.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            url: env::var("CLUSTERING_URL").ok().filter(|u| !u.is_empty()),
            timeout: env::var("CLUSTERING_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(base.timeout),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.base_url, DEFAULT_OPENAI_URL);
        assert_eq!(config.default_model, defaults::LLM_JOB_MODEL);
        assert!(!config.is_configured());
    }

    #[test]
    fn test_provider_builders() {
        let config = ProviderConfig::default()
            .with_api_key("sk-test")
            .with_base_url("http://localhost:8080/v1")
            .with_timeout(Duration::from_secs(5));
        assert!(config.is_configured());
        assert_eq!(config.base_url, "http://localhost:8080/v1");
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_clustering_disabled_by_default() {
        let config = ClusteringConfig::default();
        assert!(config.url.is_none());
        assert_eq!(config.timeout.as_secs(), defaults::CLUSTER_TIMEOUT_SECS);
    }
}
