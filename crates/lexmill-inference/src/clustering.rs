//! HTTP client for the similarity-clustering service.
//!
//! The service takes `{entity_ids, k, seed, max_iters}` and answers with
//! `{assignments: [{id, cluster}], n_found}`. Failures come back as a
//! non-2xx status whose body carries a `detail` or `error` message; the
//! message text is preserved verbatim so callers can match on it.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use lexmill_core::{ClusterRequest, ClusterResponse, ClusteringService, Error, Result};

use crate::config::ClusteringConfig;

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Clustering over HTTP.
pub struct HttpClusteringService {
    client: Client,
    url: String,
}

impl HttpClusteringService {
    /// Build a client; `Ok(None)` when no URL is configured.
    pub fn new(config: ClusteringConfig) -> Result<Option<Self>> {
        let Some(url) = config.url else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Some(Self { client, url }))
    }

    pub fn from_env() -> Result<Option<Self>> {
        Self::new(ClusteringConfig::from_env())
    }
}

#[async_trait]
impl ClusteringService for HttpClusteringService {
    async fn cluster(&self, request: &ClusterRequest) -> Result<ClusterResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Clustering(format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Clustering(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
            let message = parsed.detail.or(parsed.error).unwrap_or(body);
            return Err(Error::Clustering(format!("HTTP {}: {}", status.as_u16(), message)));
        }

        let parsed: ClusterResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Clustering(format!("Invalid response: {}", e)))?;
        debug!(
            subsystem = "inference",
            component = "clustering",
            op = "cluster",
            requested = request.entity_ids.len(),
            assigned = parsed.assignments.len(),
            k = request.k,
            "Clustering response received"
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(server: &MockServer) -> HttpClusteringService {
        HttpClusteringService::new(ClusteringConfig::default().with_url(server.uri()))
            .unwrap()
            .unwrap()
    }

    fn request(k: usize) -> ClusterRequest {
        ClusterRequest {
            entity_ids: vec![1, 2, 3],
            k,
            seed: 42,
            max_iters: 100,
        }
    }

    #[test]
    fn test_unconfigured_is_none() {
        assert!(HttpClusteringService::new(ClusteringConfig::default())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cluster_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"entity_ids": [1, 2, 3], "k": 2, "seed": 42})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "assignments": [{"id": 1, "cluster": 1}, {"id": 3, "cluster": 2}],
                "n_found": 2
            })))
            .mount(&server)
            .await;

        let resp = service(&server).cluster(&request(2)).await.unwrap();
        assert_eq!(resp.assignments.len(), 2);
        assert_eq!(resp.n_found, Some(2));
    }

    #[tokio::test]
    async fn test_cluster_error_preserves_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(json!({"detail": "k must be <= n_found (n=2)"})),
            )
            .mount(&server)
            .await;

        let err = service(&server).cluster(&request(3)).await.unwrap_err();
        assert!(matches!(err, Error::Clustering(_)));
        assert!(err.to_string().contains("k must be <= n_found (n=2)"));
    }
}
