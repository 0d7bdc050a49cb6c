//! Clustering adapter: reorders a collection by semantic cluster.
//!
//! Wraps a [`ClusteringService`] with the cluster-count heuristic, the single
//! retry when the service has fewer embeddings than `k`, and the bucket for
//! ids the service could not place.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use lexmill_core::{defaults, ClusterRequest, ClusterResponse, ClusteringService, Error};

static N_FOUND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"k must be <= n_found \(n=(\d+)\)").expect("valid regex"));

/// Cluster count heuristic: `clamp(round(sqrt(n)), 2, 12)`.
pub fn default_k(n: usize) -> usize {
    ((n as f64).sqrt().round() as usize).clamp(defaults::CLUSTER_K_MIN, defaults::CLUSTER_K_MAX)
}

/// Extract `K` from a `k must be <= n_found (n=K)` message.
pub fn parse_n_found(message: &str) -> Option<usize> {
    N_FOUND
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// One id and its cluster number (1-based; `k + 1` is the unclustered bucket).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSlot {
    pub id: i64,
    pub cluster: usize,
}

/// Result of a clustering attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterOutcome {
    /// Every input id, grouped by ascending cluster, input order kept within a cluster.
    Clustered {
        slots: Vec<ClusterSlot>,
        /// `k` of the successful call.
        k: usize,
        /// Whether a smaller `k` had to be retried.
        retried: bool,
    },
    /// Clustering was skipped; render the collection as is.
    Unavailable { reason: String },
}

impl ClusterOutcome {
    pub fn is_clustered(&self) -> bool {
        matches!(self, ClusterOutcome::Clustered { .. })
    }

    /// Ids placed in the unclustered bucket.
    pub fn unclustered(&self) -> Vec<i64> {
        match self {
            ClusterOutcome::Clustered { slots, k, .. } => slots
                .iter()
                .filter(|s| s.cluster == k + 1)
                .map(|s| s.id)
                .collect(),
            ClusterOutcome::Unavailable { .. } => Vec::new(),
        }
    }
}

/// Adapter over a remote clustering service.
#[derive(Clone)]
pub struct ClusteringAdapter {
    service: Arc<dyn ClusteringService>,
}

impl ClusteringAdapter {
    pub fn new(service: Arc<dyn ClusteringService>) -> Self {
        Self { service }
    }

    /// Cluster `ids`, using `k` when given and the heuristic otherwise.
    ///
    /// Never fails: service errors come back as [`ClusterOutcome::Unavailable`].
    pub async fn cluster(&self, ids: &[i64], k: Option<usize>) -> ClusterOutcome {
        let mut seen = HashSet::with_capacity(ids.len());
        let ids: Vec<i64> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        let n = ids.len();
        if n < 2 {
            return ClusterOutcome::Unavailable {
                reason: "fewer than two items to cluster".into(),
            };
        }
        let k = k.unwrap_or_else(|| default_k(n)).clamp(2, n);

        let (response, k, retried) = match self.call(&ids, k).await {
            Ok(resp) => match resp.n_found {
                Some(found) if found < k => match self.retry(&ids, k, found).await {
                    Ok((resp, k)) => (resp, k, true),
                    Err(reason) => return ClusterOutcome::Unavailable { reason },
                },
                _ => (resp, k, false),
            },
            Err(e) => match parse_n_found(&e.to_string()) {
                Some(found) => match self.retry(&ids, k, found).await {
                    Ok((resp, k)) => (resp, k, true),
                    Err(reason) => return ClusterOutcome::Unavailable { reason },
                },
                None => {
                    warn!(
                        subsystem = "jobs",
                        component = "clustering",
                        op = "cluster",
                        error = %e,
                        "Clustering failed, rendering unclustered"
                    );
                    return ClusterOutcome::Unavailable {
                        reason: e.to_string(),
                    };
                }
            },
        };

        let slots = order_slots(&ids, &response, k);
        debug!(
            subsystem = "jobs",
            component = "clustering",
            op = "cluster",
            n,
            k,
            retried,
            unclustered = slots.iter().filter(|s| s.cluster == k + 1).count(),
            "Clustered collection"
        );
        ClusterOutcome::Clustered { slots, k, retried }
    }

    async fn call(&self, ids: &[i64], k: usize) -> Result<ClusterResponse, Error> {
        self.service
            .cluster(&ClusterRequest {
                entity_ids: ids.to_vec(),
                k,
                seed: defaults::CLUSTER_SEED,
                max_iters: defaults::CLUSTER_MAX_ITERS,
            })
            .await
    }

    async fn retry(
        &self,
        ids: &[i64],
        k: usize,
        n_found: usize,
    ) -> Result<(ClusterResponse, usize), String> {
        if n_found < 2 {
            return Err(format!("only {n_found} embeddings found"));
        }
        let k = k.min(n_found);
        debug!(
            subsystem = "jobs",
            component = "clustering",
            op = "cluster",
            n_found,
            k,
            "Retrying clustering with smaller k"
        );
        self.call(ids, k)
            .await
            .map(|resp| (resp, k))
            .map_err(|e| e.to_string())
    }
}

/// Group `ids` by assigned cluster. Cluster numbers from the service are
/// renumbered 1..=m in ascending order; unassigned ids go to `k + 1`.
fn order_slots(ids: &[i64], response: &ClusterResponse, k: usize) -> Vec<ClusterSlot> {
    let wanted: HashSet<i64> = ids.iter().copied().collect();
    let raw: HashMap<i64, usize> = response
        .assignments
        .iter()
        .filter(|a| wanted.contains(&a.id))
        .map(|a| (a.id, a.cluster))
        .collect();
    let renumber: HashMap<usize, usize> = raw
        .values()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .enumerate()
        .map(|(i, c)| (c, (i + 1).min(k)))
        .collect();

    let mut buckets: BTreeMap<usize, Vec<i64>> = BTreeMap::new();
    for id in ids {
        let cluster = raw
            .get(id)
            .and_then(|c| renumber.get(c))
            .copied()
            .unwrap_or(k + 1);
        buckets.entry(cluster).or_default().push(*id);
    }
    buckets
        .into_iter()
        .flat_map(|(cluster, ids)| ids.into_iter().map(move |id| ClusterSlot { id, cluster }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexmill_core::ClusterAssignment;
    use lexmill_inference::mock::MockClusteringService;

    #[test]
    fn test_default_k() {
        assert_eq!(default_k(1), 2);
        assert_eq!(default_k(9), 3);
        assert_eq!(default_k(10), 3);
        assert_eq!(default_k(30), 5);
        assert_eq!(default_k(1000), 12);
    }

    #[test]
    fn test_parse_n_found() {
        assert_eq!(parse_n_found("HTTP 422: k must be <= n_found (n=4)"), Some(4));
        assert_eq!(parse_n_found("something else"), None);
    }

    #[test]
    fn test_order_slots_groups_and_buckets() {
        let response = ClusterResponse {
            assignments: vec![
                ClusterAssignment { id: 3, cluster: 0 },
                ClusterAssignment { id: 1, cluster: 1 },
                ClusterAssignment { id: 2, cluster: 0 },
                ClusterAssignment { id: 99, cluster: 0 },
            ],
            n_found: Some(3),
        };
        let slots = order_slots(&[1, 2, 3, 4], &response, 2);
        let pairs: Vec<(i64, usize)> = slots.iter().map(|s| (s.id, s.cluster)).collect();
        assert_eq!(pairs, vec![(2, 1), (3, 1), (1, 2), (4, 3)]);
    }

    #[tokio::test]
    async fn test_k_exceeds_embeddings_retries_once() {
        let service = Arc::new(MockClusteringService::new().with_embeddings([1, 2, 3, 4]));
        let adapter = ClusteringAdapter::new(service.clone());
        let ids: Vec<i64> = (1..=10).collect();

        let outcome = adapter.cluster(&ids, Some(6)).await;

        let requests = service.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].k, 6);
        assert_eq!(requests[1].k, 4);
        match &outcome {
            ClusterOutcome::Clustered { slots, k, retried } => {
                assert_eq!(*k, 4);
                assert!(*retried);
                let mut covered: Vec<i64> = slots.iter().map(|s| s.id).collect();
                covered.sort();
                assert_eq!(covered, ids);
            }
            other => panic!("expected clustered, got {other:?}"),
        }
        assert_eq!(outcome.unclustered(), vec![5, 6, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_too_few_embeddings_is_unavailable() {
        let service = Arc::new(MockClusteringService::new().with_embeddings([1]));
        let adapter = ClusteringAdapter::new(service.clone());
        let outcome = adapter.cluster(&[1, 2, 3], None).await;
        assert!(!outcome.is_clustered());
        assert_eq!(service.call_count(), 1);
    }

    #[tokio::test]
    async fn test_single_item_short_circuits() {
        let service = Arc::new(MockClusteringService::new());
        let adapter = ClusteringAdapter::new(service.clone());
        assert!(!adapter.cluster(&[7], None).await.is_clustered());
        assert_eq!(service.call_count(), 0);
    }

    #[tokio::test]
    async fn test_other_errors_are_unavailable() {
        let service = Arc::new(MockClusteringService::new().failing("connection refused"));
        let adapter = ClusteringAdapter::new(service);
        match adapter.cluster(&[1, 2, 3], None).await {
            ClusterOutcome::Unavailable { reason } => assert!(reason.contains("connection refused")),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_k_clamped_to_n() {
        let service = Arc::new(MockClusteringService::new());
        let adapter = ClusteringAdapter::new(service.clone());
        let outcome = adapter.cluster(&[1, 2, 3], Some(50)).await;
        assert!(outcome.is_clustered());
        assert_eq!(service.requests()[0].k, 3);
    }
}
