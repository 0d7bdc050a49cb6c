//! Scriptable provider and clustering doubles for deterministic tests.
//!
//! ```rust
//! use lexmill_inference::mock::MockProvider;
//! use lexmill_core::ProviderErrorKind;
//!
//! let provider = MockProvider::new()
//!     .with_submit_error(ProviderErrorKind::Server, "HTTP 500")
//!     .with_submit_error(ProviderErrorKind::Authentication, "HTTP 401");
//! assert_eq!(provider.submit_count(), 0);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use lexmill_core::{
    ClusterAssignment, ClusterRequest, ClusterResponse, ClusteringService, Error, LlmProvider,
    ProviderErrorKind, ProviderTask, ProviderTaskStatus, Result, SubmitRequest, TaskHandle,
    TokenUsage,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ProviderState {
    submit_errors: VecDeque<(ProviderErrorKind, String)>,
    submissions: Vec<SubmitRequest>,
    submit_attempts: usize,
    tasks: HashMap<String, ProviderTask>,
    retrieve_errors: HashMap<String, (ProviderErrorKind, String)>,
    retrieve_count: usize,
    cancelled: Vec<String>,
    next_id: u64,
    failure_rate: f64,
}

/// In-process [`LlmProvider`].
///
/// Submissions succeed with `task-N` handles unless an error was queued with
/// [`with_submit_error`](Self::with_submit_error); queued errors are consumed
/// in order, one per submit call. New tasks report `queued` until scripted
/// with [`complete`](Self::complete), [`fail`](Self::fail) or
/// [`set_status`](Self::set_status).
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<ProviderState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next submit call.
    pub fn with_submit_error(self, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        self.push_submit_error(kind, message);
        self
    }

    /// Fail a random share of submits with a retryable server error.
    /// Queued errors take precedence.
    pub fn with_failure_rate(self, rate: f64) -> Self {
        lock(&self.state).failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn push_submit_error(&self, kind: ProviderErrorKind, message: impl Into<String>) {
        lock(&self.state)
            .submit_errors
            .push_back((kind, message.into()));
    }

    /// Successful submissions, in order.
    pub fn submissions(&self) -> Vec<SubmitRequest> {
        lock(&self.state).submissions.clone()
    }

    /// Successful submissions.
    pub fn submit_count(&self) -> usize {
        lock(&self.state).submissions.len()
    }

    /// Every submit call, including failed ones.
    pub fn submit_attempts(&self) -> usize {
        lock(&self.state).submit_attempts
    }

    pub fn retrieve_count(&self) -> usize {
        lock(&self.state).retrieve_count
    }

    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.state).cancelled.clone()
    }

    /// Mark a task completed with `output`.
    pub fn complete(&self, task_id: &str, output: impl Into<String>) {
        self.update(task_id, |t| {
            t.status = ProviderTaskStatus::Completed;
            t.output = Some(output.into());
            t.usage = Some(TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            });
        });
    }

    /// Mark a task failed with `error`.
    pub fn fail(&self, task_id: &str, error: impl Into<String>) {
        self.update(task_id, |t| {
            t.status = ProviderTaskStatus::Failed;
            t.error = Some(error.into());
        });
    }

    pub fn set_status(&self, task_id: &str, status: ProviderTaskStatus) {
        self.update(task_id, |t| t.status = status);
    }

    /// Make every retrieve of `task_id` fail.
    pub fn fail_retrieve(&self, task_id: &str, kind: ProviderErrorKind, message: impl Into<String>) {
        lock(&self.state)
            .retrieve_errors
            .insert(task_id.to_string(), (kind, message.into()));
    }

    pub fn clear_retrieve_error(&self, task_id: &str) {
        lock(&self.state).retrieve_errors.remove(task_id);
    }

    fn update(&self, task_id: &str, f: impl FnOnce(&mut ProviderTask)) {
        let mut state = lock(&self.state);
        let task = state
            .tasks
            .entry(task_id.to_string())
            .or_insert_with(|| queued_task(task_id));
        f(task);
    }
}

fn should_fail(rate: f64) -> bool {
    use rand::Rng;
    rate > 0.0 && rand::thread_rng().gen::<f64>() < rate
}

fn queued_task(id: &str) -> ProviderTask {
    ProviderTask {
        id: id.to_string(),
        status: ProviderTaskStatus::Queued,
        output: None,
        error: None,
        usage: None,
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn submit(&self, request: &SubmitRequest) -> Result<TaskHandle> {
        let mut state = lock(&self.state);
        state.submit_attempts += 1;
        if let Some((kind, message)) = state.submit_errors.pop_front() {
            return Err(Error::provider(kind, message));
        }
        if should_fail(state.failure_rate) {
            return Err(Error::provider(
                ProviderErrorKind::Server,
                "HTTP 503: simulated failure",
            ));
        }
        state.next_id += 1;
        let id = format!("task-{}", state.next_id);
        state.tasks.insert(id.clone(), queued_task(&id));
        state.submissions.push(request.clone());
        Ok(TaskHandle(id))
    }

    async fn retrieve(&self, handle: &TaskHandle) -> Result<ProviderTask> {
        let mut state = lock(&self.state);
        state.retrieve_count += 1;
        if let Some((kind, message)) = state.retrieve_errors.get(handle.as_str()) {
            return Err(Error::provider(*kind, message.clone()));
        }
        state
            .tasks
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| Error::provider(ProviderErrorKind::NotFound, handle.to_string()))
    }

    async fn cancel(&self, handle: &TaskHandle) -> Result<()> {
        let mut state = lock(&self.state);
        state.cancelled.push(handle.to_string());
        if let Some(task) = state.tasks.get_mut(handle.as_str()) {
            if !matches!(
                task.status,
                ProviderTaskStatus::Completed | ProviderTaskStatus::Failed
            ) {
                task.status = ProviderTaskStatus::Cancelled;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// =============================================================================
// CLUSTERING
// =============================================================================

/// In-process [`ClusteringService`] that behaves like the remote one: it only
/// knows embeddings for some ids and rejects `k` above the number it found.
#[derive(Default)]
pub struct MockClusteringService {
    /// Ids with embeddings; `None` means every id has one.
    known: Option<HashSet<i64>>,
    failure: Option<String>,
    requests: Mutex<Vec<ClusterRequest>>,
}

impl MockClusteringService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict embeddings to `ids`.
    pub fn with_embeddings(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.known = Some(ids.into_iter().collect());
        self
    }

    /// Fail every call with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn requests(&self) -> Vec<ClusterRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl ClusteringService for MockClusteringService {
    async fn cluster(&self, request: &ClusterRequest) -> Result<ClusterResponse> {
        lock(&self.requests).push(request.clone());
        if let Some(ref message) = self.failure {
            return Err(Error::Clustering(message.clone()));
        }

        let found: Vec<i64> = request
            .entity_ids
            .iter()
            .copied()
            .filter(|id| self.known.as_ref().map_or(true, |k| k.contains(id)))
            .collect();
        if request.k > found.len() {
            return Err(Error::Clustering(format!(
                "k must be <= n_found (n={})",
                found.len()
            )));
        }

        // Round-robin over found ids keeps every cluster non-empty.
        let assignments = found
            .iter()
            .enumerate()
            .map(|(i, id)| ClusterAssignment {
                id: *id,
                cluster: i % request.k.max(1) + 1,
            })
            .collect();
        Ok(ClusterResponse {
            assignments,
            n_found: Some(found.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request() -> SubmitRequest {
        SubmitRequest {
            model: "m".into(),
            system: None,
            prompt: "p".into(),
            schema_name: "flag_result".into(),
            schema: serde_json::json!({}),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_full_failure_rate_fails_every_submit() {
        let provider = MockProvider::new().with_failure_rate(1.0);
        for _ in 0..3 {
            let err = provider.submit(&request()).await.unwrap_err();
            assert!(err.is_retryable());
        }
        assert_eq!(provider.submit_count(), 0);
        assert_eq!(provider.submit_attempts(), 3);
    }

    #[tokio::test]
    async fn test_submit_errors_consumed_in_order() {
        let provider = MockProvider::new()
            .with_submit_error(ProviderErrorKind::Server, "HTTP 500")
            .with_submit_error(ProviderErrorKind::Authentication, "HTTP 401");

        let first = provider.submit(&request()).await.unwrap_err();
        let second = provider.submit(&request()).await.unwrap_err();
        let third = provider.submit(&request()).await.unwrap();

        assert_eq!(first.provider_kind(), Some(ProviderErrorKind::Server));
        assert_eq!(second.provider_kind(), Some(ProviderErrorKind::Authentication));
        assert_eq!(third.as_str(), "task-1");
        assert_eq!(provider.submit_attempts(), 3);
        assert_eq!(provider.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_completion() {
        let provider = MockProvider::new();
        let handle = provider.submit(&request()).await.unwrap();
        assert_eq!(
            provider.retrieve(&handle).await.unwrap().status,
            ProviderTaskStatus::Queued
        );
        provider.complete(handle.as_str(), "{}");
        let task = provider.retrieve(&handle).await.unwrap();
        assert_eq!(task.status, ProviderTaskStatus::Completed);
        assert_eq!(task.output.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_mock_clustering_rejects_large_k() {
        let service = MockClusteringService::new().with_embeddings([1, 2, 3, 4]);
        let req = ClusterRequest {
            entity_ids: (1..=10).collect(),
            k: 6,
            seed: 42,
            max_iters: 100,
        };
        let err = service.cluster(&req).await.unwrap_err();
        assert!(err.to_string().contains("k must be <= n_found (n=4)"));

        let ok = service
            .cluster(&ClusterRequest { k: 4, ..req })
            .await
            .unwrap();
        assert_eq!(ok.assignments.len(), 4);
        assert_eq!(service.call_count(), 2);
    }
}
