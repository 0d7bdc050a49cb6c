//! Job flow against the HTTP provider and clustering clients, with both
//! backends served by wiremock.

mod common;

use std::sync::Arc;

use common::{flag_request, motion_lexicon};
use lexmill_db::{MemoryChangesets, MemoryJobStore};
use lexmill_inference::{
    ClusteringConfig, HttpClusteringService, OpenAIProvider, ProviderConfig,
};
use lexmill_jobs::{
    Engine, JobConfig, JobService, JobStatus, ServiceConfig, WorkItemStatus,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service(server: &MockServer) -> (JobService, Arc<MemoryChangesets>) {
    let provider = OpenAIProvider::new(
        ProviderConfig::default()
            .with_base_url(server.uri())
            .with_api_key("sk-test"),
    )
    .unwrap();
    let clustering =
        HttpClusteringService::new(ClusteringConfig::default().with_url(format!("{}/cluster", server.uri())))
            .unwrap()
            .unwrap();
    let changesets = Arc::new(MemoryChangesets::new());
    let engine = Engine::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(motion_lexicon()),
        changesets.clone(),
    )
    .with_provider(Arc::new(provider))
    .with_clustering(Arc::new(clustering));
    (JobService::new(engine, ServiceConfig::default()), changesets)
}

#[tokio::test]
async fn test_flag_job_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "background": true,
            "input": "Is 'run' (verb) archaic?",
            "text": {"format": {"name": "flag_result", "strict": true}}
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "resp_run", "status": "queued"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/responses/resp_run"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "resp_run",
            "status": "completed",
            "output": [{"type": "message", "content": [
                {"type": "output_text", "text": "{\"flagged\": true, \"flagged_reason\": \"dated\", \"confidence\": 0.7}"}
            ]}],
            "usage": {"input_tokens": 80, "output_tokens": 12}
        })))
        .mount(&server)
        .await;

    let (service, changesets) = service(&server);
    let job = service.create(flag_request(&["1"])).await.unwrap();
    assert_eq!(service.submit_batch(job.id, None).await.unwrap().submitted, 1);

    let job = service.refresh(job.id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.flagged, 1);

    let item = &service.get(job.id, None, 0).await.unwrap().items[0];
    assert_eq!(item.provider_task_id.as_deref(), Some("resp_run"));
    assert_eq!(item.usage.unwrap().output_tokens, 12);

    let proposals = changesets.for_job(job.id).await;
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].proposed["flagged_reason"], json!("dated"));
}

#[tokio::test]
async fn test_http_auth_error_fails_item_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Incorrect API key", "type": "invalid_request_error", "code": "invalid_api_key"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (service, _) = service(&server);
    let job = service.create(flag_request(&["1"])).await.unwrap();
    let batch = service.submit_batch(job.id, None).await.unwrap();
    assert_eq!(batch.failed, 1);

    let item = &service.get(job.id, None, 0).await.unwrap().items[0];
    assert_eq!(item.status, WorkItemStatus::Failed);
    let error = item.last_error.as_deref().unwrap();
    assert!(error.starts_with("Authentication error"), "{error}");
}

#[tokio::test]
async fn test_http_clustering_groups_siblings() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cluster"))
        .and(body_partial_json(json!({"entity_ids": [2, 3, 4, 5], "k": 2, "seed": 42})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "assignments": [
                {"id": 2, "cluster": 7},
                {"id": 3, "cluster": 9},
                {"id": 4, "cluster": 7},
                {"id": 5, "cluster": 9}
            ],
            "n_found": 4
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (service, _) = service(&server);
    let mut request = flag_request(&["1"]);
    request.config = JobConfig::new("{% for s in siblings %}- {{ s.lemma }}\n{% endfor %}")
        .with_clustering(Some(2));
    let job = service.create(request).await.unwrap();

    let item = &service.get(job.id, None, 0).await.unwrap().items[0];
    assert_eq!(
        item.request_payload.prompt,
        "Cluster 1:\n- walk\n- jog\nCluster 2:\n- sprint\n- amble\n"
    );
}
