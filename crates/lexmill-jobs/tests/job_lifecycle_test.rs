//! End-to-end job lifecycle against in-memory stores and the mock provider.
//!
//! Covers:
//! - Flag job from creation to completion, with one changeset per real change
//! - Re-running a batch never submits an item twice
//! - Concurrent poll passes converge on the same counters
//! - Cancellation while items are in flight, including during apply
//! - Apply outcomes recorded on the item
//! - Empty completions, unparseable output and webhooks
//! - Scope guards at creation time

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{drain, flag_request, motion_lexicon, Harness, FLAG_NO, FLAG_YES};
use lexmill_db::{MemoryChangesets, MemoryJobStore};
use lexmill_inference::mock::MockProvider;
use lexmill_jobs::{
    ChangesetSink, CreateJobRequest, Engine, Error, JobConfig, JobEvent, JobListFilter, JobScope,
    JobService, JobStatus, JobStore, JobType, PollConfig, ProposedCreate, ProposedUpdate,
    ServiceConfig, TargetKind, TargetRef, WorkItemStatus,
};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn test_flag_job_runs_to_completion() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let mut events = h.events();

    let job = h.service.create(flag_request(&["run.v.01", "2", "3"])).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.counters.total, 3);
    assert_eq!(job.label.as_deref(), Some("archaic sweep"));

    let items = h.items(job.id).await;
    let prompts: Vec<&str> = items
        .iter()
        .map(|i| i.request_payload.prompt.as_str())
        .collect();
    assert!(prompts.contains(&"Is 'run' (verb) archaic?"));
    assert!(prompts.contains(&"Is 'walk' (verb) archaic?"));

    let batch = h.service.submit_batch(job.id, None).await.unwrap();
    assert_eq!(batch.submitted, 3);
    assert_eq!(batch.failed, 0);
    assert_eq!(batch.remaining, 0);
    let job_after_submit = h.service.get(job.id, None, 0).await.unwrap().job;
    assert_eq!(job_after_submit.status, JobStatus::Running);
    assert_eq!(job_after_submit.counters.submitted, 3);

    let submission = &h.provider.submissions()[0];
    assert_eq!(submission.schema_name, "flag_result");
    assert_eq!(submission.metadata["job_id"], job.id.to_string());

    let tasks = h.tasks(job.id).await;
    h.provider.complete(&tasks[&TargetRef::Entry(1)], FLAG_NO);
    h.provider.complete(&tasks[&TargetRef::Entry(2)], FLAG_YES);
    h.provider.complete(&tasks[&TargetRef::Entry(3)], FLAG_NO);

    let done = h.service.refresh(job.id, None).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.counters.processed, 3);
    assert_eq!(done.counters.succeeded, 3);
    assert_eq!(done.counters.flagged, 1);
    assert!(done.completed_at.is_some());
    assert!(done.has_unseen_updates);

    // Only the newly flagged entry produces a proposal.
    let changesets = h.changesets.for_job(job.id).await;
    assert_eq!(changesets.len(), 1);
    let cs = &changesets[0];
    assert_eq!(cs.entity_id, Some(2));
    assert_eq!(cs.proposed["flagged"], json!(true));
    assert_eq!(cs.proposed["flagged_reason"], json!("archaic"));
    assert_eq!(cs.submitted_by, format!("llm_job:{}", job.id));
    assert_eq!(cs.comments.len(), 1);
    assert_eq!(cs.comments[0].1, "Rare since 1900.");

    let flagged_item = h
        .items(job.id)
        .await
        .into_iter()
        .find(|i| i.target == TargetRef::Entry(2))
        .unwrap();
    assert!(flagged_item.flagged);
    assert_eq!(flagged_item.confidence, Some(0.92));
    assert!(flagged_item.usage.is_some());
    let response = flagged_item.response_payload.as_ref().unwrap();
    assert_eq!(response["result"]["flagged"], json!(true));
    assert_eq!(response["apply"]["changesets"], json!([cs.id]));
    assert_eq!(response["apply"]["skipped"], json!([]));

    let events = drain(&mut events);
    assert!(matches!(events.first(), Some(JobEvent::JobCreated { total: 3, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, JobEvent::BatchSubmitted { submitted: 3, .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        JobEvent::JobFinished {
            status: JobStatus::Completed,
            ..
        }
    )));

    h.service.mark_seen(job.id).await.unwrap();
    assert!(!h.service.get(job.id, None, 0).await.unwrap().job.has_unseen_updates);
}

#[tokio::test]
async fn test_resubmitting_a_batch_is_idempotent() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let job = h.service.create(flag_request(&["1", "2", "3", "4"])).await.unwrap();

    let first = h.service.submit_batch(job.id, Some(3)).await.unwrap();
    assert_eq!(first.submitted, 3);
    assert_eq!(first.remaining, 1);

    let second = h.service.submit_batch(job.id, Some(3)).await.unwrap();
    assert_eq!(second.submitted, 1);
    assert_eq!(second.remaining, 0);

    let third = h.service.submit_batch(job.id, Some(3)).await.unwrap();
    assert_eq!(third.submitted, 0);
    assert_eq!(h.provider.submit_count(), 4);

    let tasks = h.tasks(job.id).await;
    assert_eq!(tasks.len(), 4);
    let mut ids: Vec<&String> = tasks.values().collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}

#[tokio::test]
async fn test_concurrent_refresh_converges() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let job = h.service.create(flag_request(&["1", "2", "3", "4", "5"])).await.unwrap();
    h.service.submit_batch(job.id, None).await.unwrap();
    for task in h.tasks(job.id).await.values() {
        h.provider.complete(task, FLAG_YES);
    }

    let (a, b) = tokio::join!(
        h.service.refresh(job.id, None),
        h.service.refresh(job.id, None)
    );
    a.unwrap();
    b.unwrap();

    let job = h.service.refresh(job.id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.total, 5);
    assert_eq!(job.counters.processed, 5);
    assert_eq!(job.counters.succeeded, 5);
    assert_eq!(job.counters.flagged, 5);
    // Each item is applied once even when both passes saw it complete.
    assert_eq!(h.changesets.for_job(job.id).await.len(), 5);
}

#[tokio::test]
async fn test_cancel_mid_flight_keeps_submitted_results_without_changesets() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let mut events = h.events();
    let job = h.service.create(flag_request(&["1", "2", "3", "4", "5"])).await.unwrap();

    let batch = h.service.submit_batch(job.id, Some(2)).await.unwrap();
    assert_eq!(batch.submitted, 2);
    assert_eq!(batch.remaining, 3);

    let cancelled = h.service.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.counters.processed, 3);
    assert!(cancelled.cancelled_at.is_some());
    assert!(h.provider.cancelled().is_empty());

    let items = h.items(job.id).await;
    assert_eq!(
        items
            .iter()
            .filter(|i| i.status == WorkItemStatus::Skipped)
            .count(),
        3
    );

    // Cancelling again is a no-op; submitting does nothing.
    assert_eq!(h.service.cancel(job.id).await.unwrap().status, JobStatus::Cancelled);
    let after = h.service.submit_batch(job.id, None).await.unwrap();
    assert_eq!(after.submitted, 0);
    assert_eq!(h.provider.submit_count(), 2);

    for task in h.tasks(job.id).await.values() {
        h.provider.complete(task, FLAG_YES);
    }
    let job = h.service.refresh(job.id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.counters.processed, 5);
    assert_eq!(job.counters.succeeded, 2);
    assert!(h.changesets.for_job(job.id).await.is_empty());

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, JobEvent::JobCancelled { .. })));
    assert!(!events.iter().any(|e| matches!(e, JobEvent::JobFinished { .. })));
}

/// Sink that lets a cancel complete right before the first changeset lands,
/// the way a concurrent `cancel` can interleave with a poll pass.
struct CancelOnFirstProposal {
    store: Arc<MemoryJobStore>,
    inner: Arc<MemoryChangesets>,
    fired: AtomicBool,
}

#[async_trait]
impl ChangesetSink for CancelOnFirstProposal {
    async fn create_from_update(&self, update: ProposedUpdate) -> lexmill_jobs::Result<i64> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.store.cancel_job(update.job_id).await?;
            self.inner.discard_by_job(update.job_id).await?;
        }
        self.inner.create_from_update(update).await
    }

    async fn create_from_create(&self, create: ProposedCreate) -> lexmill_jobs::Result<i64> {
        self.inner.create_from_create(create).await
    }

    async fn add_comment(&self, changeset_id: i64, author: &str, text: &str) -> lexmill_jobs::Result<()> {
        self.inner.add_comment(changeset_id, author, text).await
    }

    async fn discard_by_job(&self, job_id: Uuid) -> lexmill_jobs::Result<u64> {
        self.inner.discard_by_job(job_id).await
    }
}

#[tokio::test]
async fn test_cancel_during_apply_retracts_changesets() {
    let store = Arc::new(MemoryJobStore::new());
    let changesets = Arc::new(MemoryChangesets::new());
    let provider = Arc::new(MockProvider::new());
    let sink = Arc::new(CancelOnFirstProposal {
        store: store.clone(),
        inner: changesets.clone(),
        fired: AtomicBool::new(false),
    });
    let engine = Engine::new(store.clone(), Arc::new(motion_lexicon()), sink)
        .with_provider(provider.clone());
    let service = JobService::new(engine, ServiceConfig::default());

    let job = service.create(flag_request(&["1", "2"])).await.unwrap();
    service.submit_batch(job.id, None).await.unwrap();
    for item in service.get(job.id, None, 0).await.unwrap().items {
        provider.complete(item.provider_task_id.as_deref().unwrap(), FLAG_YES);
    }

    let job = service.refresh(job.id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.counters.succeeded, 2);

    let recorded = changesets.for_job(job.id).await;
    assert!(!recorded.is_empty());
    assert!(recorded.iter().all(|c| c.discarded));
}

#[tokio::test]
async fn test_apply_outcome_recorded_with_skipped_proposals() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let job = h
        .service
        .create(CreateJobRequest {
            job_type: JobType::Edit,
            scope: JobScope::ById {
                target_kind: TargetKind::Entry,
                ids: vec!["1".into()],
            },
            config: JobConfig::new("Improve '{{lemma}}'").with_editable_fields(["gloss"]),
            label: None,
            created_by: "tester".into(),
        })
        .await
        .unwrap();
    h.service.submit_batch(job.id, None).await.unwrap();

    let tasks = h.tasks(job.id).await;
    h.provider.complete(
        &tasks[&TargetRef::Entry(1)],
        r#"{"edits": [{"field": "gloss", "value": "move fast on foot"},
                      {"field": "lemma", "value": "race"}],
            "new_frame_code": "speed", "confidence": 0.6}"#,
    );
    let done = h.service.refresh(job.id, None).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);

    let item = h.items(job.id).await.remove(0);
    assert_eq!(item.status, WorkItemStatus::Succeeded);
    assert!(item.last_error.is_none());
    let apply = &item.response_payload.unwrap()["apply"];
    assert_eq!(apply["changesets"].as_array().unwrap().len(), 1);
    assert_eq!(
        apply["skipped"],
        json!([
            "field 'lemma' is not editable",
            "frame reassignment to 'speed' not allowed"
        ])
    );

    let recorded = h.changesets.for_job(job.id).await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].proposed.len(), 1);
    assert_eq!(recorded[0].proposed["gloss"], json!("move fast on foot"));
}

#[tokio::test]
async fn test_cancel_at_provider_when_enabled() {
    let h = Harness::with_config(
        motion_lexicon(),
        MockProvider::new(),
        ServiceConfig::default().with_cancel_at_provider(true),
    );
    let job = h.service.create(flag_request(&["1", "2"])).await.unwrap();
    h.service.submit_batch(job.id, None).await.unwrap();

    h.service.cancel(job.id).await.unwrap();
    assert_eq!(h.provider.cancelled().len(), 2);

    let job = h.service.refresh(job.id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.counters.failed, 2);
    assert!(h
        .items(job.id)
        .await
        .iter()
        .all(|i| i.last_error.as_deref() == Some("Cancelled at provider")));
}

#[tokio::test]
async fn test_cancel_finished_job_is_rejected() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let job = h.service.create(flag_request(&["1"])).await.unwrap();
    h.service.submit_batch(job.id, None).await.unwrap();
    for task in h.tasks(job.id).await.values() {
        h.provider.complete(task, FLAG_NO);
    }
    h.service.refresh(job.id, None).await.unwrap();

    let err = h.service.cancel(job.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_empty_output_fails_after_max_polls() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let service = h
        .service
        .clone()
        .with_poll_config(PollConfig::default().with_max_poll_attempts(3));
    let job = service.create(flag_request(&["1"])).await.unwrap();
    service.submit_batch(job.id, None).await.unwrap();
    let task = h.tasks(job.id).await[&TargetRef::Entry(1)].clone();
    h.provider.complete(&task, "   ");

    for expected in 1..=2 {
        let job = service.refresh(job.id, None).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        let item = &h.items(job.id).await[0];
        assert_eq!(item.status, WorkItemStatus::Processing);
        assert_eq!(item.poll_attempts, expected);
    }

    let job = service.refresh(job.id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let item = &h.items(job.id).await[0];
    assert_eq!(item.status, WorkItemStatus::Failed);
    assert_eq!(
        item.last_error.as_deref(),
        Some("Provider returned no output after 3 polls")
    );
}

#[tokio::test]
async fn test_unparseable_output_fails_item() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let job = h.service.create(flag_request(&["1", "2"])).await.unwrap();
    h.service.submit_batch(job.id, None).await.unwrap();
    let tasks = h.tasks(job.id).await;
    h.provider.complete(&tasks[&TargetRef::Entry(1)], "I think it is archaic.");
    h.provider.complete(&tasks[&TargetRef::Entry(2)], FLAG_NO);

    let job = h.service.refresh(job.id, None).await.unwrap();
    // One success and one failure still completes the job.
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.failed, 1);
    assert_eq!(job.counters.succeeded, 1);

    let failed = h
        .items(job.id)
        .await
        .into_iter()
        .find(|i| i.target == TargetRef::Entry(1))
        .unwrap();
    let error = failed.last_error.unwrap();
    assert!(error.starts_with("Could not parse flag result"), "{error}");
    assert!(error.ends_with("raw output: I think it is archaic."), "{error}");
}

#[tokio::test]
async fn test_provider_failure_and_retrieve_errors() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let job = h.service.create(flag_request(&["1", "2"])).await.unwrap();
    h.service.submit_batch(job.id, None).await.unwrap();
    let tasks = h.tasks(job.id).await;
    h.provider.fail(&tasks[&TargetRef::Entry(1)], "content filter");
    h.provider.fail_retrieve(
        &tasks[&TargetRef::Entry(2)],
        lexmill_jobs::ProviderErrorKind::Server,
        "HTTP 503",
    );

    let job = h.service.refresh(job.id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.counters.failed, 1);

    let items = h.items(job.id).await;
    let by_target = |t: TargetRef| items.iter().find(|i| i.target == t).unwrap();
    assert_eq!(
        by_target(TargetRef::Entry(1)).last_error.as_deref(),
        Some("content filter")
    );
    let pending = by_target(TargetRef::Entry(2));
    assert_eq!(pending.status, WorkItemStatus::Processing);
    assert!(pending.last_error.as_deref().unwrap().contains("HTTP 503"));

    h.provider.clear_retrieve_error(&tasks[&TargetRef::Entry(2)]);
    h.provider.complete(&tasks[&TargetRef::Entry(2)], FLAG_NO);
    let job = h.service.refresh(job.id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_webhook_refreshes_single_item() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let job = h.service.create(flag_request(&["1", "2"])).await.unwrap();
    h.service.submit_batch(job.id, None).await.unwrap();
    let tasks = h.tasks(job.id).await;

    assert!(h.service.webhook("task-unknown").await.unwrap().is_none());

    h.provider.complete(&tasks[&TargetRef::Entry(2)], FLAG_YES);
    let job = h
        .service
        .webhook(&tasks[&TargetRef::Entry(2)])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.counters.succeeded, 1);
    assert_eq!(job.counters.flagged, 1);
    assert_eq!(job.status, JobStatus::Running);

    // A duplicate delivery changes nothing.
    let again = h
        .service
        .webhook(&tasks[&TargetRef::Entry(2)])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.counters, job.counters);
    assert_eq!(h.changesets.for_job(job.id).await.len(), 1);
}

#[tokio::test]
async fn test_scope_guards() {
    let h = Harness::with_config(
        motion_lexicon(),
        MockProvider::new(),
        ServiceConfig::default().with_max_items(2),
    );

    let err = h.service.create(flag_request(&["1", "2", "3"])).await.unwrap_err();
    assert!(matches!(err, Error::ScopeTooLarge { count: 3, max: 2 }));

    let err = h.service.create(flag_request(&["999"])).await.unwrap_err();
    assert!(matches!(err, Error::EmptyScope));

    let err = h.service.create(flag_request(&[])).await.unwrap_err();
    assert!(matches!(err, Error::EmptyScope));

    let jobs = h.service.list(&JobListFilter::default()).await.unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn test_soft_deleted_job_disappears() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let job = h.service.create(flag_request(&["1"])).await.unwrap();
    assert_eq!(h.service.list(&JobListFilter::default()).await.unwrap().len(), 1);

    h.service.soft_delete(job.id).await.unwrap();
    assert!(h.service.list(&JobListFilter::default()).await.unwrap().is_empty());
    assert!(matches!(
        h.service.get(job.id, None, 0).await,
        Err(Error::JobNotFound(_))
    ));
    let all = JobListFilter {
        include_deleted: true,
        ..Default::default()
    };
    assert_eq!(h.service.list(&all).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_submit_without_provider_is_unavailable() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let engine = h.engine.clone();
    let bare = lexmill_jobs::JobService::new(
        lexmill_jobs::Engine::new(engine.store, engine.lexicon, engine.changesets),
        ServiceConfig::default(),
    );
    let job = bare.create(flag_request(&["1"])).await.unwrap();
    let err = bare.submit_batch(job.id, None).await.unwrap_err();
    assert!(err.to_string().contains("Provider unavailable"), "{err}");
}
