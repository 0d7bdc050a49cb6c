//! Integration tests for the PostgreSQL job store and lexicon reads.
//!
//! Require a database with the migrations applied; run with
//! `DATABASE_URL=... cargo test -p lexmill-db -- --ignored`.

use lexmill_db::test_fixtures::TestDatabase;
use lexmill_db::{
    CreateJobRequest, EntitySnapshot, FilterExpr, FilterOp, JobConfig, JobScope, JobStatus,
    JobStore, JobType, LexiconSource, NewWorkItem, RequestPayload, TargetKind, TargetRef,
    WorkItemStatus, WorkItemUpdate,
};
use serde_json::json;

fn flag_request(ids: Vec<String>) -> CreateJobRequest {
    CreateJobRequest {
        job_type: JobType::Flag,
        scope: JobScope::ById {
            target_kind: TargetKind::Entry,
            ids,
        },
        config: JobConfig::new("Is {{lemma}} archaic?"),
        label: Some("integration".into()),
        created_by: "integration-test".into(),
    }
}

fn item_for(entry_id: i64) -> NewWorkItem {
    let snapshot = EntitySnapshot::new(TargetRef::Entry(entry_id), "x");
    NewWorkItem {
        target: snapshot.target,
        request_payload: RequestPayload {
            prompt: "prompt".into(),
            variables: Default::default(),
            snapshot,
        },
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_job_lifecycle_recomputes_counters() {
    let test_db = TestDatabase::new().await;
    let store = &test_db.db.jobs;

    let job = store.create_job(flag_request(vec!["1".into(), "2".into()])).await.unwrap();
    let ids = store
        .append_work_items(job.id, vec![item_for(1), item_for(2)])
        .await
        .unwrap();
    assert_eq!(store.get_job(job.id).await.unwrap().counters.total, 2);

    assert!(store.mark_job_running(job.id).await.unwrap());
    assert!(store.record_submission(ids[0], &format!("task-{}", ids[0])).await.unwrap());
    assert!(!store.record_submission(ids[0], "other").await.unwrap());

    store
        .update_work_item(ids[0], WorkItemUpdate::status(WorkItemStatus::Succeeded).with_flagged(true))
        .await
        .unwrap();
    let job = store.recompute_aggregates(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.counters.processed, 1);
    assert_eq!(job.counters.flagged, 1);
    assert!(job.has_unseen_updates);

    let skipped = store.cancel_job(job.id).await.unwrap();
    assert_eq!(skipped, 1);
    let job = store.recompute_aggregates(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.counters.processed, 2);

    store.soft_delete_job(job.id).await.unwrap();
    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_terminal_item_refuses_second_transition() {
    let test_db = TestDatabase::new().await;
    let store = &test_db.db.jobs;

    let job = store.create_job(flag_request(vec!["1".into()])).await.unwrap();
    let ids = store.append_work_items(job.id, vec![item_for(1)]).await.unwrap();

    let first = store
        .update_work_item(ids[0], WorkItemUpdate::status(WorkItemStatus::Succeeded))
        .await
        .unwrap();
    let second = store
        .update_work_item(ids[0], WorkItemUpdate::status(WorkItemStatus::Succeeded))
        .await
        .unwrap();
    assert!(first);
    assert!(!second);

    store.soft_delete_job(job.id).await.unwrap();
    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_lexicon_filter_and_snapshots() {
    let test_db = TestDatabase::new().await;
    let lexicon = &test_db.db.lexicon;

    let frame = test_db.insert_frame("motion", "Motion").await;
    let run = test_db.insert_entry("run.v", "run", "verb", Some(frame)).await;
    let walk = test_db.insert_entry("walk.v", "walk", "verb", Some(frame)).await;

    let ids = lexicon
        .resolve_ids(TargetKind::Entry, &[test_db.code("run.v"), "-1".into()])
        .await
        .unwrap();
    assert_eq!(ids, vec![run]);

    let filter = FilterExpr::and(vec![
        FilterExpr::field("frame_id", FilterOp::Eq, json!(frame)),
        FilterExpr::field("lemma", FilterOp::Contains, json!("wal")),
    ]);
    let found = lexicon
        .filtered_ids(TargetKind::Entry, &filter, None, 0)
        .await
        .unwrap();
    assert_eq!(found, vec![walk]);

    let snaps = lexicon.snapshots(TargetKind::Entry, &[walk, run]).await.unwrap();
    assert_eq!(snaps[0].target, TargetRef::Entry(walk));
    assert_eq!(snaps[0].frame_name.as_deref(), Some("Motion"));
    assert_eq!(snaps[0].siblings.len(), 1);

    test_db.cleanup().await;
}
