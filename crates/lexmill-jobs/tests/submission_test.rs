//! Submission retry, budget and driver behaviour.
//!
//! Time is paused in the retry tests, so backoff sleeps complete instantly
//! while `Instant` still advances by the slept amount.

mod common;

use std::time::Duration;

use common::{flag_request, motion_lexicon, Harness, FLAG_NO, FLAG_YES};
use lexmill_inference::mock::MockProvider;
use lexmill_jobs::{
    BatchSubmitter, DriverConfig, DriverEvent, JobDriver, JobStatus, ProviderErrorKind,
    SubmitConfig, WorkItemStatus,
};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_server_errors_then_auth_error_fails_item() {
    let provider = MockProvider::new()
        .with_submit_error(ProviderErrorKind::Server, "HTTP 500")
        .with_submit_error(ProviderErrorKind::Server, "HTTP 500")
        .with_submit_error(ProviderErrorKind::Authentication, "HTTP 401: invalid api key");
    let h = Harness::new(motion_lexicon(), provider);
    let job = h.service.create(flag_request(&["1"])).await.unwrap();

    let start = Instant::now();
    let batch = h.service.submit_batch(job.id, None).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(batch.submitted, 0);
    assert_eq!(batch.failed, 1);
    assert_eq!(h.provider.submit_attempts(), 3);
    // Backoff of 1s then 2s; the permanent error is not retried.
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");

    let item = &h.items(job.id).await[0];
    assert_eq!(item.status, WorkItemStatus::Failed);
    assert!(item.provider_task_id.is_none());
    assert_eq!(
        item.last_error.as_deref(),
        Some("Authentication error: HTTP 401: invalid api key")
    );

    let job = h.service.get(job.id, None, 0).await.unwrap().job;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.counters.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_errors_exhaust_attempts() {
    let provider = MockProvider::new();
    for _ in 0..4 {
        provider.push_submit_error(ProviderErrorKind::RateLimited, "HTTP 429");
    }
    let h = Harness::new(motion_lexicon(), provider);
    let job = h.service.create(flag_request(&["1"])).await.unwrap();

    let batch = h.service.submit_batch(job.id, None).await.unwrap();
    assert_eq!(batch.failed, 1);
    assert_eq!(h.provider.submit_attempts(), 4);

    let item = &h.items(job.id).await[0];
    assert_eq!(
        item.last_error.as_deref(),
        Some("Rate limit exceeded: HTTP 429 (gave up after 4 attempts)")
    );
}

#[tokio::test(start_paused = true)]
async fn test_budget_exhaustion_leaves_items_queued() {
    let provider = MockProvider::new()
        .with_submit_error(ProviderErrorKind::Server, "HTTP 502")
        .with_submit_error(ProviderErrorKind::Server, "HTTP 502");
    let h = Harness::new(motion_lexicon(), provider);
    let job = h.service.create(flag_request(&["1"])).await.unwrap();

    let submitter = BatchSubmitter::new(
        h.engine.clone(),
        SubmitConfig::default().with_budget(Duration::from_secs(2)),
    );
    let batch = submitter.submit_batch(job.id, 10).await.unwrap();
    assert_eq!(batch.submitted, 0);
    assert_eq!(batch.failed, 0);
    assert_eq!(batch.remaining, 1);

    let item = &h.items(job.id).await[0];
    assert_eq!(item.status, WorkItemStatus::Queued);
    assert!(item.last_error.is_none());

    // The next batch picks the item up again.
    let batch = submitter.submit_batch(job.id, 10).await.unwrap();
    assert_eq!(batch.submitted, 1);
    assert_eq!(batch.remaining, 0);
}

#[tokio::test]
async fn test_submit_all_drains_queue() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let job = h.service.create(flag_request(&["1", "2", "3", "4", "5"])).await.unwrap();

    let submitter = BatchSubmitter::new(
        h.engine.clone(),
        SubmitConfig::default().with_batch_size(2),
    );
    let total = submitter.submit_all(job.id).await.unwrap();
    assert_eq!(total.submitted, 5);
    assert_eq!(total.remaining, 0);
    assert_eq!(h.provider.submit_count(), 5);
}

#[tokio::test]
async fn test_driver_tick_advances_active_jobs() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let job = h.service.create(flag_request(&["1", "2"])).await.unwrap();
    let finished = h.service.create(flag_request(&["3"])).await.unwrap();
    h.service.cancel(finished.id).await.unwrap();

    let driver = JobDriver::new(h.engine.clone(), DriverConfig::default().with_tick_ms(10));
    let mut events = driver.events();

    assert_eq!(driver.tick().await.unwrap(), 1);
    assert_eq!(h.provider.submit_count(), 2);
    match events.recv().await.unwrap() {
        DriverEvent::JobAdvanced {
            job_id,
            submitted,
            status,
        } => {
            assert_eq!(job_id, job.id);
            assert_eq!(submitted, 2);
            assert_eq!(status, JobStatus::Running);
        }
        other => panic!("unexpected event {other:?}"),
    }

    for task in h.tasks(job.id).await.values() {
        h.provider.complete(task, FLAG_NO);
    }
    driver.tick().await.unwrap();
    let job = h.service.get(job.id, None, 0).await.unwrap().job;
    assert_eq!(job.status, JobStatus::Completed);

    // Nothing left to drive.
    assert_eq!(driver.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_driver_settles_cancelled_job_with_items_in_flight() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let job = h.service.create(flag_request(&["1", "2", "3"])).await.unwrap();
    h.service.submit_batch(job.id, Some(2)).await.unwrap();
    h.service.cancel(job.id).await.unwrap();

    for task in h.tasks(job.id).await.values() {
        h.provider.complete(task, FLAG_YES);
    }
    let driver = JobDriver::new(h.engine.clone(), DriverConfig::default());
    assert_eq!(driver.tick().await.unwrap(), 1);

    let mut statuses: Vec<WorkItemStatus> = h.items(job.id).await.iter().map(|i| i.status).collect();
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(
        statuses,
        vec![
            WorkItemStatus::Skipped,
            WorkItemStatus::Succeeded,
            WorkItemStatus::Succeeded
        ]
    );
    assert!(h.changesets.for_job(job.id).await.is_empty());

    let job = h.service.get(job.id, None, 0).await.unwrap().job;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.counters.processed, 3);
    assert_eq!(driver.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_driver_rotates_past_stalled_jobs() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    let mut jobs = Vec::new();
    for id in ["1", "2", "3", "4", "5"] {
        jobs.push(h.service.create(flag_request(&[id])).await.unwrap());
    }

    // Provider tasks never finish, so every job stays active.
    let driver = JobDriver::new(h.engine.clone(), DriverConfig::default().with_max_concurrent(4));
    assert_eq!(driver.tick().await.unwrap(), 4);
    assert_eq!(h.provider.submit_count(), 4);
    assert!(h.tasks(jobs[4].id).await.is_empty());

    assert_eq!(driver.tick().await.unwrap(), 4);
    assert_eq!(h.provider.submit_count(), 5);
    for job in &jobs {
        let items = h.items(job.id).await;
        assert_eq!(items[0].status, WorkItemStatus::Processing);
    }
}

#[tokio::test]
async fn test_driver_start_and_shutdown() {
    let h = Harness::new(motion_lexicon(), MockProvider::new());
    h.service.create(flag_request(&["1"])).await.unwrap();

    let handle = JobDriver::new(h.engine.clone(), DriverConfig::default().with_tick_ms(10)).start();
    let mut events = handle.events();

    let started = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(started, DriverEvent::DriverStarted);

    handle.shutdown().await.unwrap();
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(DriverEvent::DriverStopped) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(stopped);
}
