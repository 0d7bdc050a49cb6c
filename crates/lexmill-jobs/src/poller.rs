//! Result poller: reads provider task status back into work items.
//!
//! A successful result is first recorded as `succeeded` through the store's
//! terminal guard; only the caller that wins that transition applies it, so
//! concurrent pollers and webhooks never create duplicate changesets.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use lexmill_core::{
    defaults, Job, JobEvent, JobResult, JobStatus, LlmProvider, ProviderTask, ProviderTaskStatus,
    Result, TaskHandle, TokenUsage, WorkItem, WorkItemStatus, WorkItemUpdate,
};

use crate::applier::ResultApplier;
use crate::engine::Engine;
use crate::submitter::env_parse;

/// Polling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Items examined per refresh.
    pub limit: usize,
    /// Items retrieved concurrently.
    pub sub_batch: usize,
    /// Empty completed responses tolerated before an item fails.
    pub max_poll_attempts: i32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            limit: defaults::POLL_LIMIT,
            sub_batch: defaults::POLL_SUB_BATCH,
            max_poll_attempts: defaults::MAX_POLL_ATTEMPTS,
        }
    }
}

impl PollConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LLM_JOB_POLL_LIMIT` | `200` | Items examined per refresh |
    /// | `LLM_JOB_POLL_SUB_BATCH` | `20` | Concurrent retrievals |
    /// | `LLM_JOB_MAX_POLL_ATTEMPTS` | `30` | Empty completions before failing an item |
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            limit: env_parse("LLM_JOB_POLL_LIMIT").unwrap_or(base.limit).max(1),
            sub_batch: env_parse("LLM_JOB_POLL_SUB_BATCH")
                .unwrap_or(base.sub_batch)
                .max(1),
            max_poll_attempts: env_parse("LLM_JOB_MAX_POLL_ATTEMPTS")
                .unwrap_or(base.max_poll_attempts)
                .max(1),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn with_sub_batch(mut self, size: usize) -> Self {
        self.sub_batch = size.max(1);
        self
    }

    pub fn with_max_poll_attempts(mut self, attempts: i32) -> Self {
        self.max_poll_attempts = attempts.max(1);
        self
    }
}

/// What polling one item did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Still running at the provider, or output not there yet.
    Pending,
    Succeeded,
    Failed,
    /// Item was already terminal; nothing written.
    Unchanged,
    /// Retrieval or storage failed; retried on the next poll.
    Errored,
}

/// Polls provider tasks and applies finished results.
#[derive(Clone)]
pub struct ResultPoller {
    engine: Engine,
    applier: ResultApplier,
    config: PollConfig,
}

impl ResultPoller {
    pub fn new(engine: Engine, config: PollConfig) -> Self {
        let applier = ResultApplier::from_engine(&engine);
        Self {
            engine,
            applier,
            config,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll up to `limit` outstanding items of `job_id` and return the
    /// recomputed job.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "poller", op = "refresh"))]
    pub async fn refresh(&self, job_id: Uuid, limit: usize) -> Result<Job> {
        let store = &self.engine.store;
        let before = store.get_job(job_id).await?;
        if before.is_deleted() {
            return Ok(before);
        }
        let items = store.pollable_items(job_id, limit.max(1) as i64).await?;
        if items.is_empty() {
            return store.recompute_aggregates(job_id).await;
        }
        let provider = self.engine.require_provider()?;

        let start = Instant::now();
        let mut tally = Tally::default();
        for chunk in items.chunks(self.config.sub_batch.max(1)) {
            let mut tasks = JoinSet::new();
            for item in chunk.iter().cloned() {
                let worker = ItemPoller {
                    engine: self.engine.clone(),
                    applier: self.applier.clone(),
                    provider: provider.clone(),
                    max_poll_attempts: self.config.max_poll_attempts,
                };
                tasks.spawn(async move { worker.poll(item).await });
            }
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(outcome) => tally.add(outcome),
                    Err(e) => error!(error = ?e, "Poll task panicked"),
                }
            }
        }

        let job = store.recompute_aggregates(job_id).await?;
        info!(
            %job_id,
            polled = items.len(),
            succeeded = tally.succeeded,
            failed = tally.failed,
            pending = tally.pending,
            errored = tally.errored,
            status = %job.status,
            duration_ms = start.elapsed().as_millis() as u64,
            "Poll pass finished"
        );
        self.emit_progress(&before, &job);
        Ok(job)
    }

    /// Refresh the single item behind `provider_task_id`.
    ///
    /// Unknown task ids return `Ok(None)`.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "poller", op = "webhook"))]
    pub async fn handle_webhook(&self, provider_task_id: &str) -> Result<Option<Job>> {
        let store = &self.engine.store;
        let Some(item) = store.find_item_by_task(provider_task_id).await? else {
            debug!(task_id = provider_task_id, "Webhook for unknown task ignored");
            return Ok(None);
        };
        let before = store.get_job(item.job_id).await?;
        if item.status.is_terminal() || before.is_deleted() {
            return Ok(Some(before));
        }
        let worker = ItemPoller {
            engine: self.engine.clone(),
            applier: self.applier.clone(),
            provider: self.engine.require_provider()?,
            max_poll_attempts: self.config.max_poll_attempts,
        };
        let outcome = worker.poll(item).await;
        debug!(task_id = provider_task_id, ?outcome, "Webhook item polled");
        let job = store.recompute_aggregates(before.id).await?;
        self.emit_progress(&before, &job);
        Ok(Some(job))
    }

    fn emit_progress(&self, before: &Job, after: &Job) {
        self.engine.events.emit(JobEvent::JobProgress {
            job_id: after.id,
            status: after.status,
            counters: after.counters,
        });
        let finished = matches!(after.status, JobStatus::Completed | JobStatus::Failed);
        if finished && before.status != after.status {
            info!(job_id = %after.id, status = %after.status, "Job finished");
            self.engine.events.emit(JobEvent::JobFinished {
                job_id: after.id,
                status: after.status,
            });
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    pending: usize,
    errored: usize,
}

impl Tally {
    fn add(&mut self, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Succeeded => self.succeeded += 1,
            PollOutcome::Failed => self.failed += 1,
            PollOutcome::Pending | PollOutcome::Unchanged => self.pending += 1,
            PollOutcome::Errored => self.errored += 1,
        }
    }
}

/// Per-item polling state moved into a spawned task.
struct ItemPoller {
    engine: Engine,
    applier: ResultApplier,
    provider: Arc<dyn LlmProvider>,
    max_poll_attempts: i32,
}

impl ItemPoller {
    async fn poll(&self, item: WorkItem) -> PollOutcome {
        let Some(task_id) = item.provider_task_id.clone() else {
            return PollOutcome::Unchanged;
        };
        let task = match self.provider.retrieve(&TaskHandle(task_id.clone())).await {
            Ok(task) => task,
            Err(e) => {
                warn!(item_id = item.id, task_id = %task_id, error = %e, "Retrieve failed");
                self.note_error(&item, e.to_string()).await;
                return PollOutcome::Errored;
            }
        };
        trace!(item_id = item.id, task_id = %task_id, status = ?task.status, "Provider status");

        match self.handle(&item, task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(item_id = item.id, error = %e, "Failed to record poll result");
                self.note_error(&item, e.to_string()).await;
                PollOutcome::Errored
            }
        }
    }

    async fn handle(&self, item: &WorkItem, task: ProviderTask) -> Result<PollOutcome> {
        match task.status {
            ProviderTaskStatus::Queued | ProviderTaskStatus::InProgress => Ok(PollOutcome::Pending),
            ProviderTaskStatus::Cancelled => self.fail(item, "Cancelled at provider".into()).await,
            ProviderTaskStatus::Failed => {
                let message = task
                    .error
                    .unwrap_or_else(|| "Provider reported failure".to_string());
                self.fail(item, message).await
            }
            ProviderTaskStatus::Incomplete => {
                let message = task
                    .error
                    .unwrap_or_else(|| "Incomplete response".to_string());
                self.fail(item, message).await
            }
            ProviderTaskStatus::Completed => {
                let raw = task.output.as_deref().map(str::trim).unwrap_or_default();
                if raw.is_empty() {
                    return self.missing_output(item).await;
                }
                self.complete(item, raw, task.usage).await
            }
        }
    }

    async fn missing_output(&self, item: &WorkItem) -> Result<PollOutcome> {
        let polls = item.poll_attempts + 1;
        if polls >= self.max_poll_attempts {
            return self
                .fail(item, format!("Provider returned no output after {polls} polls"))
                .await;
        }
        debug!(item_id = item.id, polls, "Completed without output, will poll again");
        self.engine
            .store
            .update_work_item(item.id, WorkItemUpdate::default().counting_poll())
            .await?;
        Ok(PollOutcome::Pending)
    }

    async fn complete(
        &self,
        item: &WorkItem,
        raw: &str,
        usage: Option<TokenUsage>,
    ) -> Result<PollOutcome> {
        let store = &self.engine.store;
        let job = store.get_job(item.job_id).await?;
        let result = match JobResult::parse(job.job_type, raw) {
            Ok(result) => result,
            Err(e) => {
                let snippet: String = raw.chars().take(defaults::RAW_SNIPPET_CHARS).collect();
                return self
                    .fail(
                        item,
                        format!(
                            "Could not parse {} result: {e}; raw output: {snippet}",
                            job.job_type
                        ),
                    )
                    .await;
            }
        };

        let result_json = serde_json::to_value(&result)?;
        let update = WorkItemUpdate::status(WorkItemStatus::Succeeded)
            .with_response(json!({ "result": result_json.clone() }))
            .with_flagged(result.is_flagged())
            .with_confidence(result.confidence())
            .with_usage(usage);
        if !store.update_work_item(item.id, update).await? {
            return Ok(PollOutcome::Unchanged);
        }

        // The snapshot above predates the terminal mark; a cancel may have landed since.
        let job = store.get_job(item.job_id).await?;
        if job.is_cancelled() {
            debug!(
                job_id = %job.id,
                item_id = item.id,
                "Job cancelled, result recorded without changesets"
            );
            return Ok(PollOutcome::Succeeded);
        }

        let recorded = match self.applier.apply(item, &result, &job).await {
            Ok(outcome) => {
                if !outcome.skipped.is_empty() {
                    info!(
                        item_id = item.id,
                        skipped = outcome.skipped.len(),
                        "Result applied with skipped proposals"
                    );
                }
                WorkItemUpdate::default().with_response(json!({
                    "result": result_json,
                    "apply": serde_json::to_value(&outcome)?,
                }))
            }
            Err(e) => {
                warn!(item_id = item.id, error = %e, "Applying result failed");
                WorkItemUpdate::default().with_error(format!("Apply failed: {e}"))
            }
        };
        store.update_work_item(item.id, recorded).await?;

        // A cancel that finished while this result was being applied could not
        // discard the changesets created here.
        if store.get_job(job.id).await?.is_cancelled() {
            let discarded = self.engine.changesets.discard_by_job(job.id).await?;
            info!(
                job_id = %job.id,
                item_id = item.id,
                discarded,
                "Job cancelled during apply, changesets retracted"
            );
        }
        Ok(PollOutcome::Succeeded)
    }

    async fn fail(&self, item: &WorkItem, message: String) -> Result<PollOutcome> {
        warn!(item_id = item.id, error = %message, "Work item failed");
        let applied = self
            .engine
            .store
            .update_work_item(item.id, WorkItemUpdate::failed(message))
            .await?;
        Ok(if applied {
            PollOutcome::Failed
        } else {
            PollOutcome::Unchanged
        })
    }

    async fn note_error(&self, item: &WorkItem, message: String) {
        if let Err(e) = self
            .engine
            .store
            .update_work_item(item.id, WorkItemUpdate::default().with_error(message))
            .await
        {
            error!(item_id = item.id, error = %e, "Failed to record poll error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_config_builders_floor_at_one() {
        let config = PollConfig::default()
            .with_limit(0)
            .with_sub_batch(0)
            .with_max_poll_attempts(-3);
        assert_eq!(config.limit, 1);
        assert_eq!(config.sub_batch, 1);
        assert_eq!(config.max_poll_attempts, 1);
    }

    #[test]
    fn test_poll_config_defaults() {
        let config = PollConfig::default();
        assert_eq!(config.sub_batch, 20);
        assert_eq!(config.max_poll_attempts, 30);
    }
}
