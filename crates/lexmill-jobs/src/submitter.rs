//! Batch submitter: sends queued work items to the provider.
//!
//! One call handles at most one batch and is safe to interrupt. An item's
//! provider task id is recorded only when it has none, so re-running a batch
//! never submits an item twice.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use lexmill_core::{
    defaults, Job, JobEvent, LlmProvider, Result, SubmitRequest, TaskHandle, WorkItem,
    WorkItemUpdate,
};
use lexmill_inference::schemas;

use crate::engine::Engine;

/// Submission settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitConfig {
    /// Items per batch, clamped to `[1, SUBMIT_BATCH_MAX]` at use.
    pub batch_size: usize,
    /// Attempts per item for retryable failures, first attempt included.
    pub max_attempts: u32,
    /// First backoff delay; doubles on every retry.
    pub backoff_base: Duration,
    /// Wall-clock budget of one batch.
    pub budget: Duration,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::SUBMIT_BATCH_SIZE,
            max_attempts: defaults::SUBMIT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(defaults::SUBMIT_BACKOFF_BASE_MS),
            budget: Duration::from_secs(defaults::SUBMIT_BUDGET_SECS),
        }
    }
}

impl SubmitConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LLM_JOB_BATCH_SIZE` | `25` | Items per submission batch |
    /// | `LLM_JOB_SUBMIT_MAX_ATTEMPTS` | `4` | Attempts per item on retryable errors |
    /// | `LLM_JOB_SUBMIT_BUDGET_SECS` | `290` | Wall-clock budget per batch |
    pub fn from_env() -> Self {
        let base = Self::default();
        let batch_size = env_parse("LLM_JOB_BATCH_SIZE").unwrap_or(base.batch_size);
        let max_attempts = env_parse("LLM_JOB_SUBMIT_MAX_ATTEMPTS")
            .unwrap_or(base.max_attempts)
            .max(1);
        let budget = env_parse("LLM_JOB_SUBMIT_BUDGET_SECS")
            .map(Duration::from_secs)
            .unwrap_or(base.budget);
        Self {
            batch_size,
            max_attempts,
            budget,
            ..base
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Delay before retry number `retry` (1-based): base, 2·base, 4·base, ...
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Counts from one [`BatchSubmitter::submit_batch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitBatchOutcome {
    pub submitted: usize,
    pub failed: usize,
    /// Items still waiting for submission after this batch.
    pub remaining: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Submitted,
    Failed,
    /// Left queued for the next batch.
    Deferred,
}

/// Submits queued work items with bounded concurrency and retry.
#[derive(Clone)]
pub struct BatchSubmitter {
    engine: Engine,
    config: SubmitConfig,
}

impl BatchSubmitter {
    pub fn new(engine: Engine, config: SubmitConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &SubmitConfig {
        &self.config
    }

    /// Submit up to `batch_size` queued items of `job_id`.
    ///
    /// A cancelled or deleted job is left untouched.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "submitter", op = "submit_batch"))]
    pub async fn submit_batch(&self, job_id: Uuid, batch_size: usize) -> Result<SubmitBatchOutcome> {
        let store = &self.engine.store;
        let job = store.get_job(job_id).await?;
        if job.is_cancelled() || job.is_deleted() {
            debug!(%job_id, status = %job.status, "Job not submittable, skipping batch");
            return Ok(SubmitBatchOutcome::default());
        }

        let batch_size = batch_size.clamp(1, defaults::SUBMIT_BATCH_MAX);
        let items = store.submittable_items(job_id, batch_size as i64).await?;
        if items.is_empty() {
            return Ok(SubmitBatchOutcome::default());
        }
        let provider = self.engine.require_provider()?;

        if store.mark_job_running(job_id).await? {
            info!(%job_id, job_type = %job.job_type, "Job started");
        }

        let start = Instant::now();
        let deadline = start + self.config.budget;
        let job = Arc::new(job);
        let semaphore = Arc::new(Semaphore::new(batch_size));
        let mut tasks = JoinSet::new();
        let batch_len = items.len();

        for item in items {
            let task = SubmitTask {
                engine: self.engine.clone(),
                provider: provider.clone(),
                config: self.config.clone(),
                job: job.clone(),
                deadline,
            };
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return ItemOutcome::Deferred;
                };
                task.submit_item(item).await
            });
        }

        let mut outcome = SubmitBatchOutcome::default();
        let mut deferred = 0usize;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(ItemOutcome::Submitted) => outcome.submitted += 1,
                Ok(ItemOutcome::Failed) => outcome.failed += 1,
                Ok(ItemOutcome::Deferred) => deferred += 1,
                Err(e) => error!(error = ?e, "Submission task panicked"),
            }
        }

        store.recompute_aggregates(job_id).await?;
        outcome.remaining = store.count_submittable(job_id).await?;

        info!(
            %job_id,
            batch_size = batch_len,
            submitted = outcome.submitted,
            failed = outcome.failed,
            deferred,
            remaining = outcome.remaining,
            duration_ms = start.elapsed().as_millis() as u64,
            "Submission batch finished"
        );
        self.engine.events.emit(JobEvent::BatchSubmitted {
            job_id,
            submitted: outcome.submitted,
            failed: outcome.failed,
            remaining: outcome.remaining,
        });
        Ok(outcome)
    }

    /// Submit batches until nothing is left or a batch makes no progress.
    pub async fn submit_all(&self, job_id: Uuid) -> Result<SubmitBatchOutcome> {
        let mut total = SubmitBatchOutcome::default();
        loop {
            let batch = self.submit_batch(job_id, self.config.batch_size).await?;
            total.submitted += batch.submitted;
            total.failed += batch.failed;
            total.remaining = batch.remaining;
            if batch.remaining == 0 || batch.submitted + batch.failed == 0 {
                return Ok(total);
            }
        }
    }
}

/// Per-item submission state moved into a spawned task.
struct SubmitTask {
    engine: Engine,
    provider: Arc<dyn LlmProvider>,
    config: SubmitConfig,
    job: Arc<Job>,
    deadline: Instant,
}

impl SubmitTask {
    async fn submit_item(self, item: WorkItem) -> ItemOutcome {
        let request = build_request(&self.job, &item);
        let mut attempt = 0u32;
        loop {
            if Instant::now() >= self.deadline {
                debug!(item_id = item.id, "Budget exhausted, leaving item queued");
                return ItemOutcome::Deferred;
            }
            attempt += 1;
            trace!(item_id = item.id, attempt, prompt_len = request.prompt.len(), "Submitting item");

            let error = match self.provider.submit(&request).await {
                Ok(handle) => return self.record(&item, handle.as_str()).await,
                Err(e) => e,
            };

            if error.is_retryable() && attempt < self.config.max_attempts {
                let delay = self.config.backoff(attempt);
                if Instant::now() + delay >= self.deadline {
                    debug!(item_id = item.id, attempt, "Retry would exceed budget, leaving item queued");
                    return ItemOutcome::Deferred;
                }
                warn!(
                    item_id = item.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retryable submission failure, backing off"
                );
                sleep(delay).await;
                continue;
            }

            let message = if error.is_retryable() {
                format!("{error} (gave up after {attempt} attempts)")
            } else {
                error.to_string()
            };
            warn!(item_id = item.id, attempt, error = %message, "Submission failed");
            return match self
                .engine
                .store
                .update_work_item(item.id, WorkItemUpdate::failed(message))
                .await
            {
                Ok(_) => ItemOutcome::Failed,
                Err(e) => {
                    error!(item_id = item.id, error = %e, "Failed to record submission failure");
                    ItemOutcome::Deferred
                }
            };
        }
    }

    async fn record(&self, item: &WorkItem, task_id: &str) -> ItemOutcome {
        match self.engine.store.record_submission(item.id, task_id).await {
            Ok(true) => {
                debug!(item_id = item.id, task_id, "Item submitted");
                ItemOutcome::Submitted
            }
            Ok(false) => {
                warn!(
                    item_id = item.id,
                    task_id,
                    "Item already has a provider task, discarding duplicate handle"
                );
                if let Err(e) = self.provider.cancel(&TaskHandle(task_id.to_string())).await {
                    warn!(
                        item_id = item.id,
                        task_id,
                        error = %e,
                        "Failed to cancel duplicate provider task"
                    );
                }
                ItemOutcome::Deferred
            }
            Err(e) => {
                error!(item_id = item.id, task_id, error = %e, "Failed to record provider task");
                ItemOutcome::Deferred
            }
        }
    }
}

/// Provider request for one work item.
pub fn build_request(job: &Job, item: &WorkItem) -> SubmitRequest {
    let model = if job.config.model.trim().is_empty() {
        defaults::LLM_JOB_MODEL.to_string()
    } else {
        job.config.model.clone()
    };
    let mut metadata = BTreeMap::new();
    metadata.insert("job_id".to_string(), job.id.to_string());
    metadata.insert("item_id".to_string(), item.id.to_string());
    metadata.insert("job_type".to_string(), job.job_type.as_str().to_string());
    metadata.insert("target".to_string(), item.target.to_string());
    SubmitRequest {
        model,
        system: job.config.system_prompt.clone(),
        prompt: item.request_payload.prompt.clone(),
        schema_name: schemas::schema_name(job.job_type),
        schema: schemas::schema_for(job.job_type),
        metadata,
    }
}
