//! Job lifecycle surface: create, inspect, steer and delete jobs.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use lexmill_core::{
    defaults, CreateJobRequest, Error, Job, JobConfig, JobEvent, JobListFilter, JobScope,
    JobStatus, JobType, NewWorkItem, RequestPayload, Result, TargetRef, TaskHandle, WorkItem,
};

use crate::engine::Engine;
use crate::poller::{PollConfig, ResultPoller};
use crate::render::{self, RenderOptions};
use crate::submitter::{env_parse, BatchSubmitter, SubmitBatchOutcome, SubmitConfig};

/// Lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Largest scope a job may cover.
    pub max_items: i64,
    /// Ask the provider to cancel outstanding tasks when a job is cancelled.
    pub cancel_at_provider: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_items: defaults::MAX_JOB_ITEMS,
            cancel_at_provider: false,
        }
    }
}

impl ServiceConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LLM_JOB_MAX_ITEMS` | `5000` | Largest scope a job may cover |
    /// | `LLM_JOB_CANCEL_AT_PROVIDER` | `false` | Cancel outstanding provider tasks on job cancel |
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            max_items: env_parse("LLM_JOB_MAX_ITEMS")
                .unwrap_or(base.max_items)
                .max(1),
            cancel_at_provider: std::env::var("LLM_JOB_CANCEL_AT_PROVIDER")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(base.cancel_at_provider),
        }
    }

    pub fn with_max_items(mut self, max: i64) -> Self {
        self.max_items = max.max(1);
        self
    }

    pub fn with_cancel_at_provider(mut self, enabled: bool) -> Self {
        self.cancel_at_provider = enabled;
        self
    }
}

/// One rendered sample of a preview.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewSample {
    pub target: TargetRef,
    pub label: String,
    pub prompt: String,
}

/// What a job would look like, without persisting anything.
#[derive(Debug, Clone, Serialize)]
pub struct JobPreview {
    pub total: i64,
    pub samples: Vec<PreviewSample>,
    /// Template problems that do not block creation.
    pub warnings: Vec<String>,
    pub cluster_notice: Option<String>,
}

/// A job with one page of its work items.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    pub job: Job,
    pub items: Vec<WorkItem>,
}

/// Entry point for creating, inspecting and steering jobs.
#[derive(Clone)]
pub struct JobService {
    engine: Engine,
    config: ServiceConfig,
    submitter: BatchSubmitter,
    poller: ResultPoller,
}

impl JobService {
    pub fn new(engine: Engine, config: ServiceConfig) -> Self {
        Self {
            submitter: BatchSubmitter::new(engine.clone(), SubmitConfig::default()),
            poller: ResultPoller::new(engine.clone(), PollConfig::default()),
            engine,
            config,
        }
    }

    pub fn with_submit_config(mut self, config: SubmitConfig) -> Self {
        self.submitter = BatchSubmitter::new(self.engine.clone(), config);
        self
    }

    pub fn with_poll_config(mut self, config: PollConfig) -> Self {
        self.poller = ResultPoller::new(self.engine.clone(), config);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn submitter(&self) -> &BatchSubmitter {
        &self.submitter
    }

    pub fn poller(&self) -> &ResultPoller {
        &self.poller
    }

    /// Validate, resolve, render and persist a job with its work items.
    ///
    /// The scope is counted before anything is fetched; empty and oversized
    /// scopes are rejected.
    #[instrument(skip(self, req), fields(subsystem = "jobs", component = "service", op = "create", job_type = %req.job_type))]
    pub async fn create(&self, req: CreateJobRequest) -> Result<Job> {
        validate_request(&req)?;
        let resolver = self.engine.resolver();
        let count = resolver.count(&req.scope).await?;
        self.check_count(count)?;

        let seeds = resolver.resolve(&req.scope).await?;
        if seeds.is_empty() {
            return Err(Error::EmptyScope);
        }

        let config = req.config.clone();
        let options = RenderOptions {
            cluster: config.cluster,
            cluster_k: config.cluster_k,
        };
        for warning in render::validate(&config.prompt_template) {
            warn!(warning = %warning, "Prompt template warning");
        }

        let renderer = self.engine.renderer();
        let mut items = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let rendered = renderer
                .render(&config.prompt_template, &seed.snapshot, options)
                .await;
            if let Some(notice) = &rendered.cluster_notice {
                debug!(entity = %seed.target, notice = %notice, "Clustering not applied");
            }
            items.push(NewWorkItem {
                target: seed.target,
                request_payload: RequestPayload {
                    prompt: rendered.prompt,
                    variables: rendered.variables,
                    snapshot: seed.snapshot,
                },
            });
        }

        let job_type = req.job_type;
        let job = self.engine.store.create_job(req).await?;
        let ids = self.engine.store.append_work_items(job.id, items).await?;
        let job = self.engine.store.recompute_aggregates(job.id).await?;

        info!(
            job_id = %job.id,
            total = ids.len(),
            model = %config.model,
            "Job created"
        );
        self.engine.events.emit(JobEvent::JobCreated {
            job_id: job.id,
            job_type,
            total: job.counters.total,
        });
        Ok(job)
    }

    /// Render the first few prompts of a prospective job.
    #[instrument(skip(self, scope, config), fields(subsystem = "jobs", component = "service", op = "preview"))]
    pub async fn preview(
        &self,
        job_type: JobType,
        scope: &JobScope,
        config: &JobConfig,
    ) -> Result<JobPreview> {
        let resolver = self.engine.resolver();
        let total = resolver.count(scope).await?;
        let mut ids = resolver.resolve_ids(scope).await?;
        ids.truncate(defaults::PREVIEW_SAMPLE_SIZE);
        let snapshots = self.engine.lexicon.snapshots(scope.target_kind(), &ids).await?;

        let renderer = self.engine.renderer();
        let options = RenderOptions {
            cluster: config.cluster,
            cluster_k: config.cluster_k,
        };
        let mut warnings = render::validate(&config.prompt_template);
        let mut cluster_notice = None;
        let mut samples = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let rendered = renderer
                .render(&config.prompt_template, &snapshot, options)
                .await;
            for w in rendered.warnings {
                if !warnings.contains(&w) {
                    warnings.push(w);
                }
            }
            if cluster_notice.is_none() {
                cluster_notice = rendered.cluster_notice;
            }
            samples.push(PreviewSample {
                target: snapshot.target,
                label: snapshot.label.clone(),
                prompt: rendered.prompt,
            });
        }
        debug!(job_type = %job_type, total, samples = samples.len(), "Preview rendered");
        Ok(JobPreview {
            total,
            samples,
            warnings,
            cluster_notice,
        })
    }

    pub async fn list(&self, filter: &JobListFilter) -> Result<Vec<Job>> {
        self.engine.store.list_jobs(filter).await
    }

    /// Job plus one page of items. Soft-deleted jobs are not found.
    pub async fn get(&self, job_id: Uuid, limit: Option<i64>, offset: i64) -> Result<JobDetail> {
        let job = self.live_job(job_id).await?;
        let limit = limit
            .unwrap_or(defaults::ITEM_PAGE_LIMIT)
            .clamp(1, defaults::MAX_JOB_ITEMS);
        let items = self
            .engine
            .store
            .list_items(job_id, limit, offset.max(0))
            .await?;
        Ok(JobDetail { job, items })
    }

    /// Cancel a job: unsubmitted items are skipped, pending changesets of the
    /// job are discarded, submitted items keep running. Cancelling twice is a
    /// no-op.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "service", op = "cancel"))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job> {
        let job = self.live_job(job_id).await?;
        match job.status {
            JobStatus::Cancelled => return Ok(job),
            JobStatus::Completed | JobStatus::Failed => {
                return Err(Error::InvalidInput(format!(
                    "job {job_id} already {}",
                    job.status
                )))
            }
            JobStatus::Queued | JobStatus::Running => {}
        }

        let skipped = self.engine.store.cancel_job(job_id).await?;
        let discarded = match self.engine.changesets.discard_by_job(job_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(%job_id, error = %e, "Failed to discard job changesets");
                0
            }
        };
        if self.config.cancel_at_provider {
            self.cancel_provider_tasks(job_id).await;
        }
        let job = self.engine.store.recompute_aggregates(job_id).await?;

        info!(%job_id, skipped, discarded, "Job cancelled");
        self.engine.events.emit(JobEvent::JobCancelled { job_id });
        Ok(job)
    }

    pub async fn soft_delete(&self, job_id: Uuid) -> Result<()> {
        self.live_job(job_id).await?;
        self.engine.store.soft_delete_job(job_id).await?;
        info!(subsystem = "jobs", component = "service", %job_id, "Job deleted");
        Ok(())
    }

    pub async fn mark_seen(&self, job_id: Uuid) -> Result<()> {
        self.engine.store.mark_seen(job_id).await
    }

    /// Submit one batch now instead of waiting for the driver.
    pub async fn submit_batch(&self, job_id: Uuid, batch_size: Option<usize>) -> Result<SubmitBatchOutcome> {
        let size = batch_size.unwrap_or(self.submitter.config().batch_size);
        self.submitter.submit_batch(job_id, size).await
    }

    /// Poll outstanding items now instead of waiting for the driver.
    pub async fn refresh(&self, job_id: Uuid, limit: Option<usize>) -> Result<Job> {
        let limit = limit.unwrap_or(self.poller.config().limit);
        self.poller.refresh(job_id, limit).await
    }

    /// Provider callback for a finished task.
    pub async fn webhook(&self, provider_task_id: &str) -> Result<Option<Job>> {
        self.poller.handle_webhook(provider_task_id).await
    }

    fn check_count(&self, count: i64) -> Result<()> {
        if count == 0 {
            return Err(Error::EmptyScope);
        }
        if count > self.config.max_items {
            return Err(Error::ScopeTooLarge {
                count,
                max: self.config.max_items,
            });
        }
        Ok(())
    }

    async fn live_job(&self, job_id: Uuid) -> Result<Job> {
        let job = self.engine.store.get_job(job_id).await?;
        if job.is_deleted() {
            return Err(Error::JobNotFound(job_id));
        }
        Ok(job)
    }

    async fn cancel_provider_tasks(&self, job_id: Uuid) {
        let Some(provider) = self.engine.provider.clone() else {
            return;
        };
        let items = match self
            .engine
            .store
            .pollable_items(job_id, self.config.max_items)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(%job_id, error = %e, "Could not list outstanding items");
                return;
            }
        };
        for task_id in items.into_iter().filter_map(|i| i.provider_task_id) {
            if let Err(e) = provider.cancel(&TaskHandle(task_id.clone())).await {
                debug!(%job_id, task_id = %task_id, error = %e, "Provider cancel failed");
            }
        }
    }
}

fn validate_request(req: &CreateJobRequest) -> Result<()> {
    if req.config.prompt_template.trim().is_empty() {
        return Err(Error::InvalidInput("prompt template is empty".into()));
    }
    match &req.scope {
        JobScope::ById { ids, .. } if ids.is_empty() => Err(Error::EmptyScope),
        JobScope::ByGroup { frame_ids, .. } if frame_ids.is_empty() => Err(Error::EmptyScope),
        JobScope::ByFilter { filter, .. } if filter.depth() > defaults::MAX_FILTER_DEPTH => {
            Err(Error::InvalidInput(format!(
                "filter nests deeper than {} levels",
                defaults::MAX_FILTER_DEPTH
            )))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexmill_core::TargetKind;

    fn request(scope: JobScope, template: &str) -> CreateJobRequest {
        CreateJobRequest {
            job_type: JobType::Flag,
            scope,
            config: JobConfig::new(template),
            label: None,
            created_by: "tester".into(),
        }
    }

    #[test]
    fn test_validate_request() {
        let by_id = |ids: Vec<&str>| JobScope::ById {
            target_kind: TargetKind::Entry,
            ids: ids.into_iter().map(String::from).collect(),
        };
        assert!(validate_request(&request(by_id(vec!["1"]), "{{lemma}}")).is_ok());
        assert!(matches!(
            validate_request(&request(by_id(vec!["1"]), "  ")),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            validate_request(&request(by_id(vec![]), "{{lemma}}")),
            Err(Error::EmptyScope)
        ));
    }

    #[test]
    fn test_service_config() {
        let config = ServiceConfig::default().with_max_items(0);
        assert_eq!(config.max_items, 1);
        assert!(!ServiceConfig::default().cancel_at_provider);
    }
}
