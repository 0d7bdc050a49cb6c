//! Collaborator traits for the job engine.
//!
//! Storage, lexicon access, changesets, the LLM provider and the clustering
//! service are all reached through these traits so the engine runs against
//! PostgreSQL in production and in-memory doubles in tests.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::filter::FilterExpr;
use crate::models::*;

// =============================================================================
// JOB STORE
// =============================================================================

/// Persistence for jobs and work items.
///
/// `recompute_aggregates` is the only writer of a job's counters and status.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job with zero items and status `queued`.
    async fn create_job(&self, req: CreateJobRequest) -> Result<Job>;

    /// Append work items; returns their ids in input order.
    async fn append_work_items(&self, job_id: Uuid, items: Vec<NewWorkItem>) -> Result<Vec<i64>>;

    async fn get_job(&self, job_id: Uuid) -> Result<Job>;

    /// Jobs newest first, soft-deleted excluded unless requested.
    async fn list_jobs(&self, filter: &JobListFilter) -> Result<Vec<Job>>;

    /// Items of a job ordered by id.
    async fn list_items(&self, job_id: Uuid, limit: i64, offset: i64) -> Result<Vec<WorkItem>>;

    async fn get_item(&self, item_id: i64) -> Result<WorkItem>;

    async fn find_item_by_task(&self, provider_task_id: &str) -> Result<Option<WorkItem>>;

    /// Queued items with no provider task id, ordered by id.
    async fn submittable_items(&self, job_id: Uuid, limit: i64) -> Result<Vec<WorkItem>>;

    async fn count_submittable(&self, job_id: Uuid) -> Result<i64>;

    /// Non-terminal items that already have a provider task id, ordered by id.
    async fn pollable_items(&self, job_id: Uuid, limit: i64) -> Result<Vec<WorkItem>>;

    /// Flip `queued` to `running`. Returns false if the job was in any other status.
    async fn mark_job_running(&self, job_id: Uuid) -> Result<bool>;

    /// Store the provider task id and mark the item `processing`.
    ///
    /// Only applies when the item has no task id yet; returns false otherwise.
    async fn record_submission(&self, item_id: i64, provider_task_id: &str) -> Result<bool>;

    /// Apply a partial update. Returns false when the update carries a
    /// status and the item is already terminal; nothing is written then.
    async fn update_work_item(&self, item_id: i64, update: WorkItemUpdate) -> Result<bool>;

    /// Recompute counters and status from item rows.
    async fn recompute_aggregates(&self, job_id: Uuid) -> Result<Job>;

    /// Mark the job `cancelled` and skip every unsubmitted queued item.
    /// Returns the number of items skipped.
    async fn cancel_job(&self, job_id: Uuid) -> Result<i64>;

    async fn soft_delete_job(&self, job_id: Uuid) -> Result<()>;

    /// Clear the unseen-updates badge.
    async fn mark_seen(&self, job_id: Uuid) -> Result<()>;

    /// Jobs the driver still has work for: non-deleted jobs in `queued` or
    /// `running`, plus cancelled jobs with items outstanding at the provider.
    ///
    /// Ordered by id; `after` resumes past the last id of a previous page.
    async fn active_job_ids(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<Uuid>>;
}

// =============================================================================
// LEXICON
// =============================================================================

/// Read access to the lexicon for scope resolution and result validation.
///
/// Filter translation to a storage predicate lives behind this trait; the
/// engine only passes the AST through.
#[async_trait]
pub trait LexiconSource: Send + Sync {
    /// Resolve ids or codes to live record ids. Unknown values are dropped;
    /// the output follows input order.
    async fn resolve_ids(&self, kind: TargetKind, ids: &[String]) -> Result<Vec<i64>>;

    async fn count_frame_entries(&self, frame_ids: &[i64], pos: Option<&str>) -> Result<i64>;

    /// Entry ids of the given frames, ordered by id.
    async fn frame_entry_ids(
        &self,
        frame_ids: &[i64],
        pos: Option<&str>,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<Vec<i64>>;

    async fn count_filtered(&self, kind: TargetKind, filter: &FilterExpr) -> Result<i64>;

    /// Ids matching `filter`, ordered by id. `None` limit means unbounded.
    async fn filtered_ids(
        &self,
        kind: TargetKind,
        filter: &FilterExpr,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<Vec<i64>>;

    /// Denormalized snapshots; ids with no live record are omitted.
    async fn snapshots(&self, kind: TargetKind, ids: &[i64]) -> Result<Vec<EntitySnapshot>>;

    /// Live entry by code or numeric id.
    async fn find_entry(&self, code_or_id: &str) -> Result<Option<EntryBrief>>;

    /// Live frame by code or numeric id.
    async fn find_frame(&self, code_or_id: &str) -> Result<Option<FrameBrief>>;
}

// =============================================================================
// CHANGESETS
// =============================================================================

/// The external review engine. The applier creates changesets and never
/// touches them again.
#[async_trait]
pub trait ChangesetSink: Send + Sync {
    async fn create_from_update(&self, update: ProposedUpdate) -> Result<i64>;

    async fn create_from_create(&self, create: ProposedCreate) -> Result<i64>;

    async fn add_comment(&self, changeset_id: i64, author: &str, text: &str) -> Result<()>;

    /// Retract pending changesets produced by a job. Returns how many were discarded.
    async fn discard_by_job(&self, job_id: Uuid) -> Result<u64>;
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// Asynchronous LLM provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Start a background task for one prompt.
    async fn submit(&self, request: &SubmitRequest) -> Result<TaskHandle>;

    async fn retrieve(&self, handle: &TaskHandle) -> Result<ProviderTask>;

    /// Best-effort cancellation of a running task.
    async fn cancel(&self, handle: &TaskHandle) -> Result<()>;

    fn name(&self) -> &str;
}

/// Similarity clustering over stored embeddings.
///
/// When `k` exceeds the number of ids the service has embeddings for, it
/// fails with a [`Error::Clustering`](crate::Error::Clustering) whose message
/// contains `k must be <= n_found (n=K)`.
#[async_trait]
pub trait ClusteringService: Send + Sync {
    async fn cluster(&self, request: &ClusterRequest) -> Result<ClusterResponse>;
}
