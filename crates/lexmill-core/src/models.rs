//! Core data models for LLM jobs, work items, and lexicon snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};
use crate::filter::FilterExpr;

// =============================================================================
// ENUMS
// =============================================================================

/// Kind of instruction a job applies; selects the result schema and apply strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Flag records that match the instruction.
    Flag,
    /// Propose field edits (and optional frame reassignment / relations).
    Edit,
    /// Move named entries between frames.
    Reallocate,
    /// Recommend a single destination frame for an entry.
    Allocate,
    /// Split a frame; the provider performs edits through tool calls.
    Split,
    /// Recommend an action on a pending changeset.
    Review,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::Flag,
        JobType::Edit,
        JobType::Reallocate,
        JobType::Allocate,
        JobType::Split,
        JobType::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Flag => "flag",
            JobType::Edit => "edit",
            JobType::Reallocate => "reallocate",
            JobType::Allocate => "allocate",
            JobType::Split => "split",
            JobType::Review => "review",
        }
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job type: {s}")))
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled jobs receive no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job status: {other}"))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Skipped,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Queued => "queued",
            WorkItemStatus::Processing => "processing",
            WorkItemStatus::Succeeded => "succeeded",
            WorkItemStatus::Failed => "failed",
            WorkItemStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Succeeded | WorkItemStatus::Failed | WorkItemStatus::Skipped
        )
    }

    /// Terminal items are frozen: no status change is accepted, not even to
    /// the same status, so exactly one writer wins a terminal transition.
    pub fn accepts_status_change(&self) -> bool {
        !self.is_terminal()
    }
}

impl FromStr for WorkItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(WorkItemStatus::Queued),
            "processing" => Ok(WorkItemStatus::Processing),
            "succeeded" => Ok(WorkItemStatus::Succeeded),
            "failed" => Ok(WorkItemStatus::Failed),
            "skipped" => Ok(WorkItemStatus::Skipped),
            other => Err(Error::InvalidInput(format!(
                "unknown work item status: {other}"
            ))),
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of lexicon record a job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A lexical entry (word sense).
    Entry,
    /// A semantic frame (group of entries).
    Frame,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Entry => "entry",
            TargetKind::Frame => "frame",
        }
    }
}

impl FromStr for TargetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "entry" => Ok(TargetKind::Entry),
            "frame" => Ok(TargetKind::Frame),
            other => Err(Error::InvalidInput(format!("unknown target kind: {other}"))),
        }
    }
}

/// The single record a work item is about. Exactly one of entry or frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TargetRef {
    Entry(i64),
    Frame(i64),
}

impl TargetRef {
    pub fn kind(&self) -> TargetKind {
        match self {
            TargetRef::Entry(_) => TargetKind::Entry,
            TargetRef::Frame(_) => TargetKind::Frame,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            TargetRef::Entry(id) | TargetRef::Frame(id) => *id,
        }
    }

    pub fn entry_id(&self) -> Option<i64> {
        match self {
            TargetRef::Entry(id) => Some(*id),
            TargetRef::Frame(_) => None,
        }
    }

    pub fn frame_id(&self) -> Option<i64> {
        match self {
            TargetRef::Frame(id) => Some(*id),
            TargetRef::Entry(_) => None,
        }
    }

    /// Rebuild from the two nullable storage columns; exactly one must be set.
    pub fn from_columns(entry_id: Option<i64>, frame_id: Option<i64>) -> Result<Self> {
        match (entry_id, frame_id) {
            (Some(e), None) => Ok(TargetRef::Entry(e)),
            (None, Some(f)) => Ok(TargetRef::Frame(f)),
            (Some(_), Some(_)) => Err(Error::Internal(
                "work item references both an entry and a frame".into(),
            )),
            (None, None) => Err(Error::Internal(
                "work item references neither an entry nor a frame".into(),
            )),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().as_str(), self.id())
    }
}

// =============================================================================
// SCOPE & CONFIG
// =============================================================================

/// Declarative description of which records a job targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobScope {
    /// Explicit ids or codes. Duplicates collapse, unknown ids are dropped.
    ById {
        target_kind: TargetKind,
        ids: Vec<String>,
    },
    /// Every entry belonging to the given frames.
    ByGroup {
        frame_ids: Vec<i64>,
        #[serde(default)]
        pos: Option<String>,
        #[serde(default)]
        offset: Option<i64>,
        #[serde(default)]
        limit: Option<i64>,
    },
    /// Records matching a filter predicate. A limit of zero means no limit.
    ByFilter {
        target_kind: TargetKind,
        filter: FilterExpr,
        #[serde(default)]
        limit: Option<i64>,
        #[serde(default)]
        offset: Option<i64>,
    },
}

impl JobScope {
    pub fn target_kind(&self) -> TargetKind {
        match self {
            JobScope::ById { target_kind, .. } | JobScope::ByFilter { target_kind, .. } => {
                *target_kind
            }
            JobScope::ByGroup { .. } => TargetKind::Entry,
        }
    }
}

/// Which records a frame-scoped flag result is written to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagFanout {
    #[default]
    TargetOnly,
    MembersOnly,
    Both,
}

impl FlagFanout {
    pub fn includes_target(&self) -> bool {
        matches!(self, FlagFanout::TargetOnly | FlagFanout::Both)
    }

    pub fn includes_members(&self) -> bool {
        matches!(self, FlagFanout::MembersOnly | FlagFanout::Both)
    }
}

fn default_model() -> String {
    defaults::LLM_JOB_MODEL.to_string()
}

/// Immutable per-job configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default = "default_model")]
    pub model: String,
    pub prompt_template: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Group clusterable loop collections by semantic similarity before rendering.
    #[serde(default)]
    pub cluster: bool,
    /// Override for the sqrt(n) cluster-count heuristic.
    #[serde(default)]
    pub cluster_k: Option<usize>,
    /// Fields an edit job may propose changes to.
    #[serde(default)]
    pub editable_fields: Vec<String>,
    #[serde(default)]
    pub flag_fanout: FlagFanout,
    #[serde(default)]
    pub allow_frame_reassignment: bool,
    #[serde(default)]
    pub allow_relations: bool,
}

impl JobConfig {
    pub fn new(prompt_template: impl Into<String>) -> Self {
        Self {
            model: default_model(),
            prompt_template: prompt_template.into(),
            system_prompt: None,
            cluster: false,
            cluster_k: None,
            editable_fields: Vec::new(),
            flag_fanout: FlagFanout::default(),
            allow_frame_reassignment: false,
            allow_relations: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_clustering(mut self, k: Option<usize>) -> Self {
        self.cluster = true;
        self.cluster_k = k;
        self
    }

    pub fn with_editable_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.editable_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_flag_fanout(mut self, fanout: FlagFanout) -> Self {
        self.flag_fanout = fanout;
        self
    }

    pub fn with_frame_reassignment(mut self, allow: bool) -> Self {
        self.allow_frame_reassignment = allow;
        self
    }

    pub fn with_relations(mut self, allow: bool) -> Self {
        self.allow_relations = allow;
        self
    }
}

// =============================================================================
// JOB
// =============================================================================

/// Aggregate counters of a job, recomputed from its work items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: i64,
    pub submitted: i64,
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub flagged: i64,
}

impl JobCounters {
    /// Derive the job status from counters.
    ///
    /// `cancelled` is sticky: once stored it is returned regardless of counters.
    /// A job stays `queued` only until something is submitted or processed; a
    /// job that has started never goes back to `queued`. Applying this twice to
    /// the same counters yields the same status.
    pub fn derive_status(&self, current: JobStatus) -> JobStatus {
        if current == JobStatus::Cancelled {
            return JobStatus::Cancelled;
        }
        if self.processed < self.total {
            if current == JobStatus::Queued && self.submitted == 0 && self.processed == 0 {
                JobStatus::Queued
            } else {
                JobStatus::Running
            }
        } else if self.succeeded == self.total {
            JobStatus::Completed
        } else if self.failed == self.total {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }
}

/// A batch of work items sharing scope, prompt template and model config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub target_kind: TargetKind,
    pub label: Option<String>,
    pub scope: JobScope,
    pub config: JobConfig,
    pub status: JobStatus,
    #[serde(flatten)]
    pub counters: JobCounters,
    pub created_by: String,
    pub has_unseen_updates: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_cancelled(&self) -> bool {
        self.status == JobStatus::Cancelled
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Request for creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub job_type: JobType,
    pub scope: JobScope,
    pub config: JobConfig,
    #[serde(default)]
    pub label: Option<String>,
    pub created_by: String,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListFilter {
    pub target_kind: Option<TargetKind>,
    pub include_deleted: bool,
    pub limit: i64,
    pub offset: i64,
}

impl Default for JobListFilter {
    fn default() -> Self {
        Self {
            target_kind: None,
            include_deleted: false,
            limit: defaults::PAGE_LIMIT,
            offset: 0,
        }
    }
}

// =============================================================================
// LEXICON SNAPSHOTS
// =============================================================================

/// Compact view of a lexical entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryBrief {
    pub id: i64,
    pub code: Option<String>,
    pub lemma: String,
    pub pos: Option<String>,
    pub gloss: Option<String>,
    pub frame_id: Option<i64>,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub flagged_reason: Option<String>,
}

/// Compact view of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameBrief {
    pub id: i64,
    pub code: Option<String>,
    pub name: String,
    pub definition: Option<String>,
    pub parent_id: Option<i64>,
}

/// A participant role of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRole {
    pub name: String,
    pub description: Option<String>,
    pub core: bool,
}

/// An entry related to the snapshot's target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedEntry {
    pub id: i64,
    pub lemma: String,
    pub relation: String,
    pub gloss: Option<String>,
}

/// Denormalized view of a target record taken when the job is created.
///
/// Stored inside each work item's request payload so results can be applied
/// against what the prompt actually showed, even if the record later changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub target: TargetRef,
    pub code: Option<String>,
    /// Lemma for entries, frame name for frames.
    pub label: String,
    pub pos: Option<String>,
    /// Entry gloss or frame definition.
    pub gloss: Option<String>,
    pub frame_id: Option<i64>,
    pub frame_code: Option<String>,
    pub frame_name: Option<String>,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub flagged_reason: Option<String>,
    #[serde(default)]
    pub pending_changeset_id: Option<i64>,
    /// Current values of editable fields.
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
    #[serde(default)]
    pub roles: Vec<FrameRole>,
    #[serde(default)]
    pub related: Vec<RelatedEntry>,
    /// Other entries in the same frame (entry targets).
    #[serde(default)]
    pub siblings: Vec<EntryBrief>,
    /// Entries belonging to the frame (frame targets).
    #[serde(default)]
    pub members: Vec<EntryBrief>,
    #[serde(default)]
    pub child_frames: Vec<FrameBrief>,
}

impl EntitySnapshot {
    /// Minimal snapshot with only identity fields set.
    pub fn new(target: TargetRef, label: impl Into<String>) -> Self {
        Self {
            target,
            code: None,
            label: label.into(),
            pos: None,
            gloss: None,
            frame_id: None,
            frame_code: None,
            frame_name: None,
            flagged: false,
            flagged_reason: None,
            pending_changeset_id: None,
            fields: Map::new(),
            roles: Vec::new(),
            related: Vec::new(),
            siblings: Vec::new(),
            members: Vec::new(),
            child_frames: Vec::new(),
        }
    }

    /// Scalar fields as a flat record, used for `{{name}}` interpolation and
    /// in-memory filter evaluation. Editable fields override nothing already set.
    pub fn flat_record(&self) -> Map<String, JsonValue> {
        let mut out = Map::new();
        out.insert("id".into(), JsonValue::from(self.target.id()));
        out.insert("kind".into(), JsonValue::from(self.target.kind().as_str()));
        out.insert("label".into(), JsonValue::from(self.label.clone()));
        match self.target {
            TargetRef::Entry(_) => out.insert("lemma".into(), JsonValue::from(self.label.clone())),
            TargetRef::Frame(_) => out.insert("name".into(), JsonValue::from(self.label.clone())),
        };
        let opt = |v: &Option<String>| v.clone().map(JsonValue::from).unwrap_or(JsonValue::Null);
        out.insert("code".into(), opt(&self.code));
        out.insert("pos".into(), opt(&self.pos));
        out.insert("gloss".into(), opt(&self.gloss));
        out.insert("definition".into(), opt(&self.gloss));
        out.insert(
            "frame_id".into(),
            self.frame_id.map(JsonValue::from).unwrap_or(JsonValue::Null),
        );
        out.insert("frame_code".into(), opt(&self.frame_code));
        out.insert("frame_name".into(), opt(&self.frame_name));
        out.insert("flagged".into(), JsonValue::from(self.flagged));
        out.insert("flagged_reason".into(), opt(&self.flagged_reason));
        for (k, v) in &self.fields {
            out.entry(k.clone()).or_insert_with(|| v.clone());
        }
        out
    }
}

/// A resolved work item before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemSeed {
    pub target: TargetRef,
    pub snapshot: EntitySnapshot,
}

impl From<EntitySnapshot> for WorkItemSeed {
    fn from(snapshot: EntitySnapshot) -> Self {
        Self {
            target: snapshot.target,
            snapshot,
        }
    }
}

// =============================================================================
// WORK ITEMS
// =============================================================================

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// What was sent to the provider for one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub prompt: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub snapshot: EntitySnapshot,
}

/// A work item ready to be appended to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub target: TargetRef,
    pub request_payload: RequestPayload,
}

/// One unit of provider work bound to exactly one target record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub job_id: Uuid,
    pub target: TargetRef,
    pub status: WorkItemStatus,
    /// Set once on the first successful submission; never resubmit when present.
    pub provider_task_id: Option<String>,
    pub request_payload: RequestPayload,
    pub response_payload: Option<JsonValue>,
    pub last_error: Option<String>,
    pub poll_attempts: i32,
    pub flagged: bool,
    pub confidence: Option<f64>,
    pub usage: Option<TokenUsage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn is_submitted(&self) -> bool {
        self.provider_task_id.is_some()
    }
}

/// Partial update of a work item. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkItemUpdate {
    pub status: Option<WorkItemStatus>,
    pub response_payload: Option<JsonValue>,
    pub last_error: Option<String>,
    pub flagged: Option<bool>,
    pub confidence: Option<f64>,
    pub usage: Option<TokenUsage>,
    pub increment_poll_attempts: bool,
}

impl WorkItemUpdate {
    pub fn status(status: WorkItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::status(WorkItemStatus::Failed).with_error(error)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn with_response(mut self, response: JsonValue) -> Self {
        self.response_payload = Some(response);
        self
    }

    pub fn with_flagged(mut self, flagged: bool) -> Self {
        self.flagged = Some(flagged);
        self
    }

    pub fn with_confidence(mut self, confidence: Option<f64>) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn counting_poll(mut self) -> Self {
        self.increment_poll_attempts = true;
        self
    }
}

// =============================================================================
// PROVIDER
// =============================================================================

/// Status of a background task at the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTaskStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    /// Stopped early (token limit, content filter). Treated as failed.
    Incomplete,
}

/// Opaque provider identifier for one submitted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(pub String);

impl TaskHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One submission to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    /// Name of the structured output schema (e.g. `flag_result`).
    pub schema_name: String,
    /// Strict JSON schema the output must satisfy.
    pub schema: JsonValue,
    pub metadata: BTreeMap<String, String>,
}

/// Current state of a provider task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTask {
    pub id: String,
    pub status: ProviderTaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
}

// =============================================================================
// CLUSTERING
// =============================================================================

/// Request to the similarity-clustering service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub entity_ids: Vec<i64>,
    pub k: usize,
    pub seed: u64,
    pub max_iters: u32,
}

/// Cluster number assigned to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub id: i64,
    pub cluster: usize,
}

/// Response of the similarity-clustering service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub assignments: Vec<ClusterAssignment>,
    /// Number of requested ids the service had embeddings for.
    #[serde(default)]
    pub n_found: Option<usize>,
}

// =============================================================================
// CHANGESETS
// =============================================================================

/// Record type a changeset targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Entry,
    Frame,
    EntryRelation,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Entry => "entry",
            EntityType::Frame => "frame",
            EntityType::EntryRelation => "entry_relation",
        }
    }
}

impl From<TargetKind> for EntityType {
    fn from(kind: TargetKind) -> Self {
        match kind {
            TargetKind::Entry => EntityType::Entry,
            TargetKind::Frame => EntityType::Frame,
        }
    }
}

/// Proposed mutation of an existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedUpdate {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub current: JsonValue,
    pub proposed: Map<String, JsonValue>,
    pub submitted_by: String,
    pub job_id: Uuid,
}

/// Proposed creation of a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedCreate {
    pub entity_type: EntityType,
    pub proposed: Map<String, JsonValue>,
    pub submitted_by: String,
    pub job_id: Uuid,
}
