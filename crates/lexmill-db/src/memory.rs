//! In-memory collaborators for tests and local runs.
//!
//! [`MemoryJobStore`] keeps the same invariants as [`PgJobStore`](crate::PgJobStore):
//! counters are recomputed from items under one lock, terminal items refuse
//! status changes, and a task id is recorded at most once.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use lexmill_core::{
    defaults, new_v7, ChangesetSink, CreateJobRequest, EntitySnapshot, EntityType, EntryBrief,
    Error, FilterExpr, FrameBrief, FrameRole, Job, JobCounters, JobListFilter, JobStatus,
    JobStore, LexiconSource, NewWorkItem, ProposedCreate, ProposedUpdate, RelatedEntry, Result,
    TargetKind, TargetRef, WorkItem, WorkItemStatus, WorkItemUpdate,
};

// =============================================================================
// JOB STORE
// =============================================================================

#[derive(Default)]
struct StoreState {
    jobs: HashMap<Uuid, Job>,
    items: BTreeMap<i64, WorkItem>,
    next_item_id: i64,
}

impl StoreState {
    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut Job> {
        self.jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))
    }

    fn item_mut(&mut self, item_id: i64) -> Result<&mut WorkItem> {
        self.items
            .get_mut(&item_id)
            .ok_or(Error::WorkItemNotFound(item_id))
    }

    fn job_items(&self, job_id: Uuid) -> impl Iterator<Item = &WorkItem> {
        self.items.values().filter(move |i| i.job_id == job_id)
    }
}

/// In-memory [`JobStore`].
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<StoreState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn recompute_locked(state: &mut StoreState, job_id: Uuid) -> Result<Job> {
        let mut counters = JobCounters::default();
        for item in state.job_items(job_id) {
            counters.total += 1;
            if item.provider_task_id.is_some() {
                counters.submitted += 1;
            }
            if item.status.is_terminal() {
                counters.processed += 1;
            }
            match item.status {
                WorkItemStatus::Succeeded => counters.succeeded += 1,
                WorkItemStatus::Failed => counters.failed += 1,
                _ => {}
            }
            if item.flagged {
                counters.flagged += 1;
            }
        }

        let job = state.job_mut(job_id)?;
        let status = counters.derive_status(job.status);
        if counters.processed != job.counters.processed || status != job.status {
            job.has_unseen_updates = true;
        }
        if matches!(status, JobStatus::Completed | JobStatus::Failed) && job.completed_at.is_none() {
            job.completed_at = Some(Utc::now());
        }
        job.counters = counters;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, req: CreateJobRequest) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: new_v7(),
            job_type: req.job_type,
            target_kind: req.scope.target_kind(),
            label: req.label,
            scope: req.scope,
            config: req.config,
            status: JobStatus::Queued,
            counters: JobCounters::default(),
            created_by: req.created_by,
            has_unseen_updates: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            cancelled_at: None,
            deleted_at: None,
        };
        self.state.lock().await.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn append_work_items(&self, job_id: Uuid, items: Vec<NewWorkItem>) -> Result<Vec<i64>> {
        let mut state = self.state.lock().await;
        state.job_mut(job_id)?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            state.next_item_id += 1;
            let id = state.next_item_id;
            state.items.insert(
                id,
                WorkItem {
                    id,
                    job_id,
                    target: item.target,
                    status: WorkItemStatus::Queued,
                    provider_task_id: None,
                    request_payload: item.request_payload,
                    response_payload: None,
                    last_error: None,
                    poll_attempts: 0,
                    flagged: false,
                    confidence: None,
                    usage: None,
                    created_at: now,
                    updated_at: now,
                    submitted_at: None,
                    completed_at: None,
                },
            );
            ids.push(id);
        }
        Self::recompute_locked(&mut state, job_id)?;
        Ok(ids)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        let state = self.state.lock().await;
        state.jobs.get(&job_id).cloned().ok_or(Error::JobNotFound(job_id))
    }

    async fn list_jobs(&self, filter: &JobListFilter) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.include_deleted || j.deleted_at.is_none())
            .filter(|j| filter.target_kind.map_or(true, |k| j.target_kind == k))
            .cloned()
            .collect();
        // UUIDv7 ids sort by creation time.
        jobs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(jobs
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn list_items(&self, job_id: Uuid, limit: i64, offset: i64) -> Result<Vec<WorkItem>> {
        let state = self.state.lock().await;
        Ok(state
            .job_items(job_id)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get_item(&self, item_id: i64) -> Result<WorkItem> {
        let state = self.state.lock().await;
        state
            .items
            .get(&item_id)
            .cloned()
            .ok_or(Error::WorkItemNotFound(item_id))
    }

    async fn find_item_by_task(&self, provider_task_id: &str) -> Result<Option<WorkItem>> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .find(|i| i.provider_task_id.as_deref() == Some(provider_task_id))
            .cloned())
    }

    async fn submittable_items(&self, job_id: Uuid, limit: i64) -> Result<Vec<WorkItem>> {
        let state = self.state.lock().await;
        Ok(state
            .job_items(job_id)
            .filter(|i| i.status == WorkItemStatus::Queued && i.provider_task_id.is_none())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_submittable(&self, job_id: Uuid) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .job_items(job_id)
            .filter(|i| i.status == WorkItemStatus::Queued && i.provider_task_id.is_none())
            .count() as i64)
    }

    async fn pollable_items(&self, job_id: Uuid, limit: i64) -> Result<Vec<WorkItem>> {
        let state = self.state.lock().await;
        Ok(state
            .job_items(job_id)
            .filter(|i| !i.status.is_terminal() && i.provider_task_id.is_some())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Queued {
            return Ok(false);
        }
        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_submission(&self, item_id: i64, provider_task_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let item = state.item_mut(item_id)?;
        if item.provider_task_id.is_some() || item.status != WorkItemStatus::Queued {
            return Ok(false);
        }
        let now = Utc::now();
        item.provider_task_id = Some(provider_task_id.to_string());
        item.status = WorkItemStatus::Processing;
        item.submitted_at = Some(now);
        item.updated_at = now;
        Ok(true)
    }

    async fn update_work_item(&self, item_id: i64, update: WorkItemUpdate) -> Result<bool> {
        let mut state = self.state.lock().await;
        let item = state.item_mut(item_id)?;
        if update.status.is_some() && !item.status.accepts_status_change() {
            return Ok(false);
        }
        let now = Utc::now();
        if let Some(status) = update.status {
            item.status = status;
            if status.is_terminal() && item.completed_at.is_none() {
                item.completed_at = Some(now);
            }
        }
        if let Some(v) = update.response_payload {
            item.response_payload = Some(v);
        }
        if let Some(e) = update.last_error {
            item.last_error = Some(e);
        }
        if let Some(f) = update.flagged {
            item.flagged = f;
        }
        if let Some(c) = update.confidence {
            item.confidence = Some(c);
        }
        if let Some(u) = update.usage {
            item.usage = Some(u);
        }
        if update.increment_poll_attempts {
            item.poll_attempts += 1;
        }
        item.updated_at = now;
        Ok(true)
    }

    async fn recompute_aggregates(&self, job_id: Uuid) -> Result<Job> {
        let mut state = self.state.lock().await;
        Self::recompute_locked(&mut state, job_id)
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<i64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let job = state.job_mut(job_id)?;
        job.status = JobStatus::Cancelled;
        job.cancelled_at.get_or_insert(now);
        job.has_unseen_updates = true;
        job.updated_at = now;

        let mut skipped = 0;
        for item in state.items.values_mut() {
            if item.job_id == job_id
                && item.status == WorkItemStatus::Queued
                && item.provider_task_id.is_none()
            {
                item.status = WorkItemStatus::Skipped;
                item.completed_at = Some(now);
                item.updated_at = now;
                skipped += 1;
            }
        }
        Ok(skipped)
    }

    async fn soft_delete_job(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;
        job.deleted_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    async fn mark_seen(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        state.job_mut(job_id)?.has_unseen_updates = false;
        Ok(())
    }

    async fn active_job_ids(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut ids: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.deleted_at.is_none())
            .filter(|j| after.map_or(true, |after| j.id > after))
            .filter(|j| match j.status {
                JobStatus::Queued | JobStatus::Running => true,
                JobStatus::Cancelled => state
                    .job_items(j.id)
                    .any(|i| !i.status.is_terminal() && i.provider_task_id.is_some()),
                JobStatus::Completed | JobStatus::Failed => false,
            })
            .map(|j| j.id)
            .collect();
        ids.sort();
        ids.truncate(limit.max(0) as usize);
        Ok(ids)
    }
}

// =============================================================================
// LEXICON
// =============================================================================

/// An entry held by [`MemoryLexicon`].
#[derive(Debug, Clone)]
pub struct LexEntry {
    pub id: i64,
    pub code: Option<String>,
    pub lemma: String,
    pub pos: Option<String>,
    pub gloss: Option<String>,
    pub register: Option<String>,
    pub frame_id: Option<i64>,
    pub flagged: bool,
    pub flagged_reason: Option<String>,
    pub deleted: bool,
}

impl LexEntry {
    pub fn new(id: i64, lemma: impl Into<String>) -> Self {
        Self {
            id,
            code: None,
            lemma: lemma.into(),
            pos: None,
            gloss: None,
            register: None,
            frame_id: None,
            flagged: false,
            flagged_reason: None,
            deleted: false,
        }
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn pos(mut self, pos: impl Into<String>) -> Self {
        self.pos = Some(pos.into());
        self
    }

    pub fn gloss(mut self, gloss: impl Into<String>) -> Self {
        self.gloss = Some(gloss.into());
        self
    }

    pub fn register(mut self, register: impl Into<String>) -> Self {
        self.register = Some(register.into());
        self
    }

    pub fn in_frame(mut self, frame_id: i64) -> Self {
        self.frame_id = Some(frame_id);
        self
    }

    /// Mark the entry as already flagged.
    pub fn flagged(mut self, reason: impl Into<String>) -> Self {
        self.flagged = true;
        self.flagged_reason = Some(reason.into());
        self
    }

    fn brief(&self) -> EntryBrief {
        EntryBrief {
            id: self.id,
            code: self.code.clone(),
            lemma: self.lemma.clone(),
            pos: self.pos.clone(),
            gloss: self.gloss.clone(),
            frame_id: self.frame_id,
            flagged: self.flagged,
            flagged_reason: self.flagged_reason.clone(),
        }
    }
}

/// A frame held by [`MemoryLexicon`].
#[derive(Debug, Clone)]
pub struct LexFrame {
    pub id: i64,
    pub code: Option<String>,
    pub name: String,
    pub definition: Option<String>,
    pub parent_id: Option<i64>,
    pub roles: Vec<FrameRole>,
    pub deleted: bool,
}

impl LexFrame {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            code: None,
            name: name.into(),
            definition: None,
            parent_id: None,
            roles: Vec::new(),
            deleted: false,
        }
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = Some(definition.into());
        self
    }

    pub fn parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn role(mut self, name: impl Into<String>, core: bool) -> Self {
        self.roles.push(FrameRole {
            name: name.into(),
            description: None,
            core,
        });
        self
    }

    fn brief(&self) -> FrameBrief {
        FrameBrief {
            id: self.id,
            code: self.code.clone(),
            name: self.name.clone(),
            definition: self.definition.clone(),
            parent_id: self.parent_id,
        }
    }
}

#[derive(Default)]
struct LexiconState {
    entries: BTreeMap<i64, LexEntry>,
    frames: BTreeMap<i64, LexFrame>,
    relations: Vec<(i64, i64, String)>,
}

impl LexiconState {
    fn live_entries(&self) -> impl Iterator<Item = &LexEntry> {
        self.entries.values().filter(|e| !e.deleted)
    }

    fn live_frames(&self) -> impl Iterator<Item = &LexFrame> {
        self.frames.values().filter(|f| !f.deleted)
    }

    fn live_frame(&self, id: i64) -> Option<&LexFrame> {
        self.frames.get(&id).filter(|f| !f.deleted)
    }

    fn entry_snapshot(&self, e: &LexEntry) -> EntitySnapshot {
        let mut snap = EntitySnapshot::new(TargetRef::Entry(e.id), e.lemma.clone());
        snap.code = e.code.clone();
        snap.pos = e.pos.clone();
        snap.gloss = e.gloss.clone();
        snap.flagged = e.flagged;
        snap.flagged_reason = e.flagged_reason.clone();
        snap.frame_id = e.frame_id;

        let opt = |v: &Option<String>| v.clone().map(JsonValue::from).unwrap_or(JsonValue::Null);
        let mut fields = Map::new();
        fields.insert("lemma".into(), JsonValue::from(e.lemma.clone()));
        fields.insert("pos".into(), opt(&e.pos));
        fields.insert("gloss".into(), opt(&e.gloss));
        fields.insert("register".into(), opt(&e.register));
        snap.fields = fields;

        if let Some(frame) = e.frame_id.and_then(|id| self.live_frame(id)) {
            snap.frame_code = frame.code.clone();
            snap.frame_name = Some(frame.name.clone());
            snap.roles = frame.roles.clone();
            snap.siblings = self
                .live_entries()
                .filter(|s| s.frame_id == Some(frame.id) && s.id != e.id)
                .take(defaults::SNAPSHOT_SIBLING_LIMIT as usize)
                .map(LexEntry::brief)
                .collect();
        }
        snap.related = self
            .relations
            .iter()
            .filter(|(src, _, _)| *src == e.id)
            .filter_map(|(_, dst, rel)| {
                self.entries.get(dst).filter(|t| !t.deleted).map(|t| RelatedEntry {
                    id: t.id,
                    lemma: t.lemma.clone(),
                    relation: rel.clone(),
                    gloss: t.gloss.clone(),
                })
            })
            .take(defaults::SNAPSHOT_RELATED_LIMIT as usize)
            .collect();
        snap
    }

    fn frame_snapshot(&self, f: &LexFrame) -> EntitySnapshot {
        let mut snap = EntitySnapshot::new(TargetRef::Frame(f.id), f.name.clone());
        snap.code = f.code.clone();
        snap.gloss = f.definition.clone();
        snap.frame_id = f.parent_id;
        if let Some(parent) = f.parent_id.and_then(|id| self.live_frame(id)) {
            snap.frame_code = parent.code.clone();
            snap.frame_name = Some(parent.name.clone());
        }
        let mut fields = Map::new();
        fields.insert("name".into(), JsonValue::from(f.name.clone()));
        fields.insert(
            "definition".into(),
            f.definition.clone().map(JsonValue::from).unwrap_or(JsonValue::Null),
        );
        snap.fields = fields;
        snap.roles = f.roles.clone();
        snap.members = self
            .live_entries()
            .filter(|e| e.frame_id == Some(f.id))
            .take(defaults::SNAPSHOT_MEMBER_LIMIT as usize)
            .map(LexEntry::brief)
            .collect();
        snap.child_frames = self
            .live_frames()
            .filter(|c| c.parent_id == Some(f.id))
            .map(LexFrame::brief)
            .collect();
        snap
    }

    fn all_snapshots(&self, kind: TargetKind) -> Vec<EntitySnapshot> {
        match kind {
            TargetKind::Entry => self.live_entries().map(|e| self.entry_snapshot(e)).collect(),
            TargetKind::Frame => self.live_frames().map(|f| self.frame_snapshot(f)).collect(),
        }
    }

    fn lookup(&self, kind: TargetKind, raw: &str) -> Option<i64> {
        let s = raw.trim();
        let by_id = s.parse::<i64>().ok();
        match kind {
            TargetKind::Entry => self
                .live_entries()
                .find(|e| e.code.as_deref() == Some(s))
                .or_else(|| by_id.and_then(|id| self.entries.get(&id).filter(|e| !e.deleted)))
                .map(|e| e.id),
            TargetKind::Frame => self
                .live_frames()
                .find(|f| f.code.as_deref() == Some(s))
                .or_else(|| by_id.and_then(|id| self.live_frame(id)))
                .map(|f| f.id),
        }
    }
}

/// In-memory [`LexiconSource`]. Filters are evaluated with [`FilterExpr::matches`]
/// against each record's flat snapshot.
#[derive(Default)]
pub struct MemoryLexicon {
    state: RwLock<LexiconState>,
}

impl MemoryLexicon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, entry: LexEntry) -> Self {
        self.state.get_mut().entries.insert(entry.id, entry);
        self
    }

    pub fn with_frame(mut self, frame: LexFrame) -> Self {
        self.state.get_mut().frames.insert(frame.id, frame);
        self
    }

    pub fn with_relation(mut self, source: i64, target: i64, relation: impl Into<String>) -> Self {
        self.state
            .get_mut()
            .relations
            .push((source, target, relation.into()));
        self
    }

    /// Soft-delete an entry so lookups stop finding it.
    pub async fn delete_entry(&self, id: i64) {
        if let Some(e) = self.state.write().await.entries.get_mut(&id) {
            e.deleted = true;
        }
    }

    pub async fn delete_frame(&self, id: i64) {
        if let Some(f) = self.state.write().await.frames.get_mut(&id) {
            f.deleted = true;
        }
    }

    fn window(ids: Vec<i64>, limit: Option<i64>, offset: i64) -> Vec<i64> {
        let it = ids.into_iter().skip(offset.max(0) as usize);
        match limit {
            Some(n) => it.take(n.max(0) as usize).collect(),
            None => it.collect(),
        }
    }
}

#[async_trait]
impl LexiconSource for MemoryLexicon {
    async fn resolve_ids(&self, kind: TargetKind, ids: &[String]) -> Result<Vec<i64>> {
        let state = self.state.read().await;
        Ok(ids.iter().filter_map(|raw| state.lookup(kind, raw)).collect())
    }

    async fn count_frame_entries(&self, frame_ids: &[i64], pos: Option<&str>) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .live_entries()
            .filter(|e| e.frame_id.is_some_and(|f| frame_ids.contains(&f)))
            .filter(|e| pos.map_or(true, |p| e.pos.as_deref() == Some(p)))
            .count() as i64)
    }

    async fn frame_entry_ids(
        &self,
        frame_ids: &[i64],
        pos: Option<&str>,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<Vec<i64>> {
        let state = self.state.read().await;
        let ids = state
            .live_entries()
            .filter(|e| e.frame_id.is_some_and(|f| frame_ids.contains(&f)))
            .filter(|e| pos.map_or(true, |p| e.pos.as_deref() == Some(p)))
            .map(|e| e.id)
            .collect();
        Ok(Self::window(ids, limit, offset))
    }

    async fn count_filtered(&self, kind: TargetKind, filter: &FilterExpr) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .all_snapshots(kind)
            .iter()
            .filter(|s| filter.matches(&s.flat_record()))
            .count() as i64)
    }

    async fn filtered_ids(
        &self,
        kind: TargetKind,
        filter: &FilterExpr,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<Vec<i64>> {
        let state = self.state.read().await;
        let ids = state
            .all_snapshots(kind)
            .iter()
            .filter(|s| filter.matches(&s.flat_record()))
            .map(|s| s.target.id())
            .collect();
        Ok(Self::window(ids, limit, offset))
    }

    async fn snapshots(&self, kind: TargetKind, ids: &[i64]) -> Result<Vec<EntitySnapshot>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| match kind {
                TargetKind::Entry => state
                    .entries
                    .get(id)
                    .filter(|e| !e.deleted)
                    .map(|e| state.entry_snapshot(e)),
                TargetKind::Frame => state.live_frame(*id).map(|f| state.frame_snapshot(f)),
            })
            .collect())
    }

    async fn find_entry(&self, code_or_id: &str) -> Result<Option<EntryBrief>> {
        let state = self.state.read().await;
        Ok(state
            .lookup(TargetKind::Entry, code_or_id)
            .and_then(|id| state.entries.get(&id))
            .map(LexEntry::brief))
    }

    async fn find_frame(&self, code_or_id: &str) -> Result<Option<FrameBrief>> {
        let state = self.state.read().await;
        Ok(state
            .lookup(TargetKind::Frame, code_or_id)
            .and_then(|id| state.frames.get(&id))
            .map(LexFrame::brief))
    }
}

// =============================================================================
// CHANGESETS
// =============================================================================

/// A changeset captured by [`MemoryChangesets`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedChangeset {
    pub id: i64,
    pub entity_type: EntityType,
    /// `None` for creations.
    pub entity_id: Option<i64>,
    pub current: Option<JsonValue>,
    pub proposed: Map<String, JsonValue>,
    pub submitted_by: String,
    pub job_id: Uuid,
    pub discarded: bool,
    pub comments: Vec<(String, String)>,
}

/// In-memory [`ChangesetSink`] that records everything it receives.
#[derive(Default)]
pub struct MemoryChangesets {
    records: Mutex<Vec<RecordedChangeset>>,
}

impl MemoryChangesets {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<RecordedChangeset> {
        self.records.lock().await.clone()
    }

    pub async fn for_job(&self, job_id: Uuid) -> Vec<RecordedChangeset> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Pre-seed a pending changeset (e.g. one a review job will comment on).
    pub async fn seed(&self, entity_type: EntityType, entity_id: i64, job_id: Uuid) -> i64 {
        let mut records = self.records.lock().await;
        let id = records.len() as i64 + 1;
        records.push(RecordedChangeset {
            id,
            entity_type,
            entity_id: Some(entity_id),
            current: None,
            proposed: Map::new(),
            submitted_by: "seed".into(),
            job_id,
            discarded: false,
            comments: Vec::new(),
        });
        id
    }
}

#[async_trait]
impl ChangesetSink for MemoryChangesets {
    async fn create_from_update(&self, update: ProposedUpdate) -> Result<i64> {
        let mut records = self.records.lock().await;
        let id = records.len() as i64 + 1;
        records.push(RecordedChangeset {
            id,
            entity_type: update.entity_type,
            entity_id: Some(update.entity_id),
            current: Some(update.current),
            proposed: update.proposed,
            submitted_by: update.submitted_by,
            job_id: update.job_id,
            discarded: false,
            comments: Vec::new(),
        });
        Ok(id)
    }

    async fn create_from_create(&self, create: ProposedCreate) -> Result<i64> {
        let mut records = self.records.lock().await;
        let id = records.len() as i64 + 1;
        records.push(RecordedChangeset {
            id,
            entity_type: create.entity_type,
            entity_id: None,
            current: None,
            proposed: create.proposed,
            submitted_by: create.submitted_by,
            job_id: create.job_id,
            discarded: false,
            comments: Vec::new(),
        });
        Ok(id)
    }

    async fn add_comment(&self, changeset_id: i64, author: &str, text: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|c| c.id == changeset_id)
            .ok_or_else(|| Error::NotFound(format!("changeset {changeset_id}")))?;
        record.comments.push((author.to_string(), text.to_string()));
        Ok(())
    }

    async fn discard_by_job(&self, job_id: Uuid) -> Result<u64> {
        let mut records = self.records.lock().await;
        let mut n = 0;
        for c in records.iter_mut().filter(|c| c.job_id == job_id && !c.discarded) {
            c.discarded = true;
            n += 1;
        }
        Ok(n)
    }
}
