//! Result applier: turns a parsed result into reviewable changesets.
//!
//! The applier never mutates lexicon records. Every proposal goes through the
//! [`ChangesetSink`], reasoning text is attached as a comment, and a failure
//! on one entity is logged and skipped so the rest of the result still lands.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, warn};

use lexmill_core::{
    AllocateResult, ChangesetSink, EditResult, EntitySnapshot, EntityType, FlagResult, Job,
    JobResult, LexiconSource, ProposedCreate, ProposedUpdate, ReallocateResult, Result,
    ReviewResult, SplitResult, TargetKind, TargetRef, WorkItem,
};

use crate::engine::Engine;

/// Author of comments the applier attaches.
pub const COMMENT_AUTHOR: &str = "llm";

/// What one application produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyOutcome {
    /// Changesets created, in creation order.
    pub changesets: Vec<i64>,
    /// Comments attached, including those on pre-existing changesets.
    pub comments: usize,
    /// Proposals dropped because they referenced missing records or failed.
    pub skipped: Vec<String>,
    /// One-line summary for results that propose nothing themselves.
    pub summary: Option<String>,
}

impl ApplyOutcome {
    pub fn is_noop(&self) -> bool {
        self.changesets.is_empty() && self.comments == 0
    }

    fn skip(&mut self, reason: String) {
        debug!(subsystem = "jobs", component = "applier", reason = %reason, "Proposal skipped");
        self.skipped.push(reason);
    }
}

/// Applies [`JobResult`]s through the changeset sink.
#[derive(Clone)]
pub struct ResultApplier {
    lexicon: Arc<dyn LexiconSource>,
    changesets: Arc<dyn ChangesetSink>,
}

impl ResultApplier {
    pub fn new(lexicon: Arc<dyn LexiconSource>, changesets: Arc<dyn ChangesetSink>) -> Self {
        Self {
            lexicon,
            changesets,
        }
    }

    pub fn from_engine(engine: &Engine) -> Self {
        Self::new(engine.lexicon.clone(), engine.changesets.clone())
    }

    /// Apply `result` for `item` using the snapshot stored with the item.
    ///
    /// Proposing nothing is a success.
    pub async fn apply(&self, item: &WorkItem, result: &JobResult, job: &Job) -> Result<ApplyOutcome> {
        let snapshot = &item.request_payload.snapshot;
        let mut ctx = ApplyContext {
            job,
            snapshot,
            outcome: ApplyOutcome::default(),
        };

        match result {
            JobResult::Flag(r) => self.apply_flag(&mut ctx, r).await,
            JobResult::Edit(r) => self.apply_edit(&mut ctx, r).await,
            JobResult::Reallocate(r) => self.apply_reallocate(&mut ctx, r).await,
            JobResult::Allocate(r) => self.apply_allocate(&mut ctx, r).await,
            JobResult::Split(r) => apply_split(&mut ctx, r),
            JobResult::Review(r) => self.apply_review(&mut ctx, r).await,
        }

        if let Some(notes) = result.notes() {
            if !matches!(result, JobResult::Review(_)) {
                for id in ctx.outcome.changesets.clone() {
                    self.comment(&mut ctx.outcome, id, notes).await;
                }
            }
        }

        info!(
            subsystem = "jobs",
            component = "applier",
            job_id = %job.id,
            item_id = item.id,
            job_type = %job.job_type,
            changesets = ctx.outcome.changesets.len(),
            skipped = ctx.outcome.skipped.len(),
            "Result applied"
        );
        Ok(ctx.outcome)
    }

    // -------------------------------------------------------------------------
    // flag
    // -------------------------------------------------------------------------

    async fn apply_flag(&self, ctx: &mut ApplyContext<'_>, r: &FlagResult) {
        let snapshot = ctx.snapshot;
        let fanout = ctx.job.config.flag_fanout;
        let frame_target = matches!(snapshot.target, TargetRef::Frame(_));
        let mut proposed = Map::new();
        proposed.insert("flagged".into(), json!(r.flagged));
        proposed.insert("flagged_reason".into(), json!(r.flagged_reason));

        let target_changed = snapshot.flagged != r.flagged
            || (r.flagged && snapshot.flagged_reason != r.flagged_reason);
        if (!frame_target || fanout.includes_target()) && target_changed {
            let current = json!({
                "flagged": snapshot.flagged,
                "flagged_reason": snapshot.flagged_reason,
            });
            self.propose_update(
                ctx,
                snapshot.target.kind().into(),
                snapshot.target.id(),
                current,
                proposed.clone(),
            )
            .await;
        }

        if frame_target && fanout.includes_members() && r.flagged {
            for member in &snapshot.members {
                if member.flagged && member.flagged_reason == r.flagged_reason {
                    continue;
                }
                let current = json!({
                    "flagged": member.flagged,
                    "flagged_reason": member.flagged_reason,
                });
                self.propose_update(ctx, EntityType::Entry, member.id, current, proposed.clone())
                    .await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // edit
    // -------------------------------------------------------------------------

    async fn apply_edit(&self, ctx: &mut ApplyContext<'_>, r: &EditResult) {
        let snapshot = ctx.snapshot;
        let job = ctx.job;
        let config = &job.config;
        let record = snapshot.flat_record();
        let mut current = Map::new();
        let mut proposed = Map::new();

        for edit in &r.edits {
            if !config.editable_fields.iter().any(|f| f == &edit.field) {
                ctx.outcome
                    .skip(format!("field '{}' is not editable", edit.field));
                continue;
            }
            let existing = record.get(&edit.field).cloned().unwrap_or(JsonValue::Null);
            if existing.as_str() == Some(edit.value.as_str()) {
                continue;
            }
            current.insert(edit.field.clone(), existing);
            proposed.insert(edit.field.clone(), json!(edit.value));
        }

        if let Some(code) = r.new_frame_code.as_deref().filter(|c| !c.trim().is_empty()) {
            if !config.allow_frame_reassignment {
                ctx.outcome.skip(format!("frame reassignment to '{code}' not allowed"));
            } else if snapshot.target.kind() != TargetKind::Entry {
                ctx.outcome.skip(format!("frame reassignment to '{code}' on a frame target"));
            } else {
                match self.lexicon.find_frame(code).await {
                    Ok(Some(frame)) if Some(frame.id) != snapshot.frame_id => {
                        current.insert("frame_id".into(), json!(snapshot.frame_id));
                        proposed.insert("frame_id".into(), json!(frame.id));
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => ctx.outcome.skip(format!("frame '{code}' not found")),
                    Err(e) => ctx.outcome.skip(format!("frame '{code}' lookup failed: {e}")),
                }
            }
        }

        if !proposed.is_empty() {
            self.propose_update(
                ctx,
                snapshot.target.kind().into(),
                snapshot.target.id(),
                JsonValue::Object(current),
                proposed,
            )
            .await;
        }

        if r.relations.is_empty() {
            return;
        }
        let TargetRef::Entry(source_id) = snapshot.target else {
            ctx.outcome.skip("relations on a frame target".into());
            return;
        };
        if !config.allow_relations {
            ctx.outcome
                .skip(format!("{} relation proposals not allowed", r.relations.len()));
            return;
        }
        for relation in &r.relations {
            let target = match self.lexicon.find_entry(&relation.target_code).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    ctx.outcome
                        .skip(format!("relation target '{}' not found", relation.target_code));
                    continue;
                }
                Err(e) => {
                    ctx.outcome.skip(format!(
                        "relation target '{}' lookup failed: {e}",
                        relation.target_code
                    ));
                    continue;
                }
            };
            let mut fields = Map::new();
            fields.insert("source_id".into(), json!(source_id));
            fields.insert("target_id".into(), json!(target.id));
            fields.insert("relation_type".into(), json!(relation.relation_type));
            let create = ProposedCreate {
                entity_type: EntityType::EntryRelation,
                proposed: fields,
                submitted_by: submitted_by(job),
                job_id: job.id,
            };
            match self.changesets.create_from_create(create).await {
                Ok(id) => ctx.outcome.changesets.push(id),
                Err(e) => ctx.outcome.skip(format!(
                    "relation to '{}' not proposed: {e}",
                    relation.target_code
                )),
            }
        }
    }

    // -------------------------------------------------------------------------
    // reallocate / allocate
    // -------------------------------------------------------------------------

    async fn apply_reallocate(&self, ctx: &mut ApplyContext<'_>, r: &ReallocateResult) {
        for mv in &r.moves {
            let entry = match self.lexicon.find_entry(&mv.entry_code).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    ctx.outcome.skip(format!("entry '{}' not found", mv.entry_code));
                    continue;
                }
                Err(e) => {
                    ctx.outcome
                        .skip(format!("entry '{}' lookup failed: {e}", mv.entry_code));
                    continue;
                }
            };
            let frame = match self.lexicon.find_frame(&mv.target_frame_code).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    ctx.outcome
                        .skip(format!("frame '{}' not found", mv.target_frame_code));
                    continue;
                }
                Err(e) => {
                    ctx.outcome.skip(format!(
                        "frame '{}' lookup failed: {e}",
                        mv.target_frame_code
                    ));
                    continue;
                }
            };
            if entry.frame_id == Some(frame.id) {
                continue;
            }
            let mut proposed = Map::new();
            proposed.insert("frame_id".into(), json!(frame.id));
            let created = self
                .propose_update(
                    ctx,
                    EntityType::Entry,
                    entry.id,
                    json!({ "frame_id": entry.frame_id }),
                    proposed,
                )
                .await;
            if let (Some(id), Some(reason)) = (created, mv.reason.as_deref()) {
                self.comment(&mut ctx.outcome, id, reason).await;
            }
        }
    }

    async fn apply_allocate(&self, ctx: &mut ApplyContext<'_>, r: &AllocateResult) {
        let snapshot = ctx.snapshot;
        let Some(code) = r.recommended_frame_code.as_deref().filter(|c| !c.trim().is_empty())
        else {
            return;
        };
        let TargetRef::Entry(entry_id) = snapshot.target else {
            ctx.outcome.skip("allocation of a frame target".into());
            return;
        };
        let frame = match self.lexicon.find_frame(code).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                ctx.outcome.skip(format!("frame '{code}' not found"));
                return;
            }
            Err(e) => {
                ctx.outcome.skip(format!("frame '{code}' lookup failed: {e}"));
                return;
            }
        };
        if snapshot.frame_id == Some(frame.id) {
            return;
        }
        let mut proposed = Map::new();
        proposed.insert("frame_id".into(), json!(frame.id));
        self.propose_update(
            ctx,
            EntityType::Entry,
            entry_id,
            json!({ "frame_id": snapshot.frame_id }),
            proposed,
        )
        .await;
    }

    // -------------------------------------------------------------------------
    // review
    // -------------------------------------------------------------------------

    async fn apply_review(&self, ctx: &mut ApplyContext<'_>, r: &ReviewResult) {
        let Some(changeset_id) = ctx.snapshot.pending_changeset_id else {
            ctx.outcome.skip("no pending changeset to review".into());
            return;
        };
        let mut text = format!(
            "Recommended action: {}\n{}",
            r.action.as_str(),
            r.justification.trim()
        );
        if let Some(notes) = r.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            text.push_str("\n\n");
            text.push_str(notes);
        }
        self.comment(&mut ctx.outcome, changeset_id, &text).await;
        ctx.outcome.summary = Some(format!("review: {}", r.action.as_str()));
    }

    // -------------------------------------------------------------------------
    // helpers
    // -------------------------------------------------------------------------

    async fn propose_update(
        &self,
        ctx: &mut ApplyContext<'_>,
        entity_type: EntityType,
        entity_id: i64,
        current: JsonValue,
        proposed: Map<String, JsonValue>,
    ) -> Option<i64> {
        let update = ProposedUpdate {
            entity_type,
            entity_id,
            current,
            proposed,
            submitted_by: submitted_by(ctx.job),
            job_id: ctx.job.id,
        };
        match self.changesets.create_from_update(update).await {
            Ok(id) => {
                debug!(
                    subsystem = "jobs",
                    component = "applier",
                    changeset_id = id,
                    entity_type = entity_type.as_str(),
                    entity_id,
                    "Changeset proposed"
                );
                ctx.outcome.changesets.push(id);
                Some(id)
            }
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "applier",
                    entity_type = entity_type.as_str(),
                    entity_id,
                    error = %e,
                    "Changeset creation failed"
                );
                ctx.outcome.skipped.push(format!(
                    "{} {entity_id}: {e}",
                    entity_type.as_str()
                ));
                None
            }
        }
    }

    async fn comment(&self, outcome: &mut ApplyOutcome, changeset_id: i64, text: &str) {
        match self
            .changesets
            .add_comment(changeset_id, COMMENT_AUTHOR, text)
            .await
        {
            Ok(()) => outcome.comments += 1,
            Err(e) => warn!(
                subsystem = "jobs",
                component = "applier",
                changeset_id,
                error = %e,
                "Failed to attach comment"
            ),
        }
    }
}

struct ApplyContext<'a> {
    job: &'a Job,
    snapshot: &'a EntitySnapshot,
    outcome: ApplyOutcome,
}

fn apply_split(ctx: &mut ApplyContext<'_>, r: &SplitResult) {
    ctx.outcome.summary = Some(format!(
        "split: {} new frames, {} reallocations, original {}",
        r.new_frames_created,
        r.reallocations,
        if r.original_deleted { "deleted" } else { "kept" }
    ));
}

fn submitted_by(job: &Job) -> String {
    format!("llm_job:{}", job.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexmill_core::{
        CreateJobRequest, EntryBrief, FlagFanout, JobConfig, JobScope, JobStore, JobType,
        NewWorkItem, RequestPayload,
    };
    use lexmill_db::{LexEntry, LexFrame, MemoryChangesets, MemoryJobStore, MemoryLexicon};
    use std::collections::BTreeMap;

    struct Fixture {
        store: MemoryJobStore,
        changesets: Arc<MemoryChangesets>,
        applier: ResultApplier,
    }

    fn fixture() -> Fixture {
        let lexicon = Arc::new(
            MemoryLexicon::new()
                .with_frame(LexFrame::new(10, "Motion").code("motion"))
                .with_frame(LexFrame::new(20, "Speed").code("speed"))
                .with_entry(LexEntry::new(1, "run").code("run.v").in_frame(10))
                .with_entry(LexEntry::new(2, "dash").code("dash.v").in_frame(10)),
        );
        let changesets = Arc::new(MemoryChangesets::new());
        Fixture {
            store: MemoryJobStore::new(),
            applier: ResultApplier::new(lexicon, changesets.clone()),
            changesets,
        }
    }

    async fn job_and_item(
        store: &MemoryJobStore,
        job_type: JobType,
        config: JobConfig,
        snapshot: EntitySnapshot,
    ) -> (Job, WorkItem) {
        let job = store
            .create_job(CreateJobRequest {
                job_type,
                scope: JobScope::ById {
                    target_kind: snapshot.target.kind(),
                    ids: vec![snapshot.target.id().to_string()],
                },
                config,
                label: None,
                created_by: "tester".into(),
            })
            .await
            .unwrap();
        let ids = store
            .append_work_items(
                job.id,
                vec![NewWorkItem {
                    target: snapshot.target,
                    request_payload: RequestPayload {
                        prompt: "p".into(),
                        variables: BTreeMap::new(),
                        snapshot,
                    },
                }],
            )
            .await
            .unwrap();
        let item = store.get_item(ids[0]).await.unwrap();
        (job, item)
    }

    fn entry_snapshot() -> EntitySnapshot {
        let mut s = EntitySnapshot::new(TargetRef::Entry(1), "run");
        s.frame_id = Some(10);
        s.gloss = Some("move fast".into());
        s
    }

    #[tokio::test]
    async fn test_flag_unchanged_is_noop() {
        let f = fixture();
        let (job, item) = job_and_item(&f.store, JobType::Flag, JobConfig::new("t"), entry_snapshot()).await;
        let result = JobResult::parse(JobType::Flag, r#"{"flagged":false,"confidence":0.9}"#).unwrap();
        let outcome = f.applier.apply(&item, &result, &job).await.unwrap();
        assert!(outcome.is_noop());
        assert!(f.changesets.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_flag_with_notes_comments() {
        let f = fixture();
        let (job, item) = job_and_item(&f.store, JobType::Flag, JobConfig::new("t"), entry_snapshot()).await;
        let result = JobResult::parse(
            JobType::Flag,
            r#"{"flagged":true,"flagged_reason":"archaic sense","confidence":0.8,"notes":"seen in old texts"}"#,
        )
        .unwrap();
        let outcome = f.applier.apply(&item, &result, &job).await.unwrap();
        assert_eq!(outcome.changesets.len(), 1);
        let recorded = &f.changesets.all().await[0];
        assert_eq!(recorded.proposed["flagged"], json!(true));
        assert_eq!(recorded.proposed["flagged_reason"], json!("archaic sense"));
        assert!(!recorded.proposed.contains_key("notes"));
        assert_eq!(recorded.comments, vec![(COMMENT_AUTHOR.to_string(), "seen in old texts".to_string())]);
    }

    #[tokio::test]
    async fn test_flag_fanout_members_only() {
        let f = fixture();
        let mut snapshot = EntitySnapshot::new(TargetRef::Frame(10), "Motion");
        for (id, lemma, reason) in [(1, "run", None), (2, "dash", Some("dated")), (3, "hie", Some("archaic"))] {
            snapshot.members.push(EntryBrief {
                id,
                code: None,
                lemma: lemma.into(),
                pos: None,
                gloss: None,
                frame_id: Some(10),
                flagged: reason.is_some(),
                flagged_reason: reason.map(String::from),
            });
        }
        let config = JobConfig::new("t").with_flag_fanout(FlagFanout::MembersOnly);
        let (job, item) = job_and_item(&f.store, JobType::Flag, config, snapshot).await;
        let result = JobResult::parse(
            JobType::Flag,
            r#"{"flagged":true,"flagged_reason":"archaic","confidence":0.7}"#,
        )
        .unwrap();
        f.applier.apply(&item, &result, &job).await.unwrap();
        let recorded = f.changesets.all().await;
        // Entry 3 already carries the same flag.
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|c| c.entity_type == EntityType::Entry));
        assert_eq!(
            recorded[0].current,
            Some(json!({"flagged": false, "flagged_reason": null}))
        );
        assert_eq!(
            recorded[1].current,
            Some(json!({"flagged": true, "flagged_reason": "dated"}))
        );
    }

    #[tokio::test]
    async fn test_edit_respects_whitelist_and_validates() {
        let f = fixture();
        let config = JobConfig::new("t")
            .with_editable_fields(["gloss"])
            .with_frame_reassignment(true)
            .with_relations(true);
        let (job, item) = job_and_item(&f.store, JobType::Edit, config, entry_snapshot()).await;
        let raw = r#"{
            "edits": [{"field":"gloss","value":"move quickly"},{"field":"lemma","value":"ran"}],
            "new_frame_code": "speed",
            "relations": [{"relation_type":"synonym","target_code":"dash.v"},{"relation_type":"synonym","target_code":"ghost"}],
            "confidence": 0.6
        }"#;
        let result = JobResult::parse(JobType::Edit, raw).unwrap();
        let outcome = f.applier.apply(&item, &result, &job).await.unwrap();

        let recorded = f.changesets.all().await;
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].proposed["gloss"], json!("move quickly"));
        assert_eq!(recorded[0].proposed["frame_id"], json!(20));
        assert!(!recorded[0].proposed.contains_key("lemma"));
        assert_eq!(recorded[1].entity_type, EntityType::EntryRelation);
        assert_eq!(recorded[1].proposed["target_id"], json!(2));
        assert_eq!(outcome.skipped.len(), 2);
    }

    #[tokio::test]
    async fn test_reallocate_skips_unknown() {
        let f = fixture();
        let (job, item) = job_and_item(&f.store, JobType::Reallocate, JobConfig::new("t"), entry_snapshot()).await;
        let raw = r#"{"moves":[
            {"entry_code":"dash.v","target_frame_code":"speed","reason":"about velocity"},
            {"entry_code":"run.v","target_frame_code":"motion"},
            {"entry_code":"nope","target_frame_code":"speed"},
            {"entry_code":"run.v","target_frame_code":"nowhere"}
        ],"confidence":0.5}"#;
        let result = JobResult::parse(JobType::Reallocate, raw).unwrap();
        let outcome = f.applier.apply(&item, &result, &job).await.unwrap();
        assert_eq!(outcome.changesets.len(), 1);
        assert_eq!(outcome.skipped.len(), 2);
        let recorded = &f.changesets.all().await[0];
        assert_eq!(recorded.entity_id, Some(2));
        assert_eq!(recorded.comments[0].1, "about velocity");
    }

    #[tokio::test]
    async fn test_allocate_only_when_different() {
        let f = fixture();
        let (job, item) = job_and_item(&f.store, JobType::Allocate, JobConfig::new("t"), entry_snapshot()).await;
        let same = JobResult::parse(JobType::Allocate, r#"{"recommended_frame_code":"motion","confidence":0.9}"#).unwrap();
        assert!(f.applier.apply(&item, &same, &job).await.unwrap().is_noop());
        let other = JobResult::parse(JobType::Allocate, r#"{"recommended_frame_code":"speed","confidence":0.9}"#).unwrap();
        assert_eq!(f.applier.apply(&item, &other, &job).await.unwrap().changesets.len(), 1);
    }

    #[tokio::test]
    async fn test_split_records_summary_only() {
        let f = fixture();
        let snapshot = EntitySnapshot::new(TargetRef::Frame(10), "Motion");
        let (job, item) = job_and_item(&f.store, JobType::Split, JobConfig::new("t"), snapshot).await;
        let raw = r#"{"new_frames_created":2,"reallocations":5,"original_deleted":false}"#;
        let result = JobResult::parse(JobType::Split, raw).unwrap();
        let outcome = f.applier.apply(&item, &result, &job).await.unwrap();
        assert!(outcome.changesets.is_empty());
        assert_eq!(
            outcome.summary.as_deref(),
            Some("split: 2 new frames, 5 reallocations, original kept")
        );
    }

    #[tokio::test]
    async fn test_review_comments_on_pending_changeset() {
        let f = fixture();
        let mut snapshot = entry_snapshot();
        let (job, _) = job_and_item(&f.store, JobType::Review, JobConfig::new("t"), snapshot.clone()).await;
        let pending = f.changesets.seed(EntityType::Entry, 1, job.id).await;
        snapshot.pending_changeset_id = Some(pending);
        let (_, item) = job_and_item(&f.store, JobType::Review, JobConfig::new("t"), snapshot).await;

        let raw = r#"{"action":"reject","justification":"gloss is wrong","confidence":0.7}"#;
        let result = JobResult::parse(JobType::Review, raw).unwrap();
        let outcome = f.applier.apply(&item, &result, &job).await.unwrap();
        assert!(outcome.changesets.is_empty());
        assert_eq!(outcome.comments, 1);
        let recorded = f.changesets.all().await;
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].comments[0].1.starts_with("Recommended action: reject"));
    }
}
