//! Shared setup for job engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use lexmill_db::{LexEntry, LexFrame, MemoryChangesets, MemoryJobStore, MemoryLexicon};
use lexmill_inference::mock::{MockClusteringService, MockProvider};
use lexmill_jobs::{
    CreateJobRequest, Engine, EventEnvelope, JobConfig, JobEvent, JobScope, JobService, JobType,
    ServiceConfig, TargetKind, TargetRef, WorkItem,
};
use tokio::sync::broadcast;
use uuid::Uuid;

pub const FLAG_YES: &str =
    r#"{"flagged": true, "flagged_reason": "archaic", "confidence": 0.92, "notes": "Rare since 1900."}"#;
pub const FLAG_NO: &str = r#"{"flagged": false, "flagged_reason": null, "confidence": 0.81}"#;

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub lexicon: Arc<MemoryLexicon>,
    pub changesets: Arc<MemoryChangesets>,
    pub provider: Arc<MockProvider>,
    pub engine: Engine,
    pub service: JobService,
}

impl Harness {
    pub fn new(lexicon: MemoryLexicon, provider: MockProvider) -> Self {
        Self::with_config(lexicon, provider, ServiceConfig::default())
    }

    pub fn with_config(lexicon: MemoryLexicon, provider: MockProvider, config: ServiceConfig) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let lexicon = Arc::new(lexicon);
        let changesets = Arc::new(MemoryChangesets::new());
        let provider = Arc::new(provider);
        let engine = Engine::new(store.clone(), lexicon.clone(), changesets.clone())
            .with_provider(provider.clone());
        let service = JobService::new(engine.clone(), config);
        Self {
            store,
            lexicon,
            changesets,
            provider,
            engine,
            service,
        }
    }

    /// Rebuild the service with a clustering backend attached.
    pub fn with_clustering(mut self, clustering: Arc<MockClusteringService>) -> Self {
        self.engine = self.engine.clone().with_clustering(clustering);
        self.service = JobService::new(self.engine.clone(), ServiceConfig::default());
        self
    }

    pub fn events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.engine.events.subscribe()
    }

    pub async fn items(&self, job_id: Uuid) -> Vec<WorkItem> {
        self.service.get(job_id, Some(500), 0).await.unwrap().items
    }

    /// Provider task id of every submitted item, keyed by target.
    pub async fn tasks(&self, job_id: Uuid) -> HashMap<TargetRef, String> {
        self.items(job_id)
            .await
            .into_iter()
            .filter_map(|i| i.provider_task_id.map(|t| (i.target, t)))
            .collect()
    }
}

/// Motion frame (10) with five verbs, ids 1 to 5.
pub fn motion_lexicon() -> MemoryLexicon {
    MemoryLexicon::new()
        .with_frame(LexFrame::new(10, "Motion").code("motion").role("Theme", true))
        .with_entry(LexEntry::new(1, "run").code("run.v.01").pos("verb").in_frame(10))
        .with_entry(LexEntry::new(2, "walk").pos("verb").in_frame(10))
        .with_entry(LexEntry::new(3, "sprint").pos("verb").in_frame(10))
        .with_entry(LexEntry::new(4, "jog").pos("verb").in_frame(10))
        .with_entry(LexEntry::new(5, "amble").pos("verb").in_frame(10))
}

pub fn flag_request(ids: &[&str]) -> CreateJobRequest {
    CreateJobRequest {
        job_type: JobType::Flag,
        scope: JobScope::ById {
            target_kind: TargetKind::Entry,
            ids: ids.iter().map(|s| s.to_string()).collect(),
        },
        config: JobConfig::new("Is '{{lemma}}' ({{pos}}) archaic?"),
        label: Some("archaic sweep".into()),
        created_by: "tester".into(),
    }
}

/// Drain every event received so far.
pub fn drain(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.payload);
    }
    events
}
