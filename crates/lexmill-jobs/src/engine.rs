//! Shared collaborators of the job engine.

use std::sync::Arc;

use tracing::{info, warn};

use lexmill_core::{
    defaults, ChangesetSink, ClusteringService, Error, EventBus, JobStore, LexiconSource,
    LlmProvider, ProviderErrorKind, Result,
};
use lexmill_db::Database;
use lexmill_inference::{shared_provider, HttpClusteringService};

use crate::clustering::ClusteringAdapter;
use crate::render::PromptRenderer;
use crate::scope::ScopeResolver;

/// Everything the submitter, poller, applier and service need.
///
/// Cheap to clone; every collaborator sits behind an `Arc`.
#[derive(Clone)]
pub struct Engine {
    pub store: Arc<dyn JobStore>,
    pub lexicon: Arc<dyn LexiconSource>,
    pub changesets: Arc<dyn ChangesetSink>,
    pub provider: Option<Arc<dyn LlmProvider>>,
    pub clustering: Option<Arc<dyn ClusteringService>>,
    pub events: EventBus,
}

impl Engine {
    pub fn new(
        store: Arc<dyn JobStore>,
        lexicon: Arc<dyn LexiconSource>,
        changesets: Arc<dyn ChangesetSink>,
    ) -> Self {
        Self {
            store,
            lexicon,
            changesets,
            provider: None,
            clustering: None,
            events: EventBus::new(defaults::EVENT_BUS_CAPACITY),
        }
    }

    /// Wire PostgreSQL repositories, the shared provider and the clustering
    /// service from the environment. Missing provider or clustering settings
    /// leave those features unavailable.
    pub fn from_database(db: &Database) -> Self {
        let mut engine = Self::new(
            Arc::new(db.jobs.clone()),
            Arc::new(db.lexicon.clone()),
            Arc::new(db.changesets.clone()),
        );
        engine.provider = shared_provider();
        if engine.provider.is_none() {
            warn!(
                subsystem = "jobs",
                component = "engine",
                "LLM provider not configured, submission and polling disabled"
            );
        }
        match HttpClusteringService::from_env() {
            Ok(Some(service)) => engine.clustering = Some(Arc::new(service)),
            Ok(None) => info!(
                subsystem = "jobs",
                component = "engine",
                "Clustering service not configured"
            ),
            Err(e) => warn!(
                subsystem = "jobs",
                component = "engine",
                error = %e,
                "Clustering service unavailable"
            ),
        }
        engine
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_clustering(mut self, clustering: Arc<dyn ClusteringService>) -> Self {
        self.clustering = Some(clustering);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// The provider, or an `Unavailable` error when none is configured.
    pub fn require_provider(&self) -> Result<Arc<dyn LlmProvider>> {
        self.provider.clone().ok_or_else(|| {
            Error::provider(
                ProviderErrorKind::Unavailable,
                "LLM provider is not configured",
            )
        })
    }

    pub fn resolver(&self) -> ScopeResolver {
        ScopeResolver::new(self.lexicon.clone())
    }

    pub fn renderer(&self) -> PromptRenderer {
        PromptRenderer::new(self.clustering.clone().map(ClusteringAdapter::new))
    }
}
