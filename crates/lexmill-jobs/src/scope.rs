//! Scope resolution: turn a declarative [`JobScope`] into an ordered work list.
//!
//! Counting never fetches records, so job creation can reject oversized
//! scopes before loading thousands of snapshots.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use lexmill_core::{JobScope, LexiconSource, Result, TargetKind, WorkItemSeed};

/// Snapshots fetched per lexicon round trip.
const SNAPSHOT_CHUNK: usize = 500;

/// Resolves scopes against the lexicon.
#[derive(Clone)]
pub struct ScopeResolver {
    lexicon: Arc<dyn LexiconSource>,
}

impl ScopeResolver {
    pub fn new(lexicon: Arc<dyn LexiconSource>) -> Self {
        Self { lexicon }
    }

    /// Number of work items `scope` would produce.
    pub async fn count(&self, scope: &JobScope) -> Result<i64> {
        match scope {
            JobScope::ById { target_kind, ids } => {
                Ok(self.resolve_explicit(*target_kind, ids).await?.len() as i64)
            }
            JobScope::ByGroup {
                frame_ids,
                pos,
                offset,
                limit,
            } => {
                let total = self
                    .lexicon
                    .count_frame_entries(frame_ids, pos.as_deref())
                    .await?;
                Ok(window_count(total, *offset, *limit))
            }
            JobScope::ByFilter {
                target_kind,
                filter,
                limit,
                offset,
            } => {
                let total = self.lexicon.count_filtered(*target_kind, filter).await?;
                Ok(window_count(total, *offset, *limit))
            }
        }
    }

    /// Target ids of `scope`, in work-item order.
    pub async fn resolve_ids(&self, scope: &JobScope) -> Result<Vec<i64>> {
        match scope {
            JobScope::ById { target_kind, ids } => self.resolve_explicit(*target_kind, ids).await,
            JobScope::ByGroup {
                frame_ids,
                pos,
                offset,
                limit,
            } => {
                self.lexicon
                    .frame_entry_ids(
                        frame_ids,
                        pos.as_deref(),
                        effective_limit(*limit),
                        offset.unwrap_or(0).max(0),
                    )
                    .await
            }
            JobScope::ByFilter {
                target_kind,
                filter,
                limit,
                offset,
            } => {
                self.lexicon
                    .filtered_ids(
                        *target_kind,
                        filter,
                        effective_limit(*limit),
                        offset.unwrap_or(0).max(0),
                    )
                    .await
            }
        }
    }

    /// Resolve `scope` into seeds carrying denormalized snapshots.
    ///
    /// Records deleted between id resolution and snapshotting are dropped.
    pub async fn resolve(&self, scope: &JobScope) -> Result<Vec<WorkItemSeed>> {
        let kind = scope.target_kind();
        let ids = self.resolve_ids(scope).await?;
        let mut seeds = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(SNAPSHOT_CHUNK) {
            let snapshots = self.lexicon.snapshots(kind, chunk).await?;
            seeds.extend(snapshots.into_iter().map(WorkItemSeed::from));
        }
        debug!(
            subsystem = "jobs",
            component = "scope",
            op = "resolve",
            kind = kind.as_str(),
            resolved = ids.len(),
            seeds = seeds.len(),
            "Scope resolved"
        );
        Ok(seeds)
    }

    async fn resolve_explicit(&self, kind: TargetKind, ids: &[String]) -> Result<Vec<i64>> {
        let resolved = self.lexicon.resolve_ids(kind, ids).await?;
        Ok(dedup_in_order(resolved))
    }
}

/// Drop repeats, keeping the first occurrence.
fn dedup_in_order(ids: Vec<i64>) -> Vec<i64> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// A missing or zero limit means unbounded.
fn effective_limit(limit: Option<i64>) -> Option<i64> {
    limit.filter(|l| *l > 0)
}

fn window_count(total: i64, offset: Option<i64>, limit: Option<i64>) -> i64 {
    let after_offset = (total - offset.unwrap_or(0).max(0)).max(0);
    match effective_limit(limit) {
        Some(l) => after_offset.min(l),
        None => after_offset,
    }
}
