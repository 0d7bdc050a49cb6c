//! Centralized default constants for the lexmill job engine.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers; env-driven configs fall back to them.

// =============================================================================
// SCOPE
// =============================================================================

/// Maximum number of work items a single job may resolve to.
pub const MAX_JOB_ITEMS: i64 = 5000;

/// Deepest filter expression accepted in a filter scope.
pub const MAX_FILTER_DEPTH: usize = 16;

/// Number of prompts rendered by a job preview.
pub const PREVIEW_SAMPLE_SIZE: usize = 5;

/// Maximum sibling entries denormalized into a snapshot.
pub const SNAPSHOT_SIBLING_LIMIT: i64 = 50;

/// Maximum related entries denormalized into a snapshot.
pub const SNAPSHOT_RELATED_LIMIT: i64 = 25;

/// Maximum member entries captured in a frame snapshot.
pub const SNAPSHOT_MEMBER_LIMIT: i64 = 500;

// =============================================================================
// SUBMISSION
// =============================================================================

/// Default number of items pulled per `submit_batch` call.
pub const SUBMIT_BATCH_SIZE: usize = 25;

/// Upper bound on batch size (and therefore on submission parallelism).
pub const SUBMIT_BATCH_MAX: usize = 100;

/// Attempts per item before a retryable failure becomes terminal.
pub const SUBMIT_MAX_ATTEMPTS: u32 = 4;

/// First backoff delay; doubles on every retry (1s, 2s, 4s, ...).
pub const SUBMIT_BACKOFF_BASE_MS: u64 = 1000;

/// Wall-clock budget for one `submit_batch` call.
pub const SUBMIT_BUDGET_SECS: u64 = 290;

// =============================================================================
// POLLING
// =============================================================================

/// Default number of non-terminal items examined per refresh.
pub const POLL_LIMIT: usize = 200;

/// Items retrieved concurrently within one refresh.
pub const POLL_SUB_BATCH: usize = 20;

/// Polls of a completed-but-empty task before the item is failed.
pub const MAX_POLL_ATTEMPTS: i32 = 30;

/// Characters of raw provider output quoted in parse-failure messages.
pub const RAW_SNIPPET_CHARS: usize = 200;

// =============================================================================
// CLUSTERING
// =============================================================================

/// Smallest useful cluster count.
pub const CLUSTER_K_MIN: usize = 2;

/// Largest cluster count picked by the sqrt heuristic.
pub const CLUSTER_K_MAX: usize = 12;

/// Deterministic seed sent to the clustering service.
pub const CLUSTER_SEED: u64 = 42;

/// k-means iteration cap sent to the clustering service.
pub const CLUSTER_MAX_ITERS: u32 = 100;

/// Clustering request timeout.
pub const CLUSTER_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// PROVIDER
// =============================================================================

/// Default model for LLM jobs.
pub const LLM_JOB_MODEL: &str = "gpt-4.1-mini";

/// Provider HTTP request timeout.
pub const PROVIDER_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// DRIVER
// =============================================================================

/// Interval between driver ticks.
pub const DRIVER_TICK_MS: u64 = 15_000;

/// Jobs advanced concurrently per driver tick.
pub const DRIVER_MAX_CONCURRENT_JOBS: usize = 4;

/// Capacity of the driver event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for job listings.
pub const PAGE_LIMIT: i64 = 50;

/// Default page size for work-item listings on job detail.
pub const ITEM_PAGE_LIMIT: i64 = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_bounds() {
        assert!(SUBMIT_BATCH_SIZE <= SUBMIT_BATCH_MAX);
        assert_eq!(SUBMIT_BATCH_MAX, 100);
    }

    #[test]
    fn test_cluster_bounds() {
        assert!(CLUSTER_K_MIN < CLUSTER_K_MAX);
    }

    #[test]
    fn test_submit_budget_below_five_minutes() {
        assert!(SUBMIT_BUDGET_SECS < 300);
    }
}
