//! Structured logging field name constants for lexmill.
//!
//! All crates use these names for `tracing` fields so log aggregation can
//! query every subsystem the same way.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, item failed or fallback applied |
//! | INFO  | Lifecycle events, batch completions |
//! | DEBUG | Decision points, per-batch intermediate values |
//! | TRACE | Per-item iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "inference", "jobs"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "submitter", "poller", "applier", "renderer", "clustering"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "submit_batch", "refresh", "recompute", "cluster"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// LLM job UUID.
pub const JOB_ID: &str = "job_id";

/// Job type (flag, edit, ...).
pub const JOB_TYPE: &str = "job_type";

/// Work item id.
pub const ITEM_ID: &str = "item_id";

/// Provider task handle.
pub const TASK_ID: &str = "task_id";

/// Changeset id produced by the applier.
pub const CHANGESET_ID: &str = "changeset_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of items in a batch.
pub const BATCH_SIZE: &str = "batch_size";

/// Retry attempt number (1-based).
pub const ATTEMPT: &str = "attempt";

/// Byte length of a rendered prompt.
pub const PROMPT_LEN: &str = "prompt_len";

// ─── Inference fields ──────────────────────────────────────────────────────

/// Model name used for the job.
pub const MODEL: &str = "model";

/// Cluster count requested.
pub const CLUSTER_K: &str = "k";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
