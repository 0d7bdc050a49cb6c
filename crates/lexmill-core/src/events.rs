//! Job lifecycle events and the broadcast bus that carries them.
//!
//! The submitter, poller and driver emit [`JobEvent`]s as work progresses.
//! Consumers (UI notifiers, tests) subscribe independently; a slow receiver
//! gets `Lagged` and skips ahead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{JobCounters, JobStatus, JobType};

/// Domain event emitted while a job moves through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// A job and its work items were persisted.
    JobCreated {
        job_id: Uuid,
        job_type: JobType,
        total: i64,
    },
    /// A submission pass finished.
    BatchSubmitted {
        job_id: Uuid,
        submitted: usize,
        failed: usize,
        remaining: i64,
    },
    /// A polling pass finished and aggregates were recomputed.
    JobProgress {
        job_id: Uuid,
        status: JobStatus,
        counters: JobCounters,
    },
    /// Job reached a terminal status through processing.
    JobFinished { job_id: Uuid, status: JobStatus },
    /// Job was cancelled by a user.
    JobCancelled { job_id: Uuid },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::JobCreated { job_id, .. }
            | JobEvent::BatchSubmitted { job_id, .. }
            | JobEvent::JobProgress { job_id, .. }
            | JobEvent::JobFinished { job_id, .. }
            | JobEvent::JobCancelled { job_id } => *job_id,
        }
    }

    /// Namespaced event type, e.g. `"job.created"`.
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::JobCreated { .. } => "job.created",
            JobEvent::BatchSubmitted { .. } => "job.batch_submitted",
            JobEvent::JobProgress { .. } => "job.progress",
            JobEvent::JobFinished { .. } => "job.finished",
            JobEvent::JobCancelled { .. } => "job.cancelled",
        }
    }
}

/// An event plus delivery metadata.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// UUIDv7, so envelopes sort by emission time.
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: JobEvent,
}

impl EventEnvelope {
    pub fn new(event: JobEvent) -> Self {
        Self {
            event_id: crate::uuid_utils::new_v7(),
            event_type: event.event_type().to_string(),
            occurred_at: Utc::now(),
            payload: event,
        }
    }
}

/// Broadcast bus for [`JobEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit to all subscribers. Dropped silently when nobody listens.
    pub fn emit(&self, event: JobEvent) {
        let envelope = EventEnvelope::new(event);
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}
