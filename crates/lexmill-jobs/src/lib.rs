//! # lexmill-jobs
//!
//! LLM job orchestration for lexmill.
//!
//! This crate provides:
//! - Scope resolution and prompt rendering, with optional semantic clustering
//! - Job creation, preview, cancellation and listing
//! - Resumable batch submission with bounded concurrency and retry
//! - Result polling, webhook handling and aggregate tracking
//! - Application of parsed results as changesets for human review
//! - A periodic driver that advances every active job
//!
//! ## Example
//!
//! ```ignore
//! use lexmill_db::Database;
//! use lexmill_jobs::{DriverConfig, Engine, JobDriver, JobService, ServiceConfig};
//!
//! let db = Database::connect("postgres://...").await?;
//! let engine = Engine::from_database(&db);
//!
//! let service = JobService::new(engine.clone(), ServiceConfig::from_env());
//! let job = service.create(request).await?;
//!
//! // Advance jobs in the background
//! let handle = JobDriver::new(engine, DriverConfig::from_env()).start();
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! handle.shutdown().await?;
//! ```

pub mod applier;
pub mod clustering;
pub mod driver;
pub mod engine;
pub mod poller;
pub mod render;
pub mod scope;
pub mod service;
pub mod submitter;
pub mod template;

// Re-export core types
pub use lexmill_core::*;

pub use applier::{ApplyOutcome, ResultApplier};
pub use clustering::{ClusterOutcome, ClusterSlot, ClusteringAdapter};
pub use driver::{DriverConfig, DriverEvent, DriverHandle, JobDriver};
pub use engine::Engine;
pub use poller::{PollConfig, PollOutcome, ResultPoller};
pub use render::{PromptRenderer, RenderOptions, RenderedPrompt};
pub use scope::ScopeResolver;
pub use service::{JobDetail, JobPreview, JobService, PreviewSample, ServiceConfig};
pub use submitter::{BatchSubmitter, SubmitBatchOutcome, SubmitConfig};
pub use template::Template;
