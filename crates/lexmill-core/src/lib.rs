//! # lexmill-core
//!
//! Core types, traits, and abstractions for lexmill LLM jobs.
//!
//! This crate provides the data model shared by the storage, inference and
//! job crates, plus the collaborator traits the job engine is written against.

pub mod defaults;
pub mod error;
pub mod events;
pub mod filter;
pub mod logging;
pub mod models;
pub mod results;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, ProviderErrorKind, Result};
pub use events::{EventBus, EventEnvelope, JobEvent};
pub use filter::{FilterExpr, FilterOp};
pub use models::*;
pub use results::*;
pub use traits::*;
pub use uuid_utils::new_v7;
