//! # lexmill-inference
//!
//! Network clients used by lexmill jobs.
//!
//! This crate provides:
//! - [`OpenAIProvider`]: background-mode Responses API client implementing
//!   [`LlmProvider`]
//! - HTTP error classification into retryable and terminal kinds
//! - Strict structured-output schemas per job type
//! - [`HttpClusteringService`]: similarity-clustering client
//! - A lazily initialized process-wide provider ([`shared_provider`])
//!
//! # Feature Flags
//!
//! - `mock`: Enable [`mock::MockProvider`] and [`mock::MockClusteringService`]
//!
//! # Example
//!
//! ```rust,no_run
//! use lexmill_inference::{shared_provider, schemas};
//! use lexmill_core::JobType;
//!
//! match shared_provider() {
//!     Some(provider) => println!("using {}", provider.name()),
//!     None => println!("LLM jobs disabled: no API key"),
//! }
//! let schema = schemas::schema_for(JobType::Flag);
//! assert_eq!(schema["type"], "object");
//! ```

pub mod clustering;
pub mod config;
pub mod error;
pub mod provider;
pub mod schemas;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export core types
pub use lexmill_core::*;

pub use clustering::HttpClusteringService;
pub use config::{ClusteringConfig, ProviderConfig, DEFAULT_OPENAI_URL};
pub use provider::{shared_provider, OpenAIProvider};
