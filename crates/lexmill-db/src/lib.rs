//! # lexmill-db
//!
//! PostgreSQL storage for lexmill LLM jobs.
//!
//! This crate provides:
//! - Connection pool management
//! - The job and work-item store with transactional aggregate recompute
//! - Lexicon reads: scope resolution, whitelisted filter translation, snapshots
//! - Changeset inserts for the review engine
//! - In-memory doubles of all three repositories for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use lexmill_db::{Database, JobStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/lexmill").await?;
//!     let active = db.jobs.active_job_ids(None, 10).await?;
//!     println!("{} active jobs", active.len());
//!     Ok(())
//! }
//! ```
pub mod changesets;
pub mod filter;
pub mod lexicon;
pub mod llm_jobs;
pub mod memory;
pub mod pool;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use lexmill_core::*;

/// Escape LIKE/ILIKE wildcard characters (`%`, `_`, `\`) in user input.
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

pub use changesets::PgChangesetRepository;
pub use filter::{FilterQueryBuilder, QueryParam};
pub use lexicon::PgLexiconRepository;
pub use llm_jobs::PgJobStore;
pub use memory::{
    LexEntry, LexFrame, MemoryChangesets, MemoryJobStore, MemoryLexicon, RecordedChangeset,
};
pub use pool::{create_pool, create_pool_with_config, PoolConfig};

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// LLM jobs and their work items.
    pub jobs: PgJobStore,
    /// Entries, frames and relations.
    pub lexicon: PgLexiconRepository,
    /// Changeset proposals.
    pub changesets: PgChangesetRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobStore::new(pool.clone()),
            lexicon: PgLexiconRepository::new(pool.clone()),
            changesets: PgChangesetRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
