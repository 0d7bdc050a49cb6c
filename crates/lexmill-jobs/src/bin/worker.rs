//! Standalone job driver process.
//!
//! Environment variables:
//!   DATABASE_URL          - PostgreSQL connection string (required)
//!   LOG_FORMAT            - "json" or "text" (default: "text")
//!   LOG_ANSI              - "true"/"false" override ANSI colors
//!   RUST_LOG              - standard env filter (default: "lexmill_jobs=info,lexmill_db=info")
//!   LLM_JOB_RUN_MIGRATIONS - apply pending migrations on startup (default: false)
//!
//! Driver, submission and polling settings are read by the config types'
//! `from_env` constructors.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lexmill_db::{Database, PoolConfig};
use lexmill_jobs::{DriverConfig, Engine, JobDriver};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "lexmill_jobs=info,lexmill_db=info,lexmill_inference=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        let mut layer = tracing_subscriber::fmt::layer();
        if let Some(ansi) = log_ansi {
            layer = layer.with_ansi(ansi);
        }
        registry.with(layer).init();
    }

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = Database::connect_with_config(&database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to database")?;

    let run_migrations = std::env::var("LLM_JOB_RUN_MIGRATIONS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if run_migrations {
        db.migrate().await.context("failed to run migrations")?;
        info!("Migrations applied");
    }

    let engine = Engine::from_database(&db);
    let config = DriverConfig::from_env();
    info!(
        tick_ms = config.tick_ms,
        max_concurrent = config.max_concurrent_jobs,
        batch_size = config.submit.batch_size,
        "Starting lexmill job driver"
    );
    let handle = JobDriver::new(engine, config).start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    handle.shutdown().await?;
    Ok(())
}
