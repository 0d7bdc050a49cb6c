//! PostgreSQL changeset repository.
//!
//! Changesets are owned by the review engine; this repository only inserts
//! proposals, attaches comments, and discards a job's pending proposals.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres};
use tracing::debug;
use uuid::Uuid;

use lexmill_core::{ChangesetSink, Error, ProposedCreate, ProposedUpdate, Result};

#[derive(Clone)]
pub struct PgChangesetRepository {
    pool: Pool<Postgres>,
}

impl PgChangesetRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangesetSink for PgChangesetRepository {
    async fn create_from_update(&self, update: ProposedUpdate) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO changeset
                 (entity_type, entity_id, operation, current_snapshot, proposed, submitted_by, llm_job_id)
             VALUES ($1, $2, 'update', $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(update.entity_type.as_str())
        .bind(update.entity_id)
        .bind(&update.current)
        .bind(JsonValue::Object(update.proposed))
        .bind(&update.submitted_by)
        .bind(update.job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "changesets",
            op = "create_update",
            changeset_id = id,
            job_id = %update.job_id,
            "Changeset created"
        );
        Ok(id)
    }

    async fn create_from_create(&self, create: ProposedCreate) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO changeset (entity_type, operation, proposed, submitted_by, llm_job_id)
             VALUES ($1, 'create', $2, $3, $4)
             RETURNING id",
        )
        .bind(create.entity_type.as_str())
        .bind(JsonValue::Object(create.proposed))
        .bind(&create.submitted_by)
        .bind(create.job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(id)
    }

    async fn add_comment(&self, changeset_id: i64, author: &str, text: &str) -> Result<()> {
        sqlx::query("INSERT INTO changeset_comment (changeset_id, author, body) VALUES ($1, $2, $3)")
            .bind(changeset_id)
            .bind(author)
            .bind(text)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn discard_by_job(&self, job_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE changeset SET status = 'discarded', updated_at = NOW()
             WHERE llm_job_id = $1 AND status = 'pending'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
