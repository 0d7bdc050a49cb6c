//! PostgreSQL job store for LLM jobs and work items.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use lexmill_core::{
    new_v7, CreateJobRequest, Error, Job, JobCounters, JobListFilter, JobStatus, JobStore,
    NewWorkItem, Result, TargetRef, TokenUsage, WorkItem, WorkItemUpdate,
};

const JOB_COLUMNS: &str = "id, job_type, target_kind, label, scope, config, status, total, \
     submitted, processed, succeeded, failed, flagged, created_by, has_unseen_updates, \
     created_at, updated_at, completed_at, cancelled_at, deleted_at";

const ITEM_COLUMNS: &str = "id, job_id, entry_id, frame_id, status, provider_task_id, \
     request_payload, response_payload, last_error, poll_attempts, flagged, confidence, \
     input_tokens, output_tokens, created_at, updated_at, submitted_at, completed_at";

/// PostgreSQL implementation of [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: &PgRow) -> Result<Job> {
        Ok(Job {
            id: row.get("id"),
            job_type: row.get::<String, _>("job_type").parse()?,
            target_kind: row.get::<String, _>("target_kind").parse()?,
            label: row.get("label"),
            scope: serde_json::from_value(row.get("scope"))?,
            config: serde_json::from_value(row.get("config"))?,
            status: row.get::<String, _>("status").parse()?,
            counters: JobCounters {
                total: row.get("total"),
                submitted: row.get("submitted"),
                processed: row.get("processed"),
                succeeded: row.get("succeeded"),
                failed: row.get("failed"),
                flagged: row.get("flagged"),
            },
            created_by: row.get("created_by"),
            has_unseen_updates: row.get("has_unseen_updates"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            completed_at: row.get("completed_at"),
            cancelled_at: row.get("cancelled_at"),
            deleted_at: row.get("deleted_at"),
        })
    }

    fn parse_item_row(row: &PgRow) -> Result<WorkItem> {
        let input_tokens: Option<i64> = row.get("input_tokens");
        let output_tokens: Option<i64> = row.get("output_tokens");
        let usage = match (input_tokens, output_tokens) {
            (None, None) => None,
            (i, o) => Some(TokenUsage {
                input_tokens: i.unwrap_or(0),
                output_tokens: o.unwrap_or(0),
            }),
        };
        Ok(WorkItem {
            id: row.get("id"),
            job_id: row.get("job_id"),
            target: TargetRef::from_columns(row.get("entry_id"), row.get("frame_id"))?,
            status: row.get::<String, _>("status").parse()?,
            provider_task_id: row.get("provider_task_id"),
            request_payload: serde_json::from_value(row.get("request_payload"))?,
            response_payload: row.get("response_payload"),
            last_error: row.get("last_error"),
            poll_attempts: row.get("poll_attempts"),
            flagged: row.get("flagged"),
            confidence: row.get("confidence"),
            usage,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            submitted_at: row.get("submitted_at"),
            completed_at: row.get("completed_at"),
        })
    }

    fn parse_items(rows: Vec<PgRow>) -> Result<Vec<WorkItem>> {
        rows.iter().map(Self::parse_item_row).collect()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, req: CreateJobRequest) -> Result<Job> {
        let sql = format!(
            "INSERT INTO llm_job (id, job_type, target_kind, label, scope, config, status, created_by)
             VALUES ($1, $2, $3, $4, $5, $6, 'queued', $7)
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(new_v7())
            .bind(req.job_type.as_str())
            .bind(req.scope.target_kind().as_str())
            .bind(&req.label)
            .bind(serde_json::to_value(&req.scope)?)
            .bind(serde_json::to_value(&req.config)?)
            .bind(&req.created_by)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_job_row(&row)
    }

    async fn append_work_items(&self, job_id: Uuid, items: Vec<NewWorkItem>) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut ids = Vec::with_capacity(items.len());

        for item in &items {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO llm_job_item (job_id, entry_id, frame_id, status, request_payload)
                 VALUES ($1, $2, $3, 'queued', $4)
                 RETURNING id",
            )
            .bind(job_id)
            .bind(item.target.entry_id())
            .bind(item.target.frame_id())
            .bind(serde_json::to_value(&item.request_payload)?)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?;
            ids.push(id);
        }

        tx.commit().await.map_err(Error::Database)?;
        self.recompute_aggregates(job_id).await?;

        debug!(
            subsystem = "database",
            component = "llm_jobs",
            op = "append_items",
            job_id = %job_id,
            count = ids.len(),
            "Work items appended"
        );
        Ok(ids)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM llm_job WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
            .ok_or(Error::JobNotFound(job_id))?;
        Self::parse_job_row(&row)
    }

    async fn list_jobs(&self, filter: &JobListFilter) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM llm_job
             WHERE ($1::text IS NULL OR target_kind = $1)
               AND ($2 OR deleted_at IS NULL)
             ORDER BY created_at DESC, id DESC
             LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.target_kind.map(|k| k.as_str()))
            .bind(filter.include_deleted)
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(Self::parse_job_row).collect()
    }

    async fn list_items(&self, job_id: Uuid, limit: i64, offset: i64) -> Result<Vec<WorkItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM llm_job_item WHERE job_id = $1 ORDER BY id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(job_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_items(rows)
    }

    async fn get_item(&self, item_id: i64) -> Result<WorkItem> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM llm_job_item WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
            .ok_or(Error::WorkItemNotFound(item_id))?;
        Self::parse_item_row(&row)
    }

    async fn find_item_by_task(&self, provider_task_id: &str) -> Result<Option<WorkItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM llm_job_item WHERE provider_task_id = $1");
        let row = sqlx::query(&sql)
            .bind(provider_task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_item_row).transpose()
    }

    async fn submittable_items(&self, job_id: Uuid, limit: i64) -> Result<Vec<WorkItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM llm_job_item
             WHERE job_id = $1 AND status = 'queued' AND provider_task_id IS NULL
             ORDER BY id
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(job_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_items(rows)
    }

    async fn count_submittable(&self, job_id: Uuid) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM llm_job_item
             WHERE job_id = $1 AND status = 'queued' AND provider_task_id IS NULL",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn pollable_items(&self, job_id: Uuid, limit: i64) -> Result<Vec<WorkItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM llm_job_item
             WHERE job_id = $1 AND status IN ('queued', 'processing')
               AND provider_task_id IS NOT NULL
             ORDER BY id
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(job_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_items(rows)
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE llm_job SET status = 'running', updated_at = NOW()
             WHERE id = $1 AND status = 'queued'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_submission(&self, item_id: i64, provider_task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE llm_job_item
             SET provider_task_id = $2, status = 'processing', submitted_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND provider_task_id IS NULL AND status = 'queued'",
        )
        .bind(item_id)
        .bind(provider_task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_work_item(&self, item_id: i64, update: WorkItemUpdate) -> Result<bool> {
        let status = update.status.map(|s| s.as_str());
        let terminal = update.status.is_some_and(|s| s.is_terminal());
        let (input_tokens, output_tokens) = match update.usage {
            Some(u) => (Some(u.input_tokens), Some(u.output_tokens)),
            None => (None, None),
        };

        let result = sqlx::query(
            "UPDATE llm_job_item SET
                 status = COALESCE($2, status),
                 response_payload = COALESCE($3, response_payload),
                 last_error = COALESCE($4, last_error),
                 flagged = COALESCE($5, flagged),
                 confidence = COALESCE($6, confidence),
                 input_tokens = COALESCE($7, input_tokens),
                 output_tokens = COALESCE($8, output_tokens),
                 poll_attempts = poll_attempts + $9,
                 completed_at = CASE WHEN $10 THEN COALESCE(completed_at, NOW()) ELSE completed_at END,
                 updated_at = NOW()
             WHERE id = $1
               AND ($2::text IS NULL OR status NOT IN ('succeeded', 'failed', 'skipped'))",
        )
        .bind(item_id)
        .bind(status)
        .bind(&update.response_payload)
        .bind(&update.last_error)
        .bind(update.flagged)
        .bind(update.confidence)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(i32::from(update.increment_poll_attempts))
        .bind(terminal)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish a refused transition from a missing row.
        self.get_item(item_id).await?;
        Ok(false)
    }

    async fn recompute_aggregates(&self, job_id: Uuid) -> Result<Job> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Row lock serializes concurrent recomputes of the same job; the
        // counts below are read after the lock is held.
        let current: String = sqlx::query_scalar("SELECT status FROM llm_job WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?
            .ok_or(Error::JobNotFound(job_id))?;
        let current: JobStatus = current.parse()?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE provider_task_id IS NOT NULL) AS submitted,
                    COUNT(*) FILTER (WHERE status IN ('succeeded', 'failed', 'skipped')) AS processed,
                    COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                    COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                    COUNT(*) FILTER (WHERE flagged) AS flagged
             FROM llm_job_item WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let counters = JobCounters {
            total: row.get("total"),
            submitted: row.get("submitted"),
            processed: row.get("processed"),
            succeeded: row.get("succeeded"),
            failed: row.get("failed"),
            flagged: row.get("flagged"),
        };
        let status = counters.derive_status(current);
        let finished = matches!(status, JobStatus::Completed | JobStatus::Failed);

        let sql = format!(
            "UPDATE llm_job SET
                 total = $2, submitted = $3, processed = $4, succeeded = $5, failed = $6, flagged = $7,
                 status = $8,
                 has_unseen_updates = has_unseen_updates OR processed <> $4 OR status <> $8,
                 completed_at = CASE WHEN $9 THEN COALESCE(completed_at, NOW()) ELSE completed_at END,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(counters.total)
            .bind(counters.submitted)
            .bind(counters.processed)
            .bind(counters.succeeded)
            .bind(counters.failed)
            .bind(counters.flagged)
            .bind(status.as_str())
            .bind(finished)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Self::parse_job_row(&row)
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let updated = sqlx::query(
            "UPDATE llm_job
             SET status = 'cancelled', cancelled_at = COALESCE(cancelled_at, NOW()),
                 has_unseen_updates = TRUE, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;
        if updated.rows_affected() == 0 {
            return Err(Error::JobNotFound(job_id));
        }

        let skipped = sqlx::query(
            "UPDATE llm_job_item
             SET status = 'skipped', completed_at = NOW(), updated_at = NOW()
             WHERE job_id = $1 AND status = 'queued' AND provider_task_id IS NULL",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(skipped.rows_affected() as i64)
    }

    async fn soft_delete_job(&self, job_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE llm_job SET deleted_at = COALESCE(deleted_at, NOW()), updated_at = NOW()
             WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn mark_seen(&self, job_id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE llm_job SET has_unseen_updates = FALSE WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn active_job_ids(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            "SELECT j.id FROM llm_job j
             WHERE j.deleted_at IS NULL
               AND ($1::uuid IS NULL OR j.id > $1)
               AND (j.status IN ('queued', 'running')
                    OR (j.status = 'cancelled' AND EXISTS (
                        SELECT 1 FROM llm_job_item i
                        WHERE i.job_id = j.id
                          AND i.provider_task_id IS NOT NULL
                          AND i.status NOT IN ('succeeded', 'failed', 'skipped'))))
             ORDER BY j.id
             LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }
}
