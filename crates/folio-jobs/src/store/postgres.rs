use super::QueueStore;
use crate::clock::{self, Clock};
use crate::error::{JobError, Result};
use crate::record::{
    Batch, BatchId, BatchOptions, BatchUpdate, FailedJobRecord, JobId, JobRecord, NewJob, Page,
    PageRequest, QueueSize, Settled,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Pool, Postgres, Row};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, connection, queue, job_type, payload, attempts, reserved_at, \
     available_at, created_at, max_tries, timeout_seconds, batch_id";

const FAILED_COLUMNS: &str = "id, uuid, connection, queue, job_type, payload, max_tries, \
     timeout_seconds, batch_id, exception, failed_at";

const BATCH_COLUMNS: &str = "id, name, total_jobs, pending_jobs, failed_jobs, failed_job_ids, \
     options, cancelled, cancelled_at, created_at, finished_at";

/// Postgres-backed queue store
///
/// Reservation uses `FOR UPDATE SKIP LOCKED`, so any number of worker
/// processes can poll the same table. Transitions touching more than one
/// row run in a transaction that locks the batch row first.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
    jobs_table: String,
    failed_table: String,
    batches_table: String,
    clock: Arc<dyn Clock>,
}

impl PostgresStore {
    /// Tables are named `{prefix}jobs`, `{prefix}failed_jobs` and
    /// `{prefix}job_batches`.
    pub fn new(pool: Pool<Postgres>, table_prefix: &str) -> Self {
        Self {
            pool,
            jobs_table: format!("{}jobs", table_prefix),
            failed_table: format!("{}failed_jobs", table_prefix),
            batches_table: format!("{}job_batches", table_prefix),
            clock: clock::system(),
        }
    }

    pub async fn connect(url: &str, table_prefix: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(JobError::store)?;
        Ok(Self::new(pool, table_prefix))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Initialize the database schema
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {jobs} (
                    id BIGSERIAL PRIMARY KEY,
                    connection TEXT NOT NULL,
                    queue TEXT NOT NULL,
                    job_type TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    attempts INT NOT NULL DEFAULT 0,
                    reserved_at TIMESTAMPTZ,
                    available_at TIMESTAMPTZ NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    max_tries INT,
                    timeout_seconds BIGINT,
                    batch_id UUID
                )
                "#,
                jobs = self.jobs_table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{jobs}_queue_available ON {jobs} (queue, available_at, id)",
                jobs = self.jobs_table
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {failed} (
                    id BIGSERIAL PRIMARY KEY,
                    uuid UUID NOT NULL UNIQUE,
                    connection TEXT NOT NULL,
                    queue TEXT NOT NULL,
                    job_type TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    max_tries INT,
                    timeout_seconds BIGINT,
                    batch_id UUID,
                    exception TEXT NOT NULL,
                    failed_at TIMESTAMPTZ NOT NULL
                )
                "#,
                failed = self.failed_table
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {batches} (
                    id UUID PRIMARY KEY,
                    name TEXT NOT NULL,
                    total_jobs INT NOT NULL,
                    pending_jobs INT NOT NULL,
                    failed_jobs INT NOT NULL,
                    failed_job_ids JSONB NOT NULL,
                    options JSONB NOT NULL,
                    cancelled BOOLEAN NOT NULL DEFAULT FALSE,
                    cancelled_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    finished_at TIMESTAMPTZ
                )
                "#,
                batches = self.batches_table
            ),
        ];

        for statement in statements {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(JobError::store)?;
        }

        Ok(())
    }

    async fn insert_job<'e, E>(&self, executor: E, job: &NewJob) -> Result<JobId>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let query = format!(
            r#"
            INSERT INTO {} (connection, queue, job_type, payload, attempts, available_at,
                            created_at, max_tries, timeout_seconds, batch_id)
            VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
            self.jobs_table
        );

        let row = sqlx::query(&query)
            .bind(&job.connection)
            .bind(&job.queue)
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(job.available_at.max(job.created_at))
            .bind(job.created_at)
            .bind(job.max_tries.map(|n| n as i32))
            .bind(job.timeout_seconds.map(|s| s as i64))
            .bind(job.batch_id.map(|b| b.0))
            .fetch_one(executor)
            .await
            .map_err(JobError::store)?;

        Ok(JobId(row.try_get("id").map_err(JobError::store)?))
    }

    /// Count one member of `id` as settled, inside the caller's transaction.
    /// `None` when the batch no longer exists.
    async fn settle_batch_member(
        &self,
        conn: &mut PgConnection,
        id: BatchId,
        failed: Option<JobId>,
    ) -> Result<Option<BatchUpdate>> {
        let select = format!(
            "SELECT {} FROM {} WHERE id = $1 FOR UPDATE",
            BATCH_COLUMNS, self.batches_table
        );
        let Some(row) = sqlx::query(&select)
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await
            .map_err(JobError::store)?
        else {
            return Ok(None);
        };

        let mut batch = batch_from_row(&row)?;
        let finished = batch.settle_member(failed, self.clock.now());

        let update = format!(
            r#"
            UPDATE {} SET pending_jobs = $2, failed_jobs = $3, failed_job_ids = $4,
                          cancelled = $5, cancelled_at = $6, finished_at = $7
            WHERE id = $1
            "#,
            self.batches_table
        );
        sqlx::query(&update)
            .bind(id.0)
            .bind(batch.pending_jobs as i32)
            .bind(batch.failed_jobs as i32)
            .bind(serde_json::to_value(&batch.failed_job_ids)?)
            .bind(batch.cancelled)
            .bind(batch.cancelled_at)
            .bind(batch.finished_at)
            .execute(&mut *conn)
            .await
            .map_err(JobError::store)?;

        Ok(Some(BatchUpdate { batch, finished }))
    }

    /// Delete `job` if it still carries the reservation the caller took.
    async fn delete_reserved(&self, conn: &mut PgConnection, job: &JobRecord) -> Result<bool> {
        let query = format!(
            "DELETE FROM {} WHERE id = $1 AND attempts = $2 AND reserved_at = $3",
            self.jobs_table
        );
        let result = sqlx::query(&query)
            .bind(job.id.0)
            .bind(job.attempts as i32)
            .bind(job.reserved_at)
            .execute(&mut *conn)
            .await
            .map_err(JobError::store)?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS total FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .map_err(JobError::store)?;
        let total: i64 = row.try_get("total").map_err(JobError::store)?;
        Ok(total as u64)
    }
}

fn job_from_row(row: &PgRow) -> Result<JobRecord> {
    Ok(JobRecord {
        id: JobId(row.try_get("id").map_err(JobError::store)?),
        connection: row.try_get("connection").map_err(JobError::store)?,
        queue: row.try_get("queue").map_err(JobError::store)?,
        job_type: row.try_get("job_type").map_err(JobError::store)?,
        payload: row.try_get("payload").map_err(JobError::store)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(JobError::store)? as u32,
        reserved_at: row.try_get("reserved_at").map_err(JobError::store)?,
        available_at: row.try_get("available_at").map_err(JobError::store)?,
        created_at: row.try_get("created_at").map_err(JobError::store)?,
        max_tries: row
            .try_get::<Option<i32>, _>("max_tries")
            .map_err(JobError::store)?
            .map(|n| n as u32),
        timeout_seconds: row
            .try_get::<Option<i64>, _>("timeout_seconds")
            .map_err(JobError::store)?
            .map(|s| s as u64),
        batch_id: row
            .try_get::<Option<Uuid>, _>("batch_id")
            .map_err(JobError::store)?
            .map(BatchId),
    })
}

fn failed_from_row(row: &PgRow) -> Result<FailedJobRecord> {
    Ok(FailedJobRecord {
        id: row.try_get("id").map_err(JobError::store)?,
        uuid: row.try_get("uuid").map_err(JobError::store)?,
        connection: row.try_get("connection").map_err(JobError::store)?,
        queue: row.try_get("queue").map_err(JobError::store)?,
        job_type: row.try_get("job_type").map_err(JobError::store)?,
        payload: row.try_get("payload").map_err(JobError::store)?,
        max_tries: row
            .try_get::<Option<i32>, _>("max_tries")
            .map_err(JobError::store)?
            .map(|n| n as u32),
        timeout_seconds: row
            .try_get::<Option<i64>, _>("timeout_seconds")
            .map_err(JobError::store)?
            .map(|s| s as u64),
        batch_id: row
            .try_get::<Option<Uuid>, _>("batch_id")
            .map_err(JobError::store)?
            .map(BatchId),
        exception: row.try_get("exception").map_err(JobError::store)?,
        failed_at: row.try_get("failed_at").map_err(JobError::store)?,
    })
}

fn batch_from_row(row: &PgRow) -> Result<Batch> {
    let failed_job_ids: serde_json::Value =
        row.try_get("failed_job_ids").map_err(JobError::store)?;
    let options: serde_json::Value = row.try_get("options").map_err(JobError::store)?;

    Ok(Batch {
        id: BatchId(row.try_get("id").map_err(JobError::store)?),
        name: row.try_get("name").map_err(JobError::store)?,
        total_jobs: row.try_get::<i32, _>("total_jobs").map_err(JobError::store)? as u32,
        pending_jobs: row.try_get::<i32, _>("pending_jobs").map_err(JobError::store)? as u32,
        failed_jobs: row.try_get::<i32, _>("failed_jobs").map_err(JobError::store)? as u32,
        failed_job_ids: serde_json::from_value(failed_job_ids)?,
        options: serde_json::from_value::<BatchOptions>(options)?,
        cancelled: row.try_get("cancelled").map_err(JobError::store)?,
        cancelled_at: row.try_get("cancelled_at").map_err(JobError::store)?,
        created_at: row.try_get("created_at").map_err(JobError::store)?,
        finished_at: row.try_get("finished_at").map_err(JobError::store)?,
    })
}

#[async_trait]
impl QueueStore for PostgresStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let Some(batch_id) = job.batch_id else {
            return self.insert_job(&self.pool, &job).await;
        };

        let mut tx = self.pool.begin().await.map_err(JobError::store)?;
        let select = format!(
            "SELECT finished_at FROM {} WHERE id = $1 FOR UPDATE",
            self.batches_table
        );
        let row = sqlx::query(&select)
            .bind(batch_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(JobError::store)?
            .ok_or_else(|| JobError::NotFound(format!("batch {}", batch_id)))?;
        let finished_at: Option<DateTime<Utc>> =
            row.try_get("finished_at").map_err(JobError::store)?;
        if finished_at.is_some() {
            return Err(JobError::InvalidBatch(format!(
                "batch {} has already finished",
                batch_id
            )));
        }

        let update = format!(
            "UPDATE {} SET total_jobs = total_jobs + 1, pending_jobs = pending_jobs + 1 WHERE id = $1",
            self.batches_table
        );
        sqlx::query(&update)
            .bind(batch_id.0)
            .execute(&mut *tx)
            .await
            .map_err(JobError::store)?;

        let id = self.insert_job(&mut *tx, &job).await?;
        tx.commit().await.map_err(JobError::store)?;
        Ok(id)
    }

    async fn reserve_next(
        &self,
        queue: &str,
        lock_duration: Duration,
    ) -> Result<Option<JobRecord>> {
        let now = self.clock.now();
        let query = format!(
            r#"
            UPDATE {jobs}
            SET reserved_at = $1, attempts = attempts + 1
            WHERE id = (
                SELECT id
                FROM {jobs}
                WHERE queue = $2
                  AND available_at <= $1
                  AND (reserved_at IS NULL OR reserved_at < $3)
                ORDER BY available_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {columns}
            "#,
            jobs = self.jobs_table,
            columns = JOB_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(now)
            .bind(queue)
            .bind(clock::before(now, lock_duration))
            .fetch_optional(&self.pool)
            .await
            .map_err(JobError::store)?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete(&self, job: &JobRecord) -> Result<Option<Settled<()>>> {
        let mut tx = self.pool.begin().await.map_err(JobError::store)?;
        if !self.delete_reserved(&mut tx, job).await? {
            return Ok(None);
        }

        let batch = match job.batch_id {
            Some(batch_id) => self.settle_batch_member(&mut tx, batch_id, None).await?,
            None => None,
        };
        tx.commit().await.map_err(JobError::store)?;
        Ok(Some(Settled { record: (), batch }))
    }

    async fn release(&self, job: &JobRecord, delay: Duration) -> Result<bool> {
        let query = format!(
            r#"
            UPDATE {} SET reserved_at = NULL, available_at = $4
            WHERE id = $1 AND attempts = $2 AND reserved_at = $3
            "#,
            self.jobs_table
        );
        let result = sqlx::query(&query)
            .bind(job.id.0)
            .bind(job.attempts as i32)
            .bind(job.reserved_at)
            .bind(clock::after(self.clock.now(), delay))
            .execute(&self.pool)
            .await
            .map_err(JobError::store)?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_permanently(
        &self,
        job: &JobRecord,
        error: &str,
    ) -> Result<Option<Settled<FailedJobRecord>>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(JobError::store)?;
        if !self.delete_reserved(&mut tx, job).await? {
            return Ok(None);
        }

        let insert = format!(
            r#"
            INSERT INTO {} (uuid, connection, queue, job_type, payload, max_tries,
                            timeout_seconds, batch_id, exception, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            self.failed_table, FAILED_COLUMNS
        );
        let row = sqlx::query(&insert)
            .bind(Uuid::new_v4())
            .bind(&job.connection)
            .bind(&job.queue)
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(job.max_tries.map(|n| n as i32))
            .bind(job.timeout_seconds.map(|s| s as i64))
            .bind(job.batch_id.map(|b| b.0))
            .bind(error)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(JobError::store)?;
        let failed = failed_from_row(&row)?;

        let batch = match job.batch_id {
            Some(batch_id) => {
                self.settle_batch_member(&mut tx, batch_id, Some(job.id))
                    .await?
            }
            None => None,
        };
        tx.commit().await.map_err(JobError::store)?;
        Ok(Some(Settled {
            record: failed,
            batch,
        }))
    }

    async fn create_batch(
        &self,
        mut batch: Batch,
        jobs: Vec<NewJob>,
    ) -> Result<(BatchId, Vec<JobId>)> {
        batch.total_jobs = jobs.len() as u32;
        batch.pending_jobs = jobs.len() as u32;
        if jobs.is_empty() {
            batch.finished_at = Some(self.clock.now());
        }

        let mut tx = self.pool.begin().await.map_err(JobError::store)?;
        let insert = format!(
            r#"
            INSERT INTO {} ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
            self.batches_table, BATCH_COLUMNS
        );
        sqlx::query(&insert)
            .bind(batch.id.0)
            .bind(&batch.name)
            .bind(batch.total_jobs as i32)
            .bind(batch.pending_jobs as i32)
            .bind(batch.failed_jobs as i32)
            .bind(serde_json::to_value(&batch.failed_job_ids)?)
            .bind(serde_json::to_value(&batch.options)?)
            .bind(batch.cancelled)
            .bind(batch.cancelled_at)
            .bind(batch.created_at)
            .bind(batch.finished_at)
            .execute(&mut *tx)
            .await
            .map_err(JobError::store)?;

        let mut ids = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            job.batch_id = Some(batch.id);
            ids.push(self.insert_job(&mut *tx, &job).await?);
        }

        tx.commit().await.map_err(JobError::store)?;
        Ok((batch.id, ids))
    }

    async fn find_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        let query = format!(
            "SELECT {} FROM {} WHERE id = $1",
            BATCH_COLUMNS, self.batches_table
        );
        let row = sqlx::query(&query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(JobError::store)?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn cancel_batch(&self, id: BatchId) -> Result<Batch> {
        let query = format!(
            r#"
            UPDATE {} SET cancelled = TRUE, cancelled_at = COALESCE(cancelled_at, $2)
            WHERE id = $1
            RETURNING {}
            "#,
            self.batches_table, BATCH_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id.0)
            .bind(self.clock.now())
            .fetch_optional(&self.pool)
            .await
            .map_err(JobError::store)?
            .ok_or_else(|| JobError::NotFound(format!("batch {}", id)))?;
        batch_from_row(&row)
    }

    async fn list_batches(&self, page: PageRequest) -> Result<Page<Batch>> {
        let total = self.count_rows(&self.batches_table).await?;
        let query = format!(
            "SELECT {} FROM {} ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            BATCH_COLUMNS, self.batches_table
        );
        let rows = sqlx::query(&query)
            .bind(page.per_page as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(JobError::store)?;

        Ok(Page {
            items: rows.iter().map(batch_from_row).collect::<Result<_>>()?,
            page: page.page,
            per_page: page.per_page,
            total,
        })
    }

    async fn prune_batches(&self, before: DateTime<Utc>) -> Result<u64> {
        let query = format!(
            "DELETE FROM {} WHERE finished_at IS NOT NULL AND created_at < $1",
            self.batches_table
        );
        let result = sqlx::query(&query)
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(JobError::store)?;
        Ok(result.rows_affected())
    }

    async fn list_pending(&self, queue: &str, page: PageRequest) -> Result<Page<JobRecord>> {
        let total = self.count(Some(queue)).await?;
        let query = format!(
            r#"
            SELECT {} FROM {}
            WHERE queue = $1
            ORDER BY available_at ASC, id ASC
            LIMIT $2 OFFSET $3
            "#,
            JOB_COLUMNS, self.jobs_table
        );
        let rows = sqlx::query(&query)
            .bind(queue)
            .bind(page.per_page as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(JobError::store)?;

        Ok(Page {
            items: rows.iter().map(job_from_row).collect::<Result<_>>()?,
            page: page.page,
            per_page: page.per_page,
            total,
        })
    }

    async fn count(&self, queue: Option<&str>) -> Result<u64> {
        let query = format!(
            "SELECT COUNT(*) AS total FROM {} WHERE ($1::TEXT IS NULL OR queue = $1)",
            self.jobs_table
        );
        let row = sqlx::query(&query)
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(JobError::store)?;
        let total: i64 = row.try_get("total").map_err(JobError::store)?;
        Ok(total as u64)
    }

    async fn queues(&self) -> Result<Vec<QueueSize>> {
        let query = format!(
            r#"
            SELECT queue,
                   COUNT(*) FILTER (WHERE reserved_at IS NULL) AS pending,
                   COUNT(*) FILTER (WHERE reserved_at IS NOT NULL) AS reserved
            FROM {}
            GROUP BY queue
            ORDER BY queue
            "#,
            self.jobs_table
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(JobError::store)?;

        rows.iter()
            .map(|row| {
                Ok(QueueSize {
                    queue: row.try_get("queue").map_err(JobError::store)?,
                    pending: row.try_get::<i64, _>("pending").map_err(JobError::store)? as u64,
                    reserved: row.try_get::<i64, _>("reserved").map_err(JobError::store)? as u64,
                })
            })
            .collect()
    }

    async fn delete_from_queue(&self, queue: &str) -> Result<u64> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE queue = $1", self.jobs_table))
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(JobError::store)?;
        Ok(result.rows_affected())
    }

    async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query(&format!("DELETE FROM {}", self.jobs_table))
            .execute(&self.pool)
            .await
            .map_err(JobError::store)?;
        Ok(result.rows_affected())
    }

    async fn list_failed(&self, page: PageRequest) -> Result<Page<FailedJobRecord>> {
        let total = self.count_failed().await?;
        let query = format!(
            "SELECT {} FROM {} ORDER BY id DESC LIMIT $1 OFFSET $2",
            FAILED_COLUMNS, self.failed_table
        );
        let rows = sqlx::query(&query)
            .bind(page.per_page as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(JobError::store)?;

        Ok(Page {
            items: rows.iter().map(failed_from_row).collect::<Result<_>>()?,
            page: page.page,
            per_page: page.per_page,
            total,
        })
    }

    async fn count_failed(&self) -> Result<u64> {
        self.count_rows(&self.failed_table).await
    }

    async fn find_failed(&self, id: i64) -> Result<Option<FailedJobRecord>> {
        let query = format!(
            "SELECT {} FROM {} WHERE id = $1",
            FAILED_COLUMNS, self.failed_table
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(JobError::store)?;
        row.as_ref().map(failed_from_row).transpose()
    }

    async fn delete_failed(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.failed_table))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(JobError::store)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_all_failed(&self) -> Result<u64> {
        let result = sqlx::query(&format!("DELETE FROM {}", self.failed_table))
            .execute(&self.pool)
            .await
            .map_err(JobError::store)?;
        Ok(result.rows_affected())
    }

    async fn retry_failed(&self, id: i64) -> Result<JobId> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(JobError::store)?;

        let query = format!(
            "DELETE FROM {} WHERE id = $1 RETURNING {}",
            self.failed_table, FAILED_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(JobError::store)?
            .ok_or_else(|| JobError::NotFound(format!("failed job {}", id)))?;

        let failed = failed_from_row(&row)?;
        let job_id = self.insert_job(&mut *tx, &failed.to_new_job(now)).await?;
        tx.commit().await.map_err(JobError::store)?;
        Ok(job_id)
    }
}
