//! SQLite-backed job store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::job::{Job, JobStatus};
use super::store::{JobPage, JobStore};
use crate::database::time::datetime_to_ms;
use crate::database::{self, DbPool, JobDbModel, WritePool};
use crate::{Error, Result};

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

/// Job store persisted in SQLite.
///
/// Reads go through `pool`; every mutation goes through the single-connection
/// `write_pool`, and those that touch both tables run in `BEGIN IMMEDIATE`.
pub struct SqliteJobStore {
    pool: DbPool,
    write_pool: WritePool,
    notify: Arc<Notify>,
    closed: AtomicBool,
}

impl SqliteJobStore {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self {
            pool,
            write_pool,
            notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Open both pools for `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pools = database::StorePools::open(database_url).await?;
        Ok(Self::new(pools.read, pools.write))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }

    async fn fetch_model(
        conn: &mut sqlx::SqliteConnection,
        id: &str,
    ) -> Result<Option<JobDbModel>> {
        Ok(
            sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, mut job: Job) -> Result<String> {
        self.ensure_open()?;
        let now = Utc::now();
        let now_ms = datetime_to_ms(now);

        let mut tx = database::begin_immediate(&self.write_pool).await?;

        let existing = if job.is_persisted() {
            Self::fetch_model(&mut tx, &job.id).await?
        } else {
            job.id = uuid::Uuid::new_v4().to_string();
            None
        };

        let priority = match existing {
            Some(model) => {
                let mut stored = model.into_job()?;
                // Queued -> Queued simply moves the job to the back.
                if stored.status != JobStatus::Queued
                    && let Err(e) = stored.mark_requeued()
                {
                    tx.rollback().await?;
                    return Err(e);
                }

                sqlx::query(
                    r#"
                    UPDATE jobs SET status = ?, progress = 0, started_at = NULL,
                        error_detail = NULL, acknowledged_at = NULL, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(JobStatus::Queued.as_str())
                .bind(now_ms)
                .bind(&stored.id)
                .execute(&mut *tx)
                .await?;

                sqlx::query("DELETE FROM pending_jobs WHERE job_id = ?")
                    .bind(&stored.id)
                    .execute(&mut *tx)
                    .await?;

                debug!(job_id = %stored.id, priority = stored.priority, "Re-admitting job");
                stored.priority
            }
            None => {
                job.status = JobStatus::Queued;
                job.progress = 0.0;
                job.error_detail = None;
                job.created_at = now;
                job.started_at = None;
                job.completed_at = None;

                let model = JobDbModel::from_job(&job, now_ms)?;
                sqlx::query(
                    r#"
                    INSERT INTO jobs (
                        id, input_locator, output_locator, requested_args, priority, status,
                        progress, error_detail, metadata, created_at, started_at, completed_at,
                        acknowledged_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&model.id)
                .bind(&model.input_locator)
                .bind(&model.output_locator)
                .bind(&model.requested_args)
                .bind(model.priority)
                .bind(&model.status)
                .bind(model.progress)
                .bind(&model.error_detail)
                .bind(&model.metadata)
                .bind(model.created_at)
                .bind(model.started_at)
                .bind(model.completed_at)
                .bind(model.acknowledged_at)
                .bind(model.updated_at)
                .execute(&mut *tx)
                .await?;

                job.priority
            }
        };

        sqlx::query("INSERT INTO pending_jobs (job_id, priority) VALUES (?, ?)")
            .bind(&job.id)
            .bind(priority)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(job_id = %job.id, priority, "Enqueued job");
        self.notify.notify_one();

        Ok(job.id)
    }

    async fn dequeue(&self) -> Result<Option<Job>> {
        self.ensure_open()?;
        let now = Utc::now();

        let mut tx = database::begin_immediate(&self.write_pool).await?;

        loop {
            let head: Option<(i64, String)> = sqlx::query_as(
                "SELECT seq, job_id FROM pending_jobs ORDER BY priority DESC, seq ASC LIMIT 1",
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some((seq, job_id)) = head else {
                tx.commit().await?;
                return Ok(None);
            };

            sqlx::query("DELETE FROM pending_jobs WHERE seq = ?")
                .bind(seq)
                .execute(&mut *tx)
                .await?;

            let Some(model) = Self::fetch_model(&mut tx, &job_id).await? else {
                continue;
            };

            let mut job = match model.into_job() {
                Ok(job) => job,
                Err(e) => {
                    // Unreadable row: fail it so it cannot block the head.
                    error!(job_id = %job_id, error = %e, "Failing unreadable job record");
                    sqlx::query(
                        "UPDATE jobs SET status = ?, error_detail = ?, completed_at = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(JobStatus::Failed.as_str())
                    .bind(format!("unreadable job record: {}", e))
                    .bind(datetime_to_ms(now))
                    .bind(datetime_to_ms(now))
                    .bind(&job_id)
                    .execute(&mut *tx)
                    .await?;
                    continue;
                }
            };
            job.mark_processing(now)?;

            sqlx::query(
                "UPDATE jobs SET status = ?, progress = 0, started_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(job.status.as_str())
            .bind(job.started_at.map(datetime_to_ms))
            .bind(datetime_to_ms(now))
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            debug!(job_id = %job.id, priority = job.priority, "Dequeued job");
            return Ok(Some(job));
        }
    }

    async fn acknowledge(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        let now_ms = datetime_to_ms(Utc::now());

        let result = sqlx::query(
            "UPDATE jobs SET acknowledged_at = COALESCE(acknowledged_at, ?) WHERE id = ?",
        )
        .bind(now_ms)
        .bind(id)
        .execute(&self.write_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", id));
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        self.ensure_open()?;
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?
            .into_job()
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        self.ensure_open()?;
        let now_ms = datetime_to_ms(Utc::now());

        let mut tx = database::begin_immediate(&self.write_pool).await?;

        let stored = Self::fetch_model(&mut tx, &job.id)
            .await?
            .ok_or_else(|| Error::not_found("Job", &job.id))?
            .into_job()?;

        let rejected = stored.status.is_terminal()
            || (stored.status != job.status
                && (job.status == JobStatus::Queued
                    || !stored.status.can_transition_to(job.status)));
        if rejected {
            tx.rollback().await?;
            return Err(Error::invalid_transition(stored.status, job.status));
        }

        let model = JobDbModel::from_job(job, now_ms)?;
        sqlx::query(
            r#"
            UPDATE jobs SET
                input_locator = ?,
                output_locator = ?,
                requested_args = ?,
                status = ?,
                progress = ?,
                error_detail = ?,
                metadata = ?,
                started_at = COALESCE(started_at, ?),
                completed_at = COALESCE(completed_at, ?),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&model.input_locator)
        .bind(&model.output_locator)
        .bind(&model.requested_args)
        .bind(&model.status)
        .bind(model.progress)
        .bind(&model.error_detail)
        .bind(&model.metadata)
        .bind(model.started_at)
        .bind(model.completed_at)
        .bind(model.updated_at)
        .bind(&model.id)
        .execute(&mut *tx)
        .await?;

        if job.status != JobStatus::Queued {
            sqlx::query("DELETE FROM pending_jobs WHERE job_id = ?")
                .bind(&job.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<JobPage> {
        self.ensure_open()?;

        let (models, total) = match status {
            Some(status) => {
                let models = sqlx::query_as::<_, JobDbModel>(
                    "SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?",
                )
                .bind(status.as_str())
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await?;
                let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = ?")
                    .bind(status.as_str())
                    .fetch_one(&self.pool)
                    .await?;
                (models, total)
            }
            None => {
                let models = sqlx::query_as::<_, JobDbModel>(
                    "SELECT * FROM jobs ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?",
                )
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await?;
                let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
                    .fetch_one(&self.pool)
                    .await?;
                (models, total)
            }
        };

        let jobs = models
            .into_iter()
            .map(JobDbModel::into_job)
            .collect::<Result<Vec<_>>>()?;

        Ok(JobPage {
            jobs,
            total: total.max(0) as u64,
        })
    }

    async fn cancel_job(&self, id: &str) -> Result<Job> {
        self.ensure_open()?;
        let now = Utc::now();
        let now_ms = datetime_to_ms(now);

        let mut tx = database::begin_immediate(&self.write_pool).await?;

        let mut job = Self::fetch_model(&mut tx, id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?
            .into_job()?;

        if job.status.is_terminal() {
            tx.rollback().await?;
            debug!(job_id = %id, status = %job.status, "Cancel on terminal job is a no-op");
            return Ok(job);
        }

        let was_queued = job.status == JobStatus::Queued;
        job.mark_cancelled(now)?;

        // A job cancelled while queued never reaches a worker, so nothing
        // else will acknowledge it.
        sqlx::query(
            r#"
            UPDATE jobs SET status = ?, completed_at = ?, updated_at = ?,
                acknowledged_at = CASE WHEN ? THEN COALESCE(acknowledged_at, ?) ELSE acknowledged_at END
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.completed_at.map(datetime_to_ms))
        .bind(now_ms)
        .bind(was_queued)
        .bind(now_ms)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM pending_jobs WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(job_id = %id, was_queued, "Cancelled job");
        Ok(job)
    }

    async fn queue_depth(&self) -> Result<u64> {
        self.ensure_open()?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn evict_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.ensure_open()?;
        let result = sqlx::query(&format!(
            "DELETE FROM jobs WHERE status IN {} AND acknowledged_at IS NOT NULL AND completed_at < ?",
            TERMINAL_STATUSES
        ))
        .bind(datetime_to_ms(cutoff))
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.write_pool.close().await;
        self.pool.close().await;
        info!("Job store closed");
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
