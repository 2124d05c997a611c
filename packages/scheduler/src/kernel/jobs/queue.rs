//! PostgreSQL-backed job queue implementation.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers each get a
//! distinct row without blocking behind each other. Terminal transitions
//! publish the job id on the `job_finished` channel in the same statement.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{QueueError, QueueResult};
use super::job::{BacklogEntry, Job, JobPool, LiveJob, NewJob, ReapReport, StatusCounts};

/// Notification channel carrying ids of jobs that reached a terminal state.
pub const JOB_FINISHED_CHANNEL: &str = "job_finished";

const JOB_COLUMNS: &str = "id, team_id, pool, status, data, priority, created_at, lock_token, \
                           locked_at, stalls, finished_at, return_value, failed_reason, settled_at";

/// Reason recorded when the stall budget is exhausted.
pub const STALLED_FAILURE_REASON: &str = "job stalled more than the allowed number of times";

/// Trait for job queue operations.
///
/// One instance is constructed per process with its store injected; tests
/// run several isolated instances side by side.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a `queued` row. Fails with `DuplicateJob` if the id exists in
    /// the queue or in backlog storage.
    async fn add_job(&self, job: NewJob) -> QueueResult<Job>;

    async fn get_job(&self, id: Uuid) -> QueueResult<Option<Job>>;

    /// Claim the best-ranked queued job (priority, then age) for `lock_token`.
    async fn get_job_to_process(&self, lock_token: Uuid) -> QueueResult<Option<Job>>;

    /// Extend the lease. `false` means the lease was lost.
    async fn renew_lock(&self, id: Uuid, lock_token: Uuid) -> QueueResult<bool>;

    /// `active -> completed` if `lock_token` still holds the job.
    async fn job_finish(
        &self,
        id: Uuid,
        lock_token: Uuid,
        return_value: serde_json::Value,
    ) -> QueueResult<bool>;

    /// `active -> failed` if `lock_token` still holds the job.
    async fn job_fail(&self, id: Uuid, lock_token: Uuid, reason: &str) -> QueueResult<bool>;

    /// Stream of ids of jobs reaching a terminal state from now on.
    async fn subscribe_finished(&self) -> QueueResult<BoxStream<'static, Uuid>>;

    /// Record that the terminal hook of a finished job ran to completion.
    async fn mark_settled(&self, id: Uuid) -> QueueResult<bool>;

    /// Terminal jobs finished at least `grace` ago whose terminal hook never
    /// completed, oldest first.
    async fn unsettled_jobs(&self, grace: Duration, limit: i64) -> QueueResult<Vec<Job>>;

    async fn remove_job(&self, id: Uuid) -> QueueResult<bool>;
    async fn remove_jobs(&self, ids: &[Uuid]) -> QueueResult<u64>;

    /// Requeue active jobs whose lease is older than `lease_timeout`, or fail
    /// them once `stalls` reached `stall_budget`.
    async fn reap_stalled(&self, lease_timeout: Duration, stall_budget: i32) -> QueueResult<ReapReport>;

    /// Delete terminal rows older than their TTL. Returns rows removed.
    async fn prune_finished(&self, completed_ttl: Duration, failed_ttl: Duration) -> QueueResult<u64>;

    async fn status_counts(&self) -> QueueResult<StatusCounts>;

    // Backlog storage (jobs waiting for a team concurrency slot)

    async fn add_backlog_job(&self, job: NewJob) -> QueueResult<()>;

    /// Move a backlogged job into the queue as `queued`, keeping its
    /// `created_at`. `None` if it is no longer in backlog storage.
    async fn promote_backlog_job(&self, id: Uuid) -> QueueResult<Option<Job>>;

    /// Move a `queued` job back into backlog storage, keeping its
    /// `created_at`. `false` if it was claimed or removed meanwhile.
    async fn demote_queued_job(&self, id: Uuid) -> QueueResult<bool>;

    async fn backlog_entries(&self, team_id: &str, pool: JobPool) -> QueueResult<Vec<BacklogEntry>>;

    /// Queued or active jobs for the team and pool. Active jobs come first,
    /// then queued jobs in claim order.
    async fn live_jobs(&self, team_id: &str, pool: JobPool) -> QueueResult<Vec<LiveJob>>;

    /// Every (team, pool) with live or backlogged jobs.
    async fn tracked_teams(&self) -> QueueResult<Vec<(String, JobPool)>>;
}

/// PostgreSQL-backed job queue implementation.
#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_insert_error(id: Uuid, e: sqlx::Error) -> QueueError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => QueueError::DuplicateJob(id),
        _ => QueueError::Database(e),
    }
}

fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn add_job(&self, job: NewJob) -> QueueResult<Job> {
        let id = job.id;
        let inserted = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (id, team_id, pool, data, priority, created_at)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE NOT EXISTS (SELECT 1 FROM job_backlog WHERE id = $1)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(&job.team_id)
        .bind(job.pool)
        .bind(&job.data)
        .bind(job.priority)
        .bind(job.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_insert_error(id, e))?;

        let inserted = inserted.ok_or(QueueError::DuplicateJob(id))?;
        debug!(job_id = %id, team_id = %inserted.team_id, priority = inserted.priority, "job added");
        Ok(inserted)
    }

    async fn get_job(&self, id: Uuid) -> QueueResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn get_job_to_process(&self, lock_token: Uuid) -> QueueResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'active',
                lock_token = $1,
                locked_at = NOW()
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE status = 'queued'
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(lock_token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn renew_lock(&self, id: Uuid, lock_token: Uuid) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = NOW()
            WHERE id = $1 AND status = 'active' AND lock_token = $2
            "#,
        )
        .bind(id)
        .bind(lock_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn job_finish(
        &self,
        id: Uuid,
        lock_token: Uuid,
        return_value: serde_json::Value,
    ) -> QueueResult<bool> {
        let rows = sqlx::query(
            r#"
            WITH finished AS (
                UPDATE jobs
                SET status = 'completed',
                    lock_token = NULL,
                    locked_at = NULL,
                    finished_at = NOW(),
                    return_value = $3
                WHERE id = $1 AND status = 'active' AND lock_token = $2
                RETURNING id
            )
            SELECT pg_notify('job_finished', id::text) FROM finished
            "#,
        )
        .bind(id)
        .bind(lock_token)
        .bind(return_value)
        .fetch_all(&self.pool)
        .await?;
        Ok(!rows.is_empty())
    }

    async fn job_fail(&self, id: Uuid, lock_token: Uuid, reason: &str) -> QueueResult<bool> {
        let rows = sqlx::query(
            r#"
            WITH failed AS (
                UPDATE jobs
                SET status = 'failed',
                    lock_token = NULL,
                    locked_at = NULL,
                    finished_at = NOW(),
                    failed_reason = $3
                WHERE id = $1 AND status = 'active' AND lock_token = $2
                RETURNING id
            )
            SELECT pg_notify('job_finished', id::text) FROM failed
            "#,
        )
        .bind(id)
        .bind(lock_token)
        .bind(reason)
        .fetch_all(&self.pool)
        .await?;
        Ok(!rows.is_empty())
    }

    async fn subscribe_finished(&self) -> QueueResult<BoxStream<'static, Uuid>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(JOB_FINISHED_CHANNEL).await?;

        let stream = listener
            .into_stream()
            .filter_map(|notification| async move {
                match notification {
                    Ok(n) => Uuid::parse_str(n.payload()).ok(),
                    Err(e) => {
                        warn!(error = %e, "job_finished listener error");
                        None
                    }
                }
            })
            .boxed();
        Ok(stream)
    }

    async fn mark_settled(&self, id: Uuid) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET settled_at = NOW()
            WHERE id = $1 AND status IN ('completed', 'failed') AND settled_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn unsettled_jobs(&self, grace: Duration, limit: i64) -> QueueResult<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status IN ('completed', 'failed')
              AND settled_at IS NULL
              AND finished_at <= NOW() - ($1::bigint * INTERVAL '1 millisecond')
            ORDER BY finished_at ASC
            LIMIT $2
            "#
        ))
        .bind(millis(grace))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn remove_job(&self, id: Uuid) -> QueueResult<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_jobs(&self, ids: &[Uuid]) -> QueueResult<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn reap_stalled(&self, lease_timeout: Duration, stall_budget: i32) -> QueueResult<ReapReport> {
        let mut tx = self.pool.begin().await?;

        let requeued: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'queued',
                lock_token = NULL,
                locked_at = NULL,
                stalls = stalls + 1
            WHERE id IN (
                SELECT id
                FROM jobs
                WHERE status = 'active'
                  AND locked_at <= NOW() - ($1::bigint * INTERVAL '1 millisecond')
                  AND stalls < $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(millis(lease_timeout))
        .bind(stall_budget)
        .fetch_all(&mut *tx)
        .await?;

        let failed = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'failed',
                lock_token = NULL,
                locked_at = NULL,
                finished_at = NOW(),
                failed_reason = $3
            WHERE id IN (
                SELECT id
                FROM jobs
                WHERE status = 'active'
                  AND locked_at <= NOW() - ($1::bigint * INTERVAL '1 millisecond')
                  AND stalls >= $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(millis(lease_timeout))
        .bind(stall_budget)
        .bind(STALLED_FAILURE_REASON)
        .fetch_all(&mut *tx)
        .await?;

        if !failed.is_empty() {
            let ids: Vec<Uuid> = failed.iter().map(|j| j.id).collect();
            // Delivered on commit
            sqlx::query("SELECT pg_notify('job_finished', id::text) FROM unnest($1::uuid[]) AS id")
                .bind(&ids)
                .fetch_all(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let report = ReapReport {
            requeued,
            failed,
            ..Default::default()
        };
        if !report.is_empty() {
            info!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "reaped stalled jobs"
            );
        }
        Ok(report)
    }

    async fn prune_finished(&self, completed_ttl: Duration, failed_ttl: Duration) -> QueueResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE (status = 'completed' AND finished_at <= NOW() - ($1::bigint * INTERVAL '1 millisecond'))
               OR (status = 'failed' AND finished_at <= NOW() - ($2::bigint * INTERVAL '1 millisecond'))
            "#,
        )
        .bind(millis(completed_ttl))
        .bind(millis(failed_ttl))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn status_counts(&self) -> QueueResult<StatusCounts> {
        let (queued, active, completed, failed, backlog): (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued'),
                COUNT(*) FILTER (WHERE status = 'active'),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                (SELECT COUNT(*) FROM job_backlog)
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StatusCounts {
            queued,
            active,
            completed,
            failed,
            backlog,
        })
    }

    async fn add_backlog_job(&self, job: NewJob) -> QueueResult<()> {
        let id = job.id;
        let result = sqlx::query(
            r#"
            INSERT INTO job_backlog (id, team_id, pool, data, priority, created_at)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE NOT EXISTS (SELECT 1 FROM jobs WHERE id = $1)
            "#,
        )
        .bind(job.id)
        .bind(&job.team_id)
        .bind(job.pool)
        .bind(&job.data)
        .bind(job.priority)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(id, e))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::DuplicateJob(id));
        }
        Ok(())
    }

    async fn promote_backlog_job(&self, id: Uuid) -> QueueResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH moved AS (
                DELETE FROM job_backlog
                WHERE id = $1
                RETURNING id, team_id, pool, data, priority, created_at
            )
            INSERT INTO jobs (id, team_id, pool, data, priority, created_at)
            SELECT id, team_id, pool, data, priority, created_at FROM moved
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn demote_queued_job(&self, id: Uuid) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM jobs
                WHERE id = $1 AND status = 'queued'
                RETURNING id, team_id, pool, data, priority, created_at
            )
            INSERT INTO job_backlog (id, team_id, pool, data, priority, created_at)
            SELECT id, team_id, pool, data, priority, created_at FROM moved
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn backlog_entries(&self, team_id: &str, pool: JobPool) -> QueueResult<Vec<BacklogEntry>> {
        let entries = sqlx::query_as::<_, BacklogEntry>(
            r#"
            SELECT id, team_id, pool, priority, created_at
            FROM job_backlog
            WHERE team_id = $1 AND pool = $2
            ORDER BY priority ASC, created_at ASC
            "#,
        )
        .bind(team_id)
        .bind(pool)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn live_jobs(&self, team_id: &str, pool: JobPool) -> QueueResult<Vec<LiveJob>> {
        let jobs = sqlx::query_as::<_, LiveJob>(
            r#"
            SELECT id, status, priority, created_at
            FROM jobs
            WHERE team_id = $1 AND pool = $2 AND status IN ('queued', 'active')
            ORDER BY (status = 'active') DESC, priority ASC, created_at ASC
            "#,
        )
        .bind(team_id)
        .bind(pool)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn tracked_teams(&self) -> QueueResult<Vec<(String, JobPool)>> {
        let teams = sqlx::query_as::<_, (String, JobPool)>(
            r#"
            SELECT team_id, pool FROM jobs WHERE status IN ('queued', 'active')
            UNION
            SELECT team_id, pool FROM job_backlog
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(teams)
    }
}
