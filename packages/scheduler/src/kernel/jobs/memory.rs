//! In-memory job queue.
//!
//! Same contract as [`PostgresJobQueue`](super::PostgresJobQueue) with a
//! single lock standing in for row locks. Used by tests and local runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::RwLock;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::error::{QueueError, QueueResult};
use super::job::{BacklogEntry, Job, JobPool, JobStatus, LiveJob, NewJob, ReapReport, StatusCounts};
use super::queue::{JobQueue, JOB_FINISHED_CHANNEL, STALLED_FAILURE_REASON};
use crate::kernel::NotificationHub;

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    backlog: HashMap<Uuid, NewJob>,
}

/// In-memory job queue.
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    tables: Arc<RwLock<Tables>>,
    hub: NotificationHub,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewind a job's lease so the next reaper pass sees it as stalled.
    pub async fn expire_lease(&self, id: Uuid, by: Duration) {
        let mut tables = self.tables.write().await;
        if let Some(job) = tables.jobs.get_mut(&id) {
            if let Some(locked_at) = job.locked_at {
                job.locked_at = Some(rewind(locked_at, by));
            }
        }
    }

    async fn notify_finished(&self, ids: &[Uuid]) {
        for id in ids {
            self.hub.publish(JOB_FINISHED_CHANNEL, *id).await;
        }
    }

    async fn finish(&self, id: Uuid, lock_token: Uuid, apply: impl FnOnce(&mut Job)) -> bool {
        let mut tables = self.tables.write().await;
        match tables.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Active && job.lock_token == Some(lock_token) => {
                job.lock_token = None;
                job.locked_at = None;
                job.finished_at = Some(Utc::now());
                apply(job);
                true
            }
            _ => false,
        }
    }
}

fn rewind(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn older_than(ttl: Duration) -> DateTime<Utc> {
    rewind(Utc::now(), ttl)
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn add_job(&self, job: NewJob) -> QueueResult<Job> {
        let mut tables = self.tables.write().await;
        if tables.jobs.contains_key(&job.id) || tables.backlog.contains_key(&job.id) {
            return Err(QueueError::DuplicateJob(job.id));
        }
        let row = job.into_queued();
        tables.jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_job(&self, id: Uuid) -> QueueResult<Option<Job>> {
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn get_job_to_process(&self, lock_token: Uuid) -> QueueResult<Option<Job>> {
        let mut tables = self.tables.write().await;
        let next = tables
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by_key(|j| (j.priority, j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = tables.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Active;
        job.lock_token = Some(lock_token);
        job.locked_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    async fn renew_lock(&self, id: Uuid, lock_token: Uuid) -> QueueResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Active && job.lock_token == Some(lock_token) => {
                job.locked_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn job_finish(
        &self,
        id: Uuid,
        lock_token: Uuid,
        return_value: serde_json::Value,
    ) -> QueueResult<bool> {
        let finished = self.finish(id, lock_token, |job| {
            job.status = JobStatus::Completed;
            job.return_value = Some(return_value);
        })
        .await;
        if finished {
            self.notify_finished(&[id]).await;
        }
        Ok(finished)
    }

    async fn job_fail(&self, id: Uuid, lock_token: Uuid, reason: &str) -> QueueResult<bool> {
        let failed = self.finish(id, lock_token, |job| {
            job.status = JobStatus::Failed;
            job.failed_reason = Some(reason.to_string());
        })
        .await;
        if failed {
            self.notify_finished(&[id]).await;
        }
        Ok(failed)
    }

    async fn subscribe_finished(&self) -> QueueResult<BoxStream<'static, Uuid>> {
        let rx = self.hub.subscribe(JOB_FINISHED_CHANNEL).await;
        // Lagged receivers skip ahead; waiters re-check by polling
        let stream = BroadcastStream::new(rx)
            .filter_map(|item| async move { item.ok() })
            .boxed();
        Ok(stream)
    }

    async fn mark_settled(&self, id: Uuid) -> QueueResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.jobs.get_mut(&id) {
            Some(job) if job.status.is_terminal() && job.settled_at.is_none() => {
                job.settled_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unsettled_jobs(&self, grace: Duration, limit: i64) -> QueueResult<Vec<Job>> {
        let cutoff = older_than(grace);
        let tables = self.tables.read().await;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.settled_at.is_none())
            .filter(|j| j.finished_at.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.finished_at, j.id));
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }

    async fn remove_job(&self, id: Uuid) -> QueueResult<bool> {
        Ok(self.tables.write().await.jobs.remove(&id).is_some())
    }

    async fn remove_jobs(&self, ids: &[Uuid]) -> QueueResult<u64> {
        let mut tables = self.tables.write().await;
        Ok(ids.iter().filter(|id| tables.jobs.remove(*id).is_some()).count() as u64)
    }

    async fn reap_stalled(&self, lease_timeout: Duration, stall_budget: i32) -> QueueResult<ReapReport> {
        let cutoff = older_than(lease_timeout);
        let mut report = ReapReport::default();
        {
            let mut tables = self.tables.write().await;
            for job in tables.jobs.values_mut() {
                let stale = job.status == JobStatus::Active
                    && job.locked_at.is_some_and(|at| at <= cutoff);
                if !stale {
                    continue;
                }
                job.lock_token = None;
                job.locked_at = None;
                if job.stalls < stall_budget {
                    job.status = JobStatus::Queued;
                    job.stalls += 1;
                    report.requeued.push(job.id);
                } else {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(Utc::now());
                    job.failed_reason = Some(STALLED_FAILURE_REASON.to_string());
                    report.failed.push(job.clone());
                }
            }
        }

        let failed_ids: Vec<Uuid> = report.failed.iter().map(|j| j.id).collect();
        self.notify_finished(&failed_ids).await;
        Ok(report)
    }

    async fn prune_finished(&self, completed_ttl: Duration, failed_ttl: Duration) -> QueueResult<u64> {
        let completed_cutoff = older_than(completed_ttl);
        let failed_cutoff = older_than(failed_ttl);
        let mut tables = self.tables.write().await;
        let before = tables.jobs.len();
        tables.jobs.retain(|_, job| {
            let cutoff = match job.status {
                JobStatus::Completed => completed_cutoff,
                JobStatus::Failed => failed_cutoff,
                _ => return true,
            };
            !job.finished_at.is_some_and(|at| at <= cutoff)
        });
        Ok((before - tables.jobs.len()) as u64)
    }

    async fn status_counts(&self) -> QueueResult<StatusCounts> {
        let tables = self.tables.read().await;
        let mut counts = StatusCounts {
            backlog: tables.backlog.len() as i64,
            ..Default::default()
        };
        for job in tables.jobs.values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn add_backlog_job(&self, job: NewJob) -> QueueResult<()> {
        let mut tables = self.tables.write().await;
        if tables.jobs.contains_key(&job.id) || tables.backlog.contains_key(&job.id) {
            return Err(QueueError::DuplicateJob(job.id));
        }
        tables.backlog.insert(job.id, job);
        Ok(())
    }

    async fn promote_backlog_job(&self, id: Uuid) -> QueueResult<Option<Job>> {
        let mut tables = self.tables.write().await;
        let Some(entry) = tables.backlog.remove(&id) else {
            return Ok(None);
        };
        let row = entry.into_queued();
        tables.jobs.insert(row.id, row.clone());
        Ok(Some(row))
    }

    async fn demote_queued_job(&self, id: Uuid) -> QueueResult<bool> {
        let mut tables = self.tables.write().await;
        if !tables.jobs.get(&id).is_some_and(|j| j.status == JobStatus::Queued) {
            return Ok(false);
        }
        let Some(job) = tables.jobs.remove(&id) else {
            return Ok(false);
        };
        tables.backlog.insert(
            id,
            NewJob {
                id,
                team_id: job.team_id,
                pool: job.pool,
                data: job.data,
                priority: job.priority,
                created_at: job.created_at,
            },
        );
        Ok(true)
    }

    async fn backlog_entries(&self, team_id: &str, pool: JobPool) -> QueueResult<Vec<BacklogEntry>> {
        let tables = self.tables.read().await;
        let mut entries: Vec<BacklogEntry> = tables
            .backlog
            .values()
            .filter(|j| j.team_id == team_id && j.pool == pool)
            .map(|j| BacklogEntry {
                id: j.id,
                team_id: j.team_id.clone(),
                pool: j.pool,
                priority: j.priority,
                created_at: j.created_at,
            })
            .collect();
        entries.sort_by_key(|e| (e.priority, e.created_at, e.id));
        Ok(entries)
    }

    async fn live_jobs(&self, team_id: &str, pool: JobPool) -> QueueResult<Vec<LiveJob>> {
        let tables = self.tables.read().await;
        let mut live: Vec<LiveJob> = tables
            .jobs
            .values()
            .filter(|j| j.team_id == team_id && j.pool == pool && !j.status.is_terminal())
            .map(|j| LiveJob {
                id: j.id,
                status: j.status,
                priority: j.priority,
                created_at: j.created_at,
            })
            .collect();
        live.sort_by_key(|j| (j.status != JobStatus::Active, j.priority, j.created_at, j.id));
        Ok(live)
    }

    async fn tracked_teams(&self) -> QueueResult<Vec<(String, JobPool)>> {
        let tables = self.tables.read().await;
        let teams: BTreeSet<(String, JobPool)> = tables
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .map(|j| (j.team_id.clone(), j.pool))
            .chain(tables.backlog.values().map(|j| (j.team_id.clone(), j.pool)))
            .collect();
        Ok(teams.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(team: &str, priority: i32) -> NewJob {
        NewJob::builder().team_id(team).priority(priority).build()
    }

    #[tokio::test]
    async fn test_lost_lock_cannot_finish() {
        let queue = MemoryJobQueue::new();
        let added = queue.add_job(job("t", 1)).await.unwrap();
        let token = Uuid::new_v4();
        queue.get_job_to_process(token).await.unwrap().unwrap();

        assert!(!queue
            .job_finish(added.id, Uuid::new_v4(), serde_json::json!(null))
            .await
            .unwrap());
        assert!(queue
            .job_finish(added.id, token, serde_json::json!({"ok": true}))
            .await
            .unwrap());

        let row = queue.get_job(added.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert!(row.lock_token.is_none());
        assert!(!queue.renew_lock(added.id, token).await.unwrap());
    }

    #[tokio::test]
    async fn test_backlog_and_queue_ids_are_disjoint() {
        let queue = MemoryJobQueue::new();
        let new_job = job("t", 1);
        queue.add_backlog_job(new_job.clone()).await.unwrap();

        assert!(matches!(
            queue.add_job(new_job.clone()).await,
            Err(QueueError::DuplicateJob(_))
        ));

        let promoted = queue.promote_backlog_job(new_job.id).await.unwrap().unwrap();
        assert_eq!(promoted.created_at, new_job.created_at);
        assert!(queue.promote_backlog_job(new_job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_respects_ttl_per_status() {
        let queue = MemoryJobQueue::new();
        let a = queue.add_job(job("t", 1)).await.unwrap();
        let token = Uuid::new_v4();
        queue.get_job_to_process(token).await.unwrap();
        queue.job_fail(a.id, token, "boom").await.unwrap();

        assert_eq!(
            queue
                .prune_finished(Duration::ZERO, Duration::from_secs(3600))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            queue
                .prune_finished(Duration::from_secs(3600), Duration::ZERO)
                .await
                .unwrap(),
            1
        );
    }
}
