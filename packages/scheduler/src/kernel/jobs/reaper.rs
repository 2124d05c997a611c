//! Stall reaper and retention cleanup.
//!
//! Active jobs whose lease was not renewed within `lease_timeout` go back to
//! `queued` with `stalls += 1`. Once `stalls` reaches the budget the job fails
//! terminally and waiters are notified. Terminal jobs whose terminal hook
//! never completed (the finisher crashed, or the hook failed) get the hook
//! replayed once they are `settle_grace` old. Terminal rows are pruned after
//! their TTL.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::job::{Job, JobStatus, ReapReport};
use super::queue::JobQueue;
use super::worker::{JobLifecycle, JobOutcome};
use crate::kernel::service_host::Service;

/// Lease and retention settings for the queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Stall threshold on `locked_at`
    pub lease_timeout: Duration,
    /// Requeues before terminal failure
    pub stall_budget: i32,
    pub completed_ttl: Duration,
    pub failed_ttl: Duration,
    pub reaper_interval: Duration,
    /// Age after which an unsettled terminal job is replayed
    pub settle_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(60),
            stall_budget: 9,
            completed_ttl: Duration::from_secs(60 * 60),
            failed_ttl: Duration::from_secs(6 * 60 * 60),
            reaper_interval: Duration::from_secs(15),
            settle_grace: Duration::from_secs(60),
        }
    }
}

/// Unsettled jobs replayed per pass.
const SETTLE_BATCH: i64 = 100;

pub struct StallReaper {
    queue: Arc<dyn JobQueue>,
    lifecycle: Arc<dyn JobLifecycle>,
    config: QueueConfig,
}

impl StallReaper {
    pub fn new(queue: Arc<dyn JobQueue>, lifecycle: Arc<dyn JobLifecycle>, config: QueueConfig) -> Self {
        Self {
            queue,
            lifecycle,
            config,
        }
    }

    /// One reap, replay and prune pass.
    pub async fn run_once(&self) -> Result<ReapReport> {
        let mut report = self
            .queue
            .reap_stalled(self.config.lease_timeout, self.config.stall_budget)
            .await?;

        for job in &report.failed {
            warn!(job_id = %job.id, stalls = job.stalls, "job exceeded stall budget");
            self.settle(job).await;
        }

        let unsettled = self
            .queue
            .unsettled_jobs(self.config.settle_grace, SETTLE_BATCH)
            .await?;
        for job in &unsettled {
            if self.settle(job).await {
                report.settled.push(job.id);
            }
        }
        if !report.settled.is_empty() {
            info!(settled = report.settled.len(), "replayed terminal hooks");
        }

        let pruned = self
            .queue
            .prune_finished(self.config.completed_ttl, self.config.failed_ttl)
            .await?;
        if pruned > 0 {
            info!(pruned, "pruned finished jobs");
        }

        Ok(report)
    }

    /// Run the terminal hook for a finished row and record it as settled.
    async fn settle(&self, job: &Job) -> bool {
        let null = serde_json::Value::Null;
        let outcome = match job.status {
            JobStatus::Completed => JobOutcome::Completed(job.return_value.as_ref().unwrap_or(&null)),
            _ => JobOutcome::Failed(job.failed_reason.as_deref().unwrap_or_default()),
        };
        if let Err(e) = self.lifecycle.on_terminal(job, outcome).await {
            error!(job_id = %job.id, error = %e, "job terminal hook failed");
            return false;
        }
        match self.queue.mark_settled(job.id).await {
            Ok(settled) => settled,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to mark job as settled");
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for StallReaper {
    fn name(&self) -> &'static str {
        "stall-reaper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.reaper_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "stall reaper pass failed");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::{JobStatus, MemoryJobQueue, NewJob, NoopLifecycle};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_unrenewed_lease_is_requeued() {
        let queue = Arc::new(MemoryJobQueue::new());
        let job = queue
            .add_job(NewJob::builder().team_id("t").build())
            .await
            .unwrap();
        queue.get_job_to_process(Uuid::new_v4()).await.unwrap();
        queue.expire_lease(job.id, Duration::from_secs(120)).await;

        let reaper = StallReaper::new(queue.clone(), Arc::new(NoopLifecycle), QueueConfig::default());
        let report = reaper.run_once().await.unwrap();
        assert_eq!(report.requeued, vec![job.id]);

        let row = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.stalls, 1);
        assert!(row.lock_token.is_none());
    }

    #[tokio::test]
    async fn test_fresh_lease_is_left_alone() {
        let queue = Arc::new(MemoryJobQueue::new());
        queue
            .add_job(NewJob::builder().team_id("t").build())
            .await
            .unwrap();
        queue.get_job_to_process(Uuid::new_v4()).await.unwrap();

        let reaper = StallReaper::new(queue.clone(), Arc::new(NoopLifecycle), QueueConfig::default());
        assert!(reaper.run_once().await.unwrap().is_empty());
    }
}
