//! Job worker service.
//!
//! The `JobWorker` is a long-running service that:
//! - Claims one job at a time with a fresh lock token
//! - Runs it through a [`JobHandler`]
//! - Renews the lease while the handler runs
//! - Marks the job completed or failed, guarded by the lock token
//! - Records the job as settled once its terminal hook succeeded
//!
//! Shutdown stops claiming; a job already claimed runs to completion.
//!
//! # Architecture
//!
//! ```text
//! JobWorker
//!     │
//!     ├─► get_job_to_process(token)
//!     ├─► JobHandler.handle(job, cancel)
//!     │       └─► heartbeat: renew_lock + JobLifecycle.on_heartbeat
//!     ├─► job_finish / job_fail (token must still match)
//!     └─► JobLifecycle.on_terminal ─► mark_settled
//! ```
//!
//! # Example
//!
//! ```ignore
//! let worker = JobWorker::new(queue.clone(), handler, lifecycle);
//!
//! ServiceHost::new()
//!     .with_service(worker)
//!     .run_until_shutdown()
//!     .await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::Job;
use super::queue::JobQueue;
use crate::kernel::service_host::Service;

/// Reason recorded on jobs that fail with an unexpected error. The detail
/// goes to the logs, keyed by the error id.
pub const GENERIC_FAILURE_REASON: &str = "An unexpected error occurred";

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// How often to renew the lease of the running job
    pub lock_renew_interval: Duration,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            lock_renew_interval: Duration::from_secs(15),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl JobWorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Executes a claimed job.
///
/// `cancel` fires when the lease is lost and another worker may own the job.
/// Handlers should stop at the next safe point.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<serde_json::Value>;
}

/// How a job ended, as seen by [`JobLifecycle::on_terminal`].
#[derive(Debug, Clone, Copy)]
pub enum JobOutcome<'a> {
    Completed(&'a serde_json::Value),
    Failed(&'a str),
}

impl JobOutcome<'_> {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }
}

/// Hooks around a job's lease, used to keep side bookkeeping (concurrency
/// leases, crawl completion) in step with the queue.
#[async_trait::async_trait]
pub trait JobLifecycle: Send + Sync {
    /// Called after each successful lease renewal.
    async fn on_heartbeat(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    /// Called once the job reached a terminal state. May run again for the
    /// same job if a previous call did not complete, so it must be
    /// idempotent.
    async fn on_terminal(&self, job: &Job, outcome: JobOutcome<'_>) -> Result<()>;
}

/// Lifecycle that does nothing.
pub struct NoopLifecycle;

#[async_trait::async_trait]
impl JobLifecycle for NoopLifecycle {
    async fn on_terminal(&self, _job: &Job, _outcome: JobOutcome<'_>) -> Result<()> {
        Ok(())
    }
}

/// A worker that processes jobs from a queue, one at a time.
pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    lifecycle: Arc<dyn JobLifecycle>,
    config: JobWorkerConfig,
}

impl JobWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        lifecycle: Arc<dyn JobLifecycle>,
    ) -> Self {
        Self::with_config(queue, handler, lifecycle, JobWorkerConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        lifecycle: Arc<dyn JobLifecycle>,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            lifecycle,
            config,
        }
    }

    /// Claim and process a single job. Returns `false` if none was available.
    /// Nothing is claimed once `shutdown` fired.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<bool> {
        if shutdown.is_cancelled() {
            return Ok(false);
        }
        let lock_token = Uuid::new_v4();
        let Some(job) = self.queue.get_job_to_process(lock_token).await? else {
            return Ok(false);
        };
        debug!(job_id = %job.id, team_id = %job.team_id, worker_id = %self.config.worker_id, "claimed job");

        self.process_job(job, lock_token).await;
        Ok(true)
    }

    async fn process_job(&self, job: Job, lock_token: Uuid) {
        let job_id = job.id;
        let job_cancel = CancellationToken::new();

        let result = self
            .execute_with_heartbeat(&job, lock_token, job_cancel.clone())
            .await;

        match result {
            Ok(value) => match self.queue.job_finish(job_id, lock_token, value.clone()).await {
                Ok(true) => {
                    debug!(job_id = %job_id, "job succeeded");
                    self.terminal(&job, JobOutcome::Completed(&value)).await;
                }
                Ok(false) => {
                    // Lease lost; the reaper owns the job now
                    warn!(job_id = %job_id, "job finished after its lease was lost");
                }
                Err(e) => error!(job_id = %job_id, error = %e, "failed to mark job as completed"),
            },
            Err(e) => {
                let error_id = Uuid::new_v4();
                error!(job_id = %job_id, %error_id, error = ?e, "job failed with an unexpected error");
                let reason = format!("{GENERIC_FAILURE_REASON} (error id {error_id})");
                match self.queue.job_fail(job_id, lock_token, &reason).await {
                    Ok(true) => self.terminal(&job, JobOutcome::Failed(&reason)).await,
                    Ok(false) => warn!(job_id = %job_id, "job failed after its lease was lost"),
                    Err(e) => error!(job_id = %job_id, error = %e, "failed to mark job as failed"),
                }
            }
        }
    }

    async fn terminal(&self, job: &Job, outcome: JobOutcome<'_>) {
        if let Err(e) = self.lifecycle.on_terminal(job, outcome).await {
            // Left unsettled; the reaper replays the hook
            error!(job_id = %job.id, error = %e, "job terminal hook failed");
            return;
        }
        if let Err(e) = self.queue.mark_settled(job.id).await {
            warn!(job_id = %job.id, error = %e, "failed to mark job as settled");
        }
    }

    /// Execute the handler with periodic lease renewals.
    async fn execute_with_heartbeat(
        &self,
        job: &Job,
        lock_token: Uuid,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let queue = self.queue.clone();
        let lifecycle = self.lifecycle.clone();
        let renew_interval = self.config.lock_renew_interval;
        let heartbeat_job = job.clone();

        // Spawn heartbeat task
        let heartbeat_stop = CancellationToken::new();
        let heartbeat_cancel = heartbeat_stop.clone();
        let job_cancel = cancel.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let job_id = heartbeat_job.id;
            let mut interval = tokio::time::interval(renew_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match queue.renew_lock(job_id, lock_token).await {
                            Ok(true) => {
                                if let Err(e) = lifecycle.on_heartbeat(&heartbeat_job).await {
                                    warn!(job_id = %job_id, error = %e, "heartbeat hook failed");
                                }
                            }
                            Ok(false) => {
                                warn!(job_id = %job_id, "lease lost, cancelling job");
                                job_cancel.cancel();
                                break;
                            }
                            Err(e) => warn!(job_id = %job_id, error = %e, "lease renewal failed"),
                        }
                    }
                }
            }
        });

        let result = self.handler.handle(job, cancel).await;

        // Stop heartbeat
        heartbeat_stop.cancel();
        let _ = heartbeat_handle.await;

        result
    }
}

#[async_trait::async_trait]
impl Service for JobWorker {
    fn name(&self) -> &'static str {
        "job-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "job worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once(&shutdown).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(error = %e, "failed to claim job"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "job worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::{JobStatus, MemoryJobQueue, NewJob};

    struct Echo;

    #[async_trait::async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: &Job, _cancel: CancellationToken) -> Result<serde_json::Value> {
            if job.data.get("explode").is_some() {
                anyhow::bail!("connection reset by peer");
            }
            Ok(job.data.clone())
        }
    }

    /// Blocks until released, then reports whether it saw a cancellation.
    struct Gate {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl JobHandler for Gate {
        async fn handle(&self, _job: &Job, cancel: CancellationToken) -> Result<serde_json::Value> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(serde_json::json!({"cancelled": cancel.is_cancelled()}))
        }
    }

    #[test]
    fn test_config_with_worker_id() {
        let config = JobWorkerConfig::with_worker_id("my-worker");
        assert_eq!(config.worker_id, "my-worker");
    }

    #[tokio::test]
    async fn test_run_once_completes_and_fails_generically() {
        let queue = Arc::new(MemoryJobQueue::new());
        let ok = queue
            .add_job(
                NewJob::builder()
                    .team_id("t")
                    .priority(1)
                    .data(serde_json::json!({"n": 1}))
                    .build(),
            )
            .await
            .unwrap();
        let bad = queue
            .add_job(
                NewJob::builder()
                    .team_id("t")
                    .priority(2)
                    .data(serde_json::json!({"explode": true}))
                    .build(),
            )
            .await
            .unwrap();

        let worker = JobWorker::new(queue.clone(), Arc::new(Echo), Arc::new(NoopLifecycle));
        let shutdown = CancellationToken::new();
        assert!(worker.run_once(&shutdown).await.unwrap());
        assert!(worker.run_once(&shutdown).await.unwrap());
        assert!(!worker.run_once(&shutdown).await.unwrap());

        let ok = queue.get_job(ok.id).await.unwrap().unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.return_value, Some(serde_json::json!({"n": 1})));

        let bad = queue.get_job(bad.id).await.unwrap().unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        let reason = bad.failed_reason.unwrap();
        assert!(reason.starts_with(GENERIC_FAILURE_REASON));
        assert!(!reason.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_shutdown_lets_claimed_job_finish() {
        let queue = Arc::new(MemoryJobQueue::new());
        let job = queue
            .add_job(NewJob::builder().team_id("t").build())
            .await
            .unwrap();
        let gate = Arc::new(Gate {
            started: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });

        let worker = Arc::new(JobWorker::new(queue.clone(), gate.clone(), Arc::new(NoopLifecycle)));
        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            async move { worker.run_once(&shutdown).await }
        });

        gate.started.notified().await;
        shutdown.cancel();
        gate.release.notify_one();
        assert!(running.await.unwrap().unwrap());

        let row = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.return_value, Some(serde_json::json!({"cancelled": false})));
        assert!(row.settled_at.is_some());

        // Nothing new is claimed after shutdown
        queue
            .add_job(NewJob::builder().team_id("t").build())
            .await
            .unwrap();
        assert!(!worker.run_once(&shutdown).await.unwrap());
    }
}
