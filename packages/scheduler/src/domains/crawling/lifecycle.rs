//! Bookkeeping around crawl job leases.
//!
//! On every heartbeat the job's concurrency slot is renewed. When a job
//! reaches a terminal state (through the worker or the stall reaper) the
//! frontier records it, the crawl is finished if it is exhausted, and the
//! slot goes back to the team's backlog.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use crawl_frontier::{CrawlSummary, Frontier};
use tracing::{info, warn};

use super::payload::{CrawlJob, CrawlJobResult};
use crate::domains::concurrency::AdmissionControl;
use crate::kernel::jobs::{Job, JobLifecycle, JobOutcome};

/// Receives the final aggregate of a crawl, exactly once per crawl.
#[async_trait]
pub trait CrawlCompletionHook: Send + Sync {
    async fn crawl_finished(&self, summary: &CrawlSummary) -> Result<()>;
}

/// Completion hook that only logs.
pub struct LogCompletionHook;

#[async_trait]
impl CrawlCompletionHook for LogCompletionHook {
    async fn crawl_finished(&self, summary: &CrawlSummary) -> Result<()> {
        info!(
            crawl_id = %summary.crawl_id,
            team_id = %summary.team_id,
            status = ?summary.status,
            completed = summary.counts.completed,
            failed = summary.counts.failed,
            robots_blocked = summary.robots_blocked.len(),
            "crawl completed"
        );
        Ok(())
    }
}

pub struct CrawlLifecycle {
    frontier: Frontier,
    admission: AdmissionControl,
    completion: Arc<dyn CrawlCompletionHook>,
    lease: Duration,
}

impl CrawlLifecycle {
    pub fn new(
        frontier: Frontier,
        admission: AdmissionControl,
        completion: Arc<dyn CrawlCompletionHook>,
    ) -> Self {
        let lease = admission.config().lease;
        Self {
            frontier,
            admission,
            completion,
            lease,
        }
    }

    async fn record_done(&self, job: &Job, payload: &CrawlJob, outcome: JobOutcome<'_>) -> Result<()> {
        let crawl_id = payload.crawl_id();
        match payload {
            CrawlJob::Kickoff { .. } => self.frontier.mark_kickoff_finished(crawl_id).await?,
            CrawlJob::Sitemap { .. } => self.frontier.mark_sitemap_job_done(crawl_id, job.id).await?,
            CrawlJob::Scrape { .. } => {
                let success = match outcome {
                    JobOutcome::Completed(value) => serde_json::from_value::<CrawlJobResult>(value.clone())
                        .is_ok_and(|result| result.is_success()),
                    JobOutcome::Failed(_) => false,
                };
                self.frontier.add_crawl_job_done(crawl_id, job.id, success).await?;
            }
        }

        if let Some(summary) = self.frontier.finish_crawl_if_needed(crawl_id).await? {
            self.completion.crawl_finished(&summary).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobLifecycle for CrawlLifecycle {
    async fn on_heartbeat(&self, job: &Job) -> Result<()> {
        self.admission
            .renew_active_lease(&job.team_id, job.pool, job.id, self.lease)
            .await?;
        Ok(())
    }

    async fn on_terminal(&self, job: &Job, outcome: JobOutcome<'_>) -> Result<()> {
        let bookkeeping = match job.payload::<CrawlJob>() {
            Ok(payload) => self.record_done(job, &payload, outcome).await,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "terminal job has no crawl payload");
                Ok(())
            }
        };

        // Free the slot even if frontier bookkeeping failed
        self.admission.release(&job.team_id, job.pool, job.id).await?;
        bookkeeping
    }
}
