//! Producer-side crawl API.
//!
//! # Usage
//!
//! ```ignore
//! let started = crawls.start_crawl(CrawlState::new(team_id, url)).await?;
//! let summary = crawls.wait_for_crawl(started.crawl_id, Duration::from_secs(300)).await?;
//! ```

use std::time::Duration;

use crawl_frontier::{CrawlState, CrawlSummary, Frontier};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::error::{CrawlError, CrawlResult};
use super::payload::CrawlJob;
use crate::domains::concurrency::{AdmissionControl, AdmissionOutcome};
use crate::kernel::jobs::{JobPool, NewJob};

const CRAWL_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
pub struct CrawlStarted {
    pub crawl_id: Uuid,
    pub kickoff_job_id: Uuid,
    /// `false` if the kickoff waits in the team backlog
    pub admitted: bool,
}

#[derive(Clone)]
pub struct CrawlService {
    frontier: Frontier,
    admission: AdmissionControl,
}

impl CrawlService {
    pub fn new(frontier: Frontier, admission: AdmissionControl) -> Self {
        Self {
            frontier,
            admission,
        }
    }

    /// Persist the crawl and submit its kickoff job.
    pub async fn start_crawl(&self, crawl: CrawlState) -> CrawlResult<CrawlStarted> {
        self.frontier.create_crawl(&crawl).await?;

        let job = NewJob::builder()
            .team_id(crawl.team_id.clone())
            .pool(JobPool::Scrape)
            .data(
                CrawlJob::kickoff(crawl.id)
                    .to_value()
                    .map_err(|e| CrawlError::Unexpected(e.into()))?,
            )
            .priority(crawl.priority)
            .build();
        let outcome = self.admission.check_admission(job).await?;

        info!(
            crawl_id = %crawl.id,
            team_id = %crawl.team_id,
            origin = %crawl.origin_url,
            admitted = outcome.is_admitted(),
            "crawl started"
        );
        Ok(CrawlStarted {
            crawl_id: crawl.id,
            kickoff_job_id: outcome.job_id(),
            admitted: matches!(outcome, AdmissionOutcome::Admitted(_)),
        })
    }

    /// Stop scheduling new children. Running jobs finish their page.
    pub async fn cancel_crawl(&self, crawl_id: Uuid) -> CrawlResult<()> {
        self.frontier.cancel(crawl_id).await?;
        info!(crawl_id = %crawl_id, "crawl cancelled");
        Ok(())
    }

    pub async fn crawl_status(&self, crawl_id: Uuid) -> CrawlResult<CrawlSummary> {
        Ok(self.frontier.crawl_status(crawl_id).await?)
    }

    /// Poll until the crawl leaves `scraping`. A cancelled crawl resolves
    /// once its in-flight jobs have drained.
    pub async fn wait_for_crawl(&self, crawl_id: Uuid, timeout: Duration) -> CrawlResult<CrawlSummary> {
        tokio::time::timeout(timeout, self.poll_until_finished(crawl_id))
            .await
            .map_err(|_| CrawlError::Unexpected(anyhow::anyhow!("timed out waiting for crawl {crawl_id}")))?
    }

    async fn poll_until_finished(&self, crawl_id: Uuid) -> CrawlResult<CrawlSummary> {
        let mut poll = tokio::time::interval(CRAWL_POLL_INTERVAL);
        loop {
            poll.tick().await;
            if self.frontier.store().is_finished(crawl_id).await? {
                return self.crawl_status(crawl_id).await;
            }
        }
    }

    pub async fn purge_crawl(&self, crawl_id: Uuid) -> CrawlResult<()> {
        Ok(self.frontier.purge_crawl(crawl_id).await?)
    }
}
