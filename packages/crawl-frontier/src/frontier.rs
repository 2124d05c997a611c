//! The crawl frontier service.
//!
//! Wraps a [`FrontierStore`] with the crawl-level rules: URL reservation via
//! permutations, completion tracking across the two discovery phases, the
//! exactly-once finish guard and robots bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{FrontierError, Result};
use crate::filter::{DenialReason, FilterOutcome};
use crate::normalize::lock_request;
use crate::traits::FrontierStore;
use crate::types::*;

/// Frontier tuning.
#[derive(Debug, Clone)]
pub struct FrontierConfig {
    /// Sitemap fetches allowed per crawl
    pub max_sitemaps_per_crawl: usize,
    /// Robots-blocked URLs kept for reporting
    pub robots_blocked_cap: usize,
    pub robots_blocked_ttl: Duration,
    /// Expiry of all crawl keys
    pub retention: Duration,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            max_sitemaps_per_crawl: 20,
            robots_blocked_cap: 1000,
            robots_blocked_ttl: Duration::from_secs(24 * 60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Per-crawl dedup and completion tracking over a shared store.
#[derive(Clone)]
pub struct Frontier {
    store: Arc<dyn FrontierStore>,
    config: FrontierConfig,
}

impl Frontier {
    pub fn new(store: Arc<dyn FrontierStore>, config: FrontierConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &FrontierConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn FrontierStore> {
        &self.store
    }

    // =========================================================================
    // Crawl state
    // =========================================================================

    pub async fn create_crawl(&self, state: &CrawlState) -> Result<()> {
        self.store.save_crawl(state).await?;
        info!(
            crawl_id = %state.id,
            team_id = %state.team_id,
            origin = %state.origin_url,
            "Crawl created"
        );
        Ok(())
    }

    /// Fresh copy of the crawl state. Callers re-read before every
    /// scheduling decision instead of caching.
    pub async fn crawl(&self, crawl_id: Uuid) -> Result<CrawlState> {
        self.store
            .get_crawl(crawl_id)
            .await?
            .ok_or(FrontierError::CrawlNotFound(crawl_id))
    }

    pub async fn cancel(&self, crawl_id: Uuid) -> Result<()> {
        let version = self.store.set_cancelled(crawl_id).await?;
        info!(crawl_id = %crawl_id, version, "Crawl cancelled");
        Ok(())
    }

    /// Move the crawl origin after the seed page redirected to another host.
    pub async fn update_origin(&self, crawl_id: Uuid, origin_url: &str) -> Result<()> {
        let version = self.store.set_origin(crawl_id, origin_url).await?;
        info!(crawl_id = %crawl_id, origin = %origin_url, version, "Crawl origin updated");
        Ok(())
    }

    pub async fn set_robots_txt(&self, crawl_id: Uuid, content: &str) -> Result<()> {
        self.store.set_robots_txt(crawl_id, content).await?;
        Ok(())
    }

    // =========================================================================
    // URL reservation
    // =========================================================================

    /// Reserve `url` and all of its permutations for the crawl.
    pub async fn lock_url(&self, crawl: &CrawlState, url: &str) -> Result<LockOutcome> {
        let request = lock_request(url, crawl)?;
        let outcome = self
            .store
            .lock_urls(crawl.id, std::slice::from_ref(&request), crawl.crawler_options.limit)
            .await?
            .into_iter()
            .next()
            .unwrap_or(LockOutcome::AlreadyLocked);

        debug!(
            crawl_id = %crawl.id,
            url = %request.unique_key,
            outcome = ?outcome,
            "Lock URL"
        );
        Ok(outcome)
    }

    /// Reserve many candidates in one round trip; returns the winners in
    /// input order. Unparseable candidates are dropped.
    pub async fn lock_urls_individually(
        &self,
        crawl: &CrawlState,
        candidates: Vec<UrlCandidate>,
    ) -> Result<Vec<UrlCandidate>> {
        let mut valid = Vec::with_capacity(candidates.len());
        let mut requests = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match lock_request(&candidate.url, crawl) {
                Ok(request) => {
                    requests.push(request);
                    valid.push(candidate);
                }
                Err(e) => debug!(crawl_id = %crawl.id, error = %e, "Skipping candidate"),
            }
        }

        let outcomes = self
            .store
            .lock_urls(crawl.id, &requests, crawl.crawler_options.limit)
            .await?;

        let winners: Vec<UrlCandidate> = valid
            .into_iter()
            .zip(outcomes)
            .filter(|(_, outcome)| outcome.is_locked())
            .map(|(candidate, _)| candidate)
            .collect();

        debug!(
            crawl_id = %crawl.id,
            requested = requests.len(),
            locked = winners.len(),
            "Locked URLs individually"
        );
        Ok(winners)
    }

    /// Post-hoc reservation of a redirect target.
    ///
    /// Returns `false` when another job already owns the target; the caller
    /// stops propagating that branch without failing.
    pub async fn lock_redirect_target(&self, crawl: &CrawlState, target: &str) -> Result<bool> {
        let outcome = self.lock_url(crawl, target).await?;
        if !outcome.is_locked() {
            debug!(crawl_id = %crawl.id, target = %target, "Redirect target already claimed");
        }
        Ok(outcome.is_locked())
    }

    // =========================================================================
    // Completion tracking
    // =========================================================================

    pub async fn add_crawl_job(&self, crawl_id: Uuid, job_id: Uuid) -> Result<()> {
        self.store.add_pending_jobs(crawl_id, &[job_id]).await
    }

    pub async fn add_crawl_jobs(&self, crawl_id: Uuid, job_ids: &[Uuid]) -> Result<()> {
        self.store.add_pending_jobs(crawl_id, job_ids).await
    }

    pub async fn add_crawl_job_done(&self, crawl_id: Uuid, job_id: Uuid, success: bool) -> Result<()> {
        let moved = self.store.mark_job_done(crawl_id, job_id, success).await?;
        if !moved {
            debug!(crawl_id = %crawl_id, job_id = %job_id, "Job was not pending");
        }
        Ok(())
    }

    pub async fn mark_kickoff_finished(&self, crawl_id: Uuid) -> Result<()> {
        self.store.mark_kickoff_finished(crawl_id).await
    }

    pub async fn add_sitemap_jobs(&self, crawl_id: Uuid, job_ids: &[Uuid]) -> Result<()> {
        self.store.add_sitemap_jobs(crawl_id, job_ids).await
    }

    pub async fn mark_sitemap_job_done(&self, crawl_id: Uuid, job_id: Uuid) -> Result<()> {
        self.store.mark_sitemap_job_done(crawl_id, job_id).await
    }

    /// Register a sitemap fetch unless the per-crawl cap is reached or the
    /// sitemap was already attempted.
    pub async fn try_register_sitemap(&self, crawl_id: Uuid, sitemap_url: &str) -> Result<bool> {
        let registered = self
            .store
            .add_sitemap_attempt(crawl_id, sitemap_url, self.config.max_sitemaps_per_crawl)
            .await?;
        if !registered {
            debug!(crawl_id = %crawl_id, sitemap = %sitemap_url, "Sitemap skipped");
        }
        Ok(registered)
    }

    /// Declare the crawl finished if discovery is over and nothing is pending.
    ///
    /// Returns the summary only to the single caller that won the finish
    /// guard; every concurrent sibling gets `None`.
    pub async fn finish_crawl_if_needed(&self, crawl_id: Uuid) -> Result<Option<CrawlSummary>> {
        if !self.store.discovery_finished(crawl_id).await? {
            return Ok(None);
        }

        let counts = self.store.job_counts(crawl_id).await?;
        if counts.pending() > 0 {
            return Ok(None);
        }

        if !self.store.claim_finish(crawl_id).await? {
            return Ok(None);
        }

        let report = self.crawl_status(crawl_id).await?;
        info!(
            crawl_id = %crawl_id,
            status = ?report.status,
            completed = report.counts.completed,
            failed = report.counts.failed,
            "Crawl finished"
        );
        Ok(Some(report))
    }

    /// Current status and partial results.
    pub async fn crawl_status(&self, crawl_id: Uuid) -> Result<CrawlSummary> {
        let crawl = self.crawl(crawl_id).await?;
        let counts = self.store.job_counts(crawl_id).await?;
        let finished = self.store.is_finished(crawl_id).await?;

        let status = if crawl.cancelled {
            CrawlStatus::Cancelled
        } else if !finished {
            CrawlStatus::Scraping
        } else if counts.completed == 0 && counts.failed > 0 {
            CrawlStatus::Failed
        } else {
            CrawlStatus::Completed
        };

        Ok(CrawlSummary {
            crawl_id,
            team_id: crawl.team_id,
            status,
            counts,
            completed_job_ids: self.store.completed_job_ids(crawl_id).await?,
            robots_blocked: self.store.robots_blocked(crawl_id).await?,
        })
    }

    // =========================================================================
    // Denial bookkeeping
    // =========================================================================

    pub async fn record_robots_blocked(&self, crawl_id: Uuid, urls: &[String]) -> Result<usize> {
        self.store
            .record_robots_blocked(
                crawl_id,
                urls,
                self.config.robots_blocked_cap,
                self.config.robots_blocked_ttl,
            )
            .await
    }

    /// Record the denials of one filtered page: robots denials go to the
    /// robots-blocked set, the rest are only logged.
    pub async fn record_denials(&self, crawl_id: Uuid, outcome: &FilterOutcome) -> Result<()> {
        if outcome.denials.is_empty() {
            return Ok(());
        }

        let mut by_reason: HashMap<DenialReason, usize> = HashMap::new();
        for denial in outcome.denials.values() {
            *by_reason.entry(denial.reason).or_default() += 1;
        }
        for (reason, count) in &by_reason {
            debug!(crawl_id = %crawl_id, reason = %reason, count, "Links denied");
        }

        let blocked = outcome.robots_blocked();
        if !blocked.is_empty() {
            let added = self.record_robots_blocked(crawl_id, &blocked).await?;
            if added < blocked.len() {
                warn!(
                    crawl_id = %crawl_id,
                    dropped = blocked.len() - added,
                    "Robots-blocked set full or duplicate"
                );
            }
        }
        Ok(())
    }

    // =========================================================================
    // Retention
    // =========================================================================

    pub async fn purge_crawl(&self, crawl_id: Uuid) -> Result<()> {
        self.store.purge_crawl(crawl_id).await?;
        info!(crawl_id = %crawl_id, "Crawl purged");
        Ok(())
    }
}

/// Whether a redirect from the seed landed on a different host.
pub fn is_cross_domain_redirect(from: &str, to: &str) -> bool {
    match (Url::parse(from), Url::parse(to)) {
        (Ok(from), Ok(to)) => {
            let host = |u: &Url| u.host_str().map(|h| h.trim_start_matches("www.").to_string());
            host(&from) != host(&to)
        }
        _ => false,
    }
}
