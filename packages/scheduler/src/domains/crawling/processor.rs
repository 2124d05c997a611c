//! Crawl job handler.
//!
//! Runs the three kinds of crawl job on a worker:
//!
//! ```text
//! Kickoff ─► robots.txt ─► reserve seed ─► Scrape(seed, depth 0)
//!         └► register sitemaps (capped) ─► Sitemap jobs
//!
//! Sitemap ─► nested sitemaps ─► Sitemap jobs
//!         └► page URLs ─► filter ─► reserve ─► Scrape jobs
//!
//! Scrape  ─► engine ─► redirect reservation ─► filter links ─► reserve ─► Scrape jobs
//! ```
//!
//! Crawl state is re-read before every scheduling decision so a
//! cancellation stops new children at the next safe point. Children are
//! registered with the frontier before they are admitted, so no sibling can
//! observe an exhausted crawl while a child is in flight.

use std::sync::Arc;

use async_trait::async_trait;
use crawl_frontier::{
    default_sitemap_urls, is_cross_domain_redirect, lock_request, normalize_url, process_sitemap,
    CrawlState, DenialReason, Frontier, LinkFilter, RobotsTxt, SitemapMode, UrlCandidate,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::engine::ScrapeEngine;
use super::error::{CrawlError, CrawlResult};
use super::payload::{CrawlJob, CrawlJobResult, CrawlJobStatus};
use crate::domains::concurrency::AdmissionControl;
use crate::kernel::jobs::{Job, JobHandler, JobPool, NewJob};

pub struct CrawlProcessor {
    frontier: Frontier,
    admission: AdmissionControl,
    engine: Arc<dyn ScrapeEngine>,
    filter: Arc<dyn LinkFilter>,
}

impl CrawlProcessor {
    pub fn new(
        frontier: Frontier,
        admission: AdmissionControl,
        engine: Arc<dyn ScrapeEngine>,
        filter: Arc<dyn LinkFilter>,
    ) -> Self {
        Self {
            frontier,
            admission,
            engine,
            filter,
        }
    }

    /// Fresh crawl state, or `Cancelled` if the crawl was cancelled.
    async fn live_crawl(&self, crawl_id: Uuid) -> CrawlResult<CrawlState> {
        let crawl = self.frontier.crawl(crawl_id).await?;
        if crawl.cancelled {
            return Err(CrawlError::Cancelled);
        }
        Ok(crawl)
    }

    pub async fn process(&self, job: &Job, cancel: &CancellationToken) -> CrawlResult<CrawlJobResult> {
        let payload: CrawlJob = job
            .payload()
            .map_err(|e| CrawlError::Unexpected(anyhow::anyhow!("invalid crawl payload: {e}")))?;

        match payload {
            CrawlJob::Kickoff { crawl_id } => self.kickoff(crawl_id).await,
            CrawlJob::Sitemap {
                crawl_id,
                sitemap_url,
            } => self.sitemap(crawl_id, &sitemap_url).await,
            CrawlJob::Scrape {
                crawl_id,
                url,
                depth,
                seed,
            } => self.scrape(crawl_id, &url, depth, seed, cancel).await,
        }
    }

    // =========================================================================
    // Kickoff
    // =========================================================================

    async fn kickoff(&self, crawl_id: Uuid) -> CrawlResult<CrawlJobResult> {
        let mut crawl = self.live_crawl(crawl_id).await?;
        let origin = Url::parse(&crawl.origin_url)
            .map_err(|_| CrawlError::Denied {
                reason: DenialReason::UrlParseError,
                detail: crawl.origin_url.clone(),
            })?;

        let mut robots_sitemaps = Vec::new();
        if !crawl.crawler_options.ignore_robots_txt {
            if let Some(content) = self.fetch_robots(&origin).await {
                self.frontier.set_robots_txt(crawl_id, &content).await?;
                crawl = self.live_crawl(crawl_id).await?;

                let robots = RobotsTxt::parse(&content);
                if !robots.is_url_allowed(&origin) {
                    self.frontier
                        .record_robots_blocked(crawl_id, &[crawl.origin_url.clone()])
                        .await?;
                    return Err(CrawlError::Denied {
                        reason: DenialReason::RobotsTxt,
                        detail: crawl.origin_url.clone(),
                    });
                }
                robots_sitemaps = robots.sitemaps().to_vec();
            }
        }

        let mut scheduled = 0;
        if self.frontier.lock_url(&crawl, &crawl.origin_url).await?.is_locked() {
            let seed = UrlCandidate::new(crawl.origin_url.clone());
            self.schedule_scrapes(&crawl, vec![seed], 0, true).await?;
            scheduled += 1;
        }

        if crawl.crawler_options.sitemap != SitemapMode::Skip {
            let mut sitemap_urls = robots_sitemaps;
            sitemap_urls.extend(default_sitemap_urls(&origin));
            scheduled += self.schedule_sitemaps(&crawl, sitemap_urls).await?;
        }

        info!(crawl_id = %crawl_id, scheduled, "crawl kicked off");
        Ok(CrawlJobResult {
            url: Some(crawl.origin_url),
            scheduled,
            ..CrawlJobResult::new(CrawlJobStatus::Discovered)
        })
    }

    async fn fetch_robots(&self, origin: &Url) -> Option<String> {
        let robots_url = origin.join("/robots.txt").ok()?;
        match self.engine.fetch_text(robots_url.as_str()).await {
            Ok(content) => content,
            Err(e) => {
                // Missing robots rules never block a crawl
                warn!(url = %robots_url, error = %e, "failed to fetch robots.txt");
                None
            }
        }
    }

    // =========================================================================
    // Sitemaps
    // =========================================================================

    async fn sitemap(&self, crawl_id: Uuid, sitemap_url: &str) -> CrawlResult<CrawlJobResult> {
        let crawl = self.live_crawl(crawl_id).await?;

        let skipped = |detail: String| CrawlJobResult {
            url: Some(sitemap_url.to_string()),
            detail: Some(detail),
            ..CrawlJobResult::new(CrawlJobStatus::Skipped)
        };

        let xml = match self.engine.fetch_text(sitemap_url).await {
            Ok(Some(xml)) => xml,
            Ok(None) => return Ok(skipped("not found".into())),
            Err(e) => {
                warn!(crawl_id = %crawl_id, sitemap = %sitemap_url, error = %e, "sitemap fetch failed");
                return Ok(skipped(e.to_string()));
            }
        };
        let instructions = match process_sitemap(&xml) {
            Ok(instructions) => instructions,
            Err(e) => {
                warn!(crawl_id = %crawl_id, sitemap = %sitemap_url, error = %e, "unreadable sitemap");
                return Ok(skipped(e.to_string()));
            }
        };

        let mut scheduled = self.schedule_sitemaps(&crawl, instructions.recurse).await?;

        // Re-read before scheduling pages
        let crawl = self.live_crawl(crawl_id).await?;
        let outcome = self.filter.filter_links(
            &crawl,
            &crawl.origin_url,
            instructions.process,
            self.remaining_limit(&crawl).await?,
        );
        self.frontier.record_denials(crawl_id, &outcome).await?;
        let candidates = outcome.links.into_iter().map(UrlCandidate::new).collect();
        scheduled += self.schedule_scrapes(&crawl, candidates, 1, false).await?;

        debug!(crawl_id = %crawl_id, sitemap = %sitemap_url, scheduled, "sitemap processed");
        Ok(CrawlJobResult {
            url: Some(sitemap_url.to_string()),
            scheduled,
            ..CrawlJobResult::new(CrawlJobStatus::Discovered)
        })
    }

    /// Register and admit sitemap jobs under the per-crawl cap.
    async fn schedule_sitemaps(&self, crawl: &CrawlState, urls: Vec<String>) -> CrawlResult<usize> {
        let mut jobs = Vec::new();
        for sitemap_url in urls {
            if self.frontier.try_register_sitemap(crawl.id, &sitemap_url).await? {
                jobs.push(self.new_job(
                    crawl,
                    CrawlJob::Sitemap {
                        crawl_id: crawl.id,
                        sitemap_url,
                    },
                    None,
                )?);
            }
        }
        if jobs.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        self.frontier.add_sitemap_jobs(crawl.id, &ids).await?;
        for job in jobs {
            self.admission.check_admission(job).await?;
        }
        Ok(ids.len())
    }

    // =========================================================================
    // Scrape
    // =========================================================================

    async fn scrape(
        &self,
        crawl_id: Uuid,
        url: &str,
        depth: u32,
        seed: bool,
        cancel: &CancellationToken,
    ) -> CrawlResult<CrawlJobResult> {
        let crawl = self.live_crawl(crawl_id).await?;

        let page = self
            .engine
            .scrape(url, &crawl.scrape_options)
            .await
            .map_err(CrawlError::Engine)?;

        let mut result = CrawlJobResult {
            url: Some(url.to_string()),
            final_url: Some(page.final_url.clone()),
            ..CrawlJobResult::new(CrawlJobStatus::Scraped)
        };

        let mut crawl = crawl;
        if !same_logical_url(url, &page.final_url, &crawl) {
            if seed && is_cross_domain_redirect(&crawl.origin_url, &page.final_url) {
                self.frontier.update_origin(crawl_id, &page.final_url).await?;
                crawl = self.frontier.crawl(crawl_id).await?;
            }
            if !self.frontier.lock_redirect_target(&crawl, &page.final_url).await? {
                result.status = CrawlJobStatus::RacedRedirect;
                return Ok(result);
            }
        }
        result.document = Some(page.document);

        // Lease lost: the job is being retried elsewhere
        if cancel.is_cancelled() {
            return Err(CrawlError::Unexpected(anyhow::anyhow!("lease lost before scheduling links")));
        }

        let options = &crawl.crawler_options;
        let within_discovery_depth = options
            .max_discovery_depth
            .map_or(true, |max| depth < max);
        if options.sitemap == SitemapMode::Only || !within_discovery_depth {
            return Ok(result);
        }

        // Cancellation stops children, not the page already fetched
        let crawl = match self.live_crawl(crawl_id).await {
            Ok(crawl) => crawl,
            Err(CrawlError::Cancelled) => return Ok(result),
            Err(e) => return Err(e),
        };

        let outcome = self.filter.filter_links(
            &crawl,
            &page.final_url,
            page.links,
            self.remaining_limit(&crawl).await?,
        );
        self.frontier.record_denials(crawl_id, &outcome).await?;
        let candidates = outcome.links.into_iter().map(UrlCandidate::new).collect();
        result.scheduled = self.schedule_scrapes(&crawl, candidates, depth + 1, false).await?;

        Ok(result)
    }

    /// Reserve candidates, register winners as pending, then admit them.
    async fn schedule_scrapes(
        &self,
        crawl: &CrawlState,
        candidates: Vec<UrlCandidate>,
        depth: u32,
        seed: bool,
    ) -> CrawlResult<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }

        // The seed was reserved by the caller
        let winners = if seed {
            candidates
        } else {
            self.frontier.lock_urls_individually(crawl, candidates).await?
        };
        if winners.is_empty() {
            return Ok(0);
        }

        let mut jobs = Vec::with_capacity(winners.len());
        for winner in &winners {
            jobs.push(self.new_job(
                crawl,
                CrawlJob::Scrape {
                    crawl_id: crawl.id,
                    url: winner.url.clone(),
                    depth,
                    seed,
                },
                Some(winner.job_id),
            )?);
        }

        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        self.frontier.add_crawl_jobs(crawl.id, &ids).await?;
        for job in jobs {
            self.admission.check_admission(job).await?;
        }

        debug!(crawl_id = %crawl.id, depth, count = ids.len(), "scheduled scrape jobs");
        Ok(ids.len())
    }

    /// Links still allowed under the crawl limit.
    async fn remaining_limit(&self, crawl: &CrawlState) -> CrawlResult<Option<usize>> {
        let Some(limit) = crawl.crawler_options.limit else {
            return Ok(None);
        };
        let visited = self.frontier.store().visited_count(crawl.id).await?;
        Ok(Some(u64::from(limit).saturating_sub(visited) as usize))
    }

    fn new_job(&self, crawl: &CrawlState, payload: CrawlJob, id: Option<Uuid>) -> CrawlResult<NewJob> {
        let data = payload
            .to_value()
            .map_err(|e| CrawlError::Unexpected(e.into()))?;
        Ok(NewJob::builder()
            .id(id.unwrap_or_else(Uuid::now_v7))
            .team_id(crawl.team_id.clone())
            .pool(JobPool::Scrape)
            .data(data)
            .priority(crawl.priority)
            .build())
    }
}

/// Whether `to` is a spelling of `from` that its reservation already covers.
fn same_logical_url(from: &str, to: &str, crawl: &CrawlState) -> bool {
    let (Ok(request), Ok(target)) = (lock_request(from, crawl), normalize_url(to, crawl)) else {
        return from == to;
    };
    request.permutation_keys.contains(&target) || request.unique_key == target
}

#[async_trait]
impl JobHandler for CrawlProcessor {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> anyhow::Result<serde_json::Value> {
        let result = match self.process(job, &cancel).await {
            Ok(result) => result,
            Err(CrawlError::Cancelled) => {
                debug!(job_id = %job.id, "crawl cancelled, job stopped");
                CrawlJobResult::new(CrawlJobStatus::Cancelled)
            }
            Err(CrawlError::Denied { reason, detail }) => {
                debug!(job_id = %job.id, %reason, %detail, "crawl job denied");
                CrawlJobResult {
                    detail: Some(format!("{}: {detail}", reason.as_code())),
                    ..CrawlJobResult::new(CrawlJobStatus::Denied)
                }
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::to_value(result)?)
    }
}
