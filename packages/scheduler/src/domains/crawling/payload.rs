//! Crawl job payloads and results, stored as the queue row's `data` and
//! `return_value`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a crawl job does.
///
/// # Usage
///
/// ```ignore
/// let job = NewJob::builder()
///     .team_id(&crawl.team_id)
///     .data(CrawlJob::kickoff(crawl.id).to_value()?)
///     .build();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrawlJob {
    /// Robots and sitemap discovery, then the seed page
    Kickoff { crawl_id: Uuid },
    /// Fetch one sitemap and schedule what it lists
    Sitemap { crawl_id: Uuid, sitemap_url: String },
    /// Scrape one reserved URL. `depth` counts link hops from the seed.
    Scrape {
        crawl_id: Uuid,
        url: String,
        depth: u32,
        #[serde(default)]
        seed: bool,
    },
}

impl CrawlJob {
    pub fn kickoff(crawl_id: Uuid) -> Self {
        Self::Kickoff { crawl_id }
    }

    pub fn crawl_id(&self) -> Uuid {
        match self {
            CrawlJob::Kickoff { crawl_id }
            | CrawlJob::Sitemap { crawl_id, .. }
            | CrawlJob::Scrape { crawl_id, .. } => *crawl_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CrawlJob::Kickoff { .. } => "kickoff",
            CrawlJob::Sitemap { .. } => "sitemap",
            CrawlJob::Scrape { .. } => "scrape",
        }
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlJobStatus {
    /// Page fetched; partial result for the crawl
    Scraped,
    /// Kickoff or sitemap discovery ran
    Discovered,
    /// Sitemap missing or unreadable
    Skipped,
    Cancelled,
    Denied,
    /// Redirect target already owned by another job
    RacedRedirect,
}

/// Return value of a completed crawl job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJobResult {
    pub status: CrawlJobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(default)]
    pub scheduled: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
}

impl CrawlJobResult {
    pub fn new(status: CrawlJobStatus) -> Self {
        Self {
            status,
            url: None,
            final_url: None,
            scheduled: 0,
            detail: None,
            document: None,
        }
    }

    /// Only scraped pages count as successful crawl children.
    pub fn is_success(&self) -> bool {
        self.status == CrawlJobStatus::Scraped
    }
}
