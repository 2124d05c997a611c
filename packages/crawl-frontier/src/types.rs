use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ENUMS (type-safe states)
// ============================================================================

/// How a crawl treats sitemaps during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SitemapMode {
    /// Never fetch sitemaps
    Skip,
    /// Sitemap links alongside links discovered on pages
    #[default]
    Include,
    /// Only sitemap links; pages do not spawn children
    Only,
}

/// Terminal (or in-progress) status of a whole crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Scraping,
    Completed,
    Cancelled,
    Failed,
}

// ============================================================================
// CRAWL STATE
// ============================================================================

/// Crawl policy applied to every link discovered during a crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerOptions {
    /// Maximum path depth of URLs to follow (segments below the root)
    pub max_depth: u32,
    /// Maximum link hops from the seed page
    pub max_discovery_depth: Option<u32>,
    /// Maximum number of unique URLs reserved for the crawl
    pub limit: Option<u32>,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    /// Match include/exclude patterns against the full URL instead of the path
    pub regex_on_full_url: bool,
    /// Allow links outside the seed path (a.k.a. crawl entire domain)
    pub crawl_entire_domain: bool,
    pub allow_external_content_links: bool,
    pub allow_subdomains: bool,
    pub ignore_robots_txt: bool,
    pub sitemap: SitemapMode,
    pub ignore_query_parameters: bool,
    /// Reserve every surface-equivalent permutation of a URL together
    pub deduplicate_similar_urls: bool,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_discovery_depth: None,
            limit: None,
            includes: Vec::new(),
            excludes: Vec::new(),
            regex_on_full_url: false,
            crawl_entire_domain: false,
            allow_external_content_links: false,
            allow_subdomains: false,
            ignore_robots_txt: false,
            sitemap: SitemapMode::Include,
            ignore_query_parameters: false,
            deduplicate_similar_urls: true,
        }
    }
}

/// Shared state of one crawl, owned by the request that created it.
///
/// Workers must re-read this before every scheduling decision; `version`
/// increases on every stored mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlState {
    pub id: Uuid,
    pub team_id: String,
    pub origin_url: String,
    pub crawler_options: CrawlerOptions,
    /// Scrape options template copied into every child job
    pub scrape_options: serde_json::Value,
    /// Priority given to this crawl's child jobs (lower = more urgent)
    pub priority: i32,
    pub robots_txt: Option<String>,
    pub cancelled: bool,
    pub zero_data_retention: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl CrawlState {
    pub fn new(team_id: impl Into<String>, origin_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            team_id: team_id.into(),
            origin_url: origin_url.into(),
            crawler_options: CrawlerOptions::default(),
            scrape_options: serde_json::Value::Object(Default::default()),
            priority: 10,
            robots_txt: None,
            cancelled: false,
            zero_data_retention: false,
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_options(mut self, options: CrawlerOptions) -> Self {
        self.crawler_options = options;
        self
    }

    pub fn with_scrape_options(mut self, scrape_options: serde_json::Value) -> Self {
        self.scrape_options = scrape_options;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

// ============================================================================
// FRONTIER RECORDS
// ============================================================================

/// A URL proposed for scheduling together with the job id that would run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlCandidate {
    pub job_id: Uuid,
    pub url: String,
}

impl UrlCandidate {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            url: url.into(),
        }
    }
}

/// Outcome of reserving one URL (all of its permutations) in the visited set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// None of the permutation keys were present; caller owns the URL
    Locked,
    /// At least one permutation was already reserved
    AlreadyLocked,
    /// The crawl already reserved `limit` unique URLs
    LimitReached,
}

impl LockOutcome {
    pub fn is_locked(self) -> bool {
        matches!(self, LockOutcome::Locked)
    }
}

/// Keys reserved atomically for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// Normalized URL, counted against the crawl limit
    pub unique_key: String,
    /// Every permutation that must be absent for the lock to succeed
    pub permutation_keys: Vec<String>,
}

/// Completion counters for a crawl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn done(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.done())
    }
}

/// Final aggregate handed to the completion hook exactly once per crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub crawl_id: Uuid,
    pub team_id: String,
    pub status: CrawlStatus,
    pub counts: JobCounts,
    /// Successful child jobs in completion order
    pub completed_job_ids: Vec<Uuid>,
    pub robots_blocked: Vec<String>,
}
