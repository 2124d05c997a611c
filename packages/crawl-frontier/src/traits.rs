use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::*;

// ============================================================================
// COORDINATION STORE
// ============================================================================

/// Shared store backing every frontier operation.
///
/// Implementations must make each method atomic with respect to concurrent
/// callers in other processes: locking, completion bookkeeping and the finish
/// guard are all single store-level operations.
#[async_trait]
pub trait FrontierStore: Send + Sync {
    // Crawl state
    async fn save_crawl(&self, state: &CrawlState) -> Result<()>;
    async fn get_crawl(&self, crawl_id: Uuid) -> Result<Option<CrawlState>>;

    /// Set the cancelled flag. Returns the new state version.
    async fn set_cancelled(&self, crawl_id: Uuid) -> Result<u64>;
    /// Replace the crawl origin. Returns the new state version.
    async fn set_origin(&self, crawl_id: Uuid, origin_url: &str) -> Result<u64>;
    /// Store fetched robots.txt content. Returns the new state version.
    async fn set_robots_txt(&self, crawl_id: Uuid, content: &str) -> Result<u64>;

    // URL reservation

    /// Reserve each request in order; one outcome per request.
    ///
    /// A request is `Locked` only if none of its permutation keys were
    /// present, in which case all of them are inserted. `limit` caps the
    /// number of unique keys ever reserved for the crawl.
    async fn lock_urls(
        &self,
        crawl_id: Uuid,
        requests: &[LockRequest],
        limit: Option<u32>,
    ) -> Result<Vec<LockOutcome>>;

    async fn visited_count(&self, crawl_id: Uuid) -> Result<u64>;

    /// Record a sitemap fetch attempt unless `cap` attempts already exist.
    /// Returns whether this URL was newly registered.
    async fn add_sitemap_attempt(&self, crawl_id: Uuid, url: &str, cap: usize) -> Result<bool>;

    // Completion tracking
    async fn add_pending_jobs(&self, crawl_id: Uuid, job_ids: &[Uuid]) -> Result<()>;

    /// Move a registered job to done. Returns false if the job was unknown or
    /// already done.
    async fn mark_job_done(&self, crawl_id: Uuid, job_id: Uuid, success: bool) -> Result<bool>;

    async fn job_counts(&self, crawl_id: Uuid) -> Result<JobCounts>;

    /// Successful jobs in completion order.
    async fn completed_job_ids(&self, crawl_id: Uuid) -> Result<Vec<Uuid>>;

    // Discovery phases
    async fn mark_kickoff_finished(&self, crawl_id: Uuid) -> Result<()>;
    async fn add_sitemap_jobs(&self, crawl_id: Uuid, job_ids: &[Uuid]) -> Result<()>;
    async fn mark_sitemap_job_done(&self, crawl_id: Uuid, job_id: Uuid) -> Result<()>;

    /// Kickoff signalled and every sitemap job it spawned has finished.
    async fn discovery_finished(&self, crawl_id: Uuid) -> Result<bool>;

    /// Set-if-absent finish guard. Only the first caller gets `true`.
    async fn claim_finish(&self, crawl_id: Uuid) -> Result<bool>;
    async fn is_finished(&self, crawl_id: Uuid) -> Result<bool>;

    // Robots bookkeeping

    /// Add URLs to the robots-blocked set while it holds fewer than `cap`
    /// entries. Returns how many were added.
    async fn record_robots_blocked(
        &self,
        crawl_id: Uuid,
        urls: &[String],
        cap: usize,
        ttl: std::time::Duration,
    ) -> Result<usize>;

    async fn robots_blocked(&self, crawl_id: Uuid) -> Result<Vec<String>>;

    // Retention
    async fn purge_crawl(&self, crawl_id: Uuid) -> Result<()>;
}
