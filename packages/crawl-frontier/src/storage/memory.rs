//! In-memory frontier store for testing and single-process development.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{FrontierError, Result};
use crate::traits::FrontierStore;
use crate::types::{CrawlState, JobCounts, LockOutcome, LockRequest};

#[derive(Default)]
struct CrawlRecord {
    state: Option<CrawlState>,
    visited: HashSet<String>,
    visited_unique: HashSet<String>,
    sitemaps_attempted: HashSet<String>,
    jobs: HashSet<Uuid>,
    jobs_done: HashSet<Uuid>,
    jobs_failed: HashSet<Uuid>,
    jobs_done_ordered: Vec<Uuid>,
    kickoff_finished: bool,
    sitemap_jobs: HashSet<Uuid>,
    sitemap_jobs_done: HashSet<Uuid>,
    finished: bool,
    robots_blocked: Vec<String>,
}

/// Frontier store held in process memory.
///
/// A single lock around all crawls gives every operation the same
/// atomicity the Redis scripts provide. Key expiry is not modelled.
pub struct MemoryFrontierStore {
    crawls: RwLock<HashMap<Uuid, CrawlRecord>>,
}

impl Default for MemoryFrontierStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFrontierStore {
    pub fn new() -> Self {
        Self {
            crawls: RwLock::new(HashMap::new()),
        }
    }

    async fn with_record<T>(&self, crawl_id: Uuid, f: impl FnOnce(&mut CrawlRecord) -> T) -> T {
        let mut crawls = self.crawls.write().await;
        f(crawls.entry(crawl_id).or_default())
    }

    async fn mutate_state(&self, crawl_id: Uuid, f: impl FnOnce(&mut CrawlState)) -> Result<u64> {
        let mut crawls = self.crawls.write().await;
        let state = crawls
            .get_mut(&crawl_id)
            .and_then(|r| r.state.as_mut())
            .ok_or(FrontierError::CrawlNotFound(crawl_id))?;
        f(state);
        state.version += 1;
        Ok(state.version)
    }
}

#[async_trait]
impl FrontierStore for MemoryFrontierStore {
    async fn save_crawl(&self, state: &CrawlState) -> Result<()> {
        self.with_record(state.id, |r| r.state = Some(state.clone())).await;
        Ok(())
    }

    async fn get_crawl(&self, crawl_id: Uuid) -> Result<Option<CrawlState>> {
        let crawls = self.crawls.read().await;
        Ok(crawls.get(&crawl_id).and_then(|r| r.state.clone()))
    }

    async fn set_cancelled(&self, crawl_id: Uuid) -> Result<u64> {
        self.mutate_state(crawl_id, |s| s.cancelled = true).await
    }

    async fn set_origin(&self, crawl_id: Uuid, origin_url: &str) -> Result<u64> {
        self.mutate_state(crawl_id, |s| s.origin_url = origin_url.to_string()).await
    }

    async fn set_robots_txt(&self, crawl_id: Uuid, content: &str) -> Result<u64> {
        self.mutate_state(crawl_id, |s| s.robots_txt = Some(content.to_string())).await
    }

    async fn lock_urls(
        &self,
        crawl_id: Uuid,
        requests: &[LockRequest],
        limit: Option<u32>,
    ) -> Result<Vec<LockOutcome>> {
        Ok(self.with_record(crawl_id, |r| {
            requests
                .iter()
                .map(|request| {
                    if let Some(limit) = limit {
                        if r.visited_unique.len() >= limit as usize {
                            return LockOutcome::LimitReached;
                        }
                    }
                    if request
                        .permutation_keys
                        .iter()
                        .any(|k| r.visited.contains(k))
                    {
                        return LockOutcome::AlreadyLocked;
                    }
                    r.visited.extend(request.permutation_keys.iter().cloned());
                    r.visited_unique.insert(request.unique_key.clone());
                    LockOutcome::Locked
                })
                .collect()
        }).await)
    }

    async fn visited_count(&self, crawl_id: Uuid) -> Result<u64> {
        Ok(self.with_record(crawl_id, |r| r.visited_unique.len() as u64).await)
    }

    async fn add_sitemap_attempt(&self, crawl_id: Uuid, url: &str, cap: usize) -> Result<bool> {
        Ok(self.with_record(crawl_id, |r| {
            if r.sitemaps_attempted.len() >= cap {
                return false;
            }
            r.sitemaps_attempted.insert(url.to_string())
        }).await)
    }

    async fn add_pending_jobs(&self, crawl_id: Uuid, job_ids: &[Uuid]) -> Result<()> {
        self.with_record(crawl_id, |r| r.jobs.extend(job_ids.iter().copied())).await;
        Ok(())
    }

    async fn mark_job_done(&self, crawl_id: Uuid, job_id: Uuid, success: bool) -> Result<bool> {
        Ok(self.with_record(crawl_id, |r| {
            if !r.jobs.contains(&job_id) || !r.jobs_done.insert(job_id) {
                return false;
            }
            if success {
                r.jobs_done_ordered.push(job_id);
            } else {
                r.jobs_failed.insert(job_id);
            }
            true
        }).await)
    }

    async fn job_counts(&self, crawl_id: Uuid) -> Result<JobCounts> {
        Ok(self.with_record(crawl_id, |r| JobCounts {
            total: r.jobs.len() as u64,
            completed: (r.jobs_done.len() - r.jobs_failed.len()) as u64,
            failed: r.jobs_failed.len() as u64,
        }).await)
    }

    async fn completed_job_ids(&self, crawl_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self.with_record(crawl_id, |r| r.jobs_done_ordered.clone()).await)
    }

    async fn mark_kickoff_finished(&self, crawl_id: Uuid) -> Result<()> {
        self.with_record(crawl_id, |r| r.kickoff_finished = true).await;
        Ok(())
    }

    async fn add_sitemap_jobs(&self, crawl_id: Uuid, job_ids: &[Uuid]) -> Result<()> {
        self.with_record(crawl_id, |r| r.sitemap_jobs.extend(job_ids.iter().copied())).await;
        Ok(())
    }

    async fn mark_sitemap_job_done(&self, crawl_id: Uuid, job_id: Uuid) -> Result<()> {
        self.with_record(crawl_id, |r| {
            r.sitemap_jobs_done.insert(job_id);
        }).await;
        Ok(())
    }

    async fn discovery_finished(&self, crawl_id: Uuid) -> Result<bool> {
        Ok(self.with_record(crawl_id, |r| {
            r.kickoff_finished && r.sitemap_jobs.len() == r.sitemap_jobs_done.len()
        }).await)
    }

    async fn claim_finish(&self, crawl_id: Uuid) -> Result<bool> {
        Ok(self.with_record(crawl_id, |r| !std::mem::replace(&mut r.finished, true)).await)
    }

    async fn is_finished(&self, crawl_id: Uuid) -> Result<bool> {
        Ok(self.with_record(crawl_id, |r| r.finished).await)
    }

    async fn record_robots_blocked(
        &self,
        crawl_id: Uuid,
        urls: &[String],
        cap: usize,
        _ttl: Duration,
    ) -> Result<usize> {
        Ok(self.with_record(crawl_id, |r| {
            let mut added = 0;
            for url in urls {
                if r.robots_blocked.len() >= cap {
                    break;
                }
                if !r.robots_blocked.contains(url) {
                    r.robots_blocked.push(url.clone());
                    added += 1;
                }
            }
            added
        }).await)
    }

    async fn robots_blocked(&self, crawl_id: Uuid) -> Result<Vec<String>> {
        Ok(self.with_record(crawl_id, |r| r.robots_blocked.clone()).await)
    }

    async fn purge_crawl(&self, crawl_id: Uuid) -> Result<()> {
        self.crawls.write().await.remove(&crawl_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str, perms: &[&str]) -> LockRequest {
        LockRequest {
            unique_key: key.to_string(),
            permutation_keys: perms.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_lock_rejects_overlapping_permutations() {
        let store = MemoryFrontierStore::new();
        let crawl = Uuid::now_v7();

        let outcomes = store
            .lock_urls(
                crawl,
                &[request("a", &["a", "a/"]), request("b", &["a/", "b"])],
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcomes, vec![LockOutcome::Locked, LockOutcome::AlreadyLocked]);
        // The losing request must not leak its other permutations
        let again = store
            .lock_urls(crawl, &[request("b", &["b"])], None)
            .await
            .unwrap();
        assert_eq!(again, vec![LockOutcome::Locked]);
    }

    #[tokio::test]
    async fn test_limit_counts_unique_keys() {
        let store = MemoryFrontierStore::new();
        let crawl = Uuid::now_v7();

        let outcomes = store
            .lock_urls(
                crawl,
                &[request("a", &["a"]), request("b", &["b"]), request("c", &["c"])],
                Some(2),
            )
            .await
            .unwrap();

        assert_eq!(
            outcomes,
            vec![LockOutcome::Locked, LockOutcome::Locked, LockOutcome::LimitReached]
        );
        assert_eq!(store.visited_count(crawl).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_mark_job_done_is_idempotent() {
        let store = MemoryFrontierStore::new();
        let crawl = Uuid::now_v7();
        let job = Uuid::now_v7();

        assert!(!store.mark_job_done(crawl, job, true).await.unwrap());
        store.add_pending_jobs(crawl, &[job]).await.unwrap();
        assert!(store.mark_job_done(crawl, job, true).await.unwrap());
        assert!(!store.mark_job_done(crawl, job, false).await.unwrap());

        let counts = store.job_counts(crawl).await.unwrap();
        assert_eq!(counts, JobCounts { total: 1, completed: 1, failed: 0 });
    }

    #[tokio::test]
    async fn test_state_mutations_bump_version() {
        let store = MemoryFrontierStore::new();
        let state = CrawlState::new("team", "https://example.com");
        store.save_crawl(&state).await.unwrap();

        assert_eq!(store.set_cancelled(state.id).await.unwrap(), 1);
        assert_eq!(
            store.set_origin(state.id, "https://example.org").await.unwrap(),
            2
        );

        let stored = store.get_crawl(state.id).await.unwrap().unwrap();
        assert!(stored.cancelled);
        assert_eq!(stored.origin_url, "https://example.org");

        let missing = store.set_cancelled(Uuid::now_v7()).await;
        assert!(matches!(missing, Err(FrontierError::CrawlNotFound(_))));
    }
}
