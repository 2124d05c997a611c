//! Redis-backed frontier store.
//!
//! Multi-key operations run as Lua scripts so each one is atomic across
//! every worker process sharing the Redis instance.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{FrontierError, Result};
use crate::traits::FrontierStore;
use crate::types::{CrawlState, JobCounts, LockOutcome, LockRequest};

/// KEYS: visited, visited_unique.
/// ARGV: limit (0 = none), ttl, then per request: n, unique key, n permutations.
static LOCK_URLS_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local limit = tonumber(ARGV[1])
        local results = {}
        local i = 3
        while i <= #ARGV do
            local n = tonumber(ARGV[i])
            local outcome = 1
            if limit > 0 and redis.call('SCARD', KEYS[2]) >= limit then
                outcome = -1
            else
                for j = 1, n do
                    if redis.call('SISMEMBER', KEYS[1], ARGV[i + 1 + j]) == 1 then
                        outcome = 0
                        break
                    end
                end
                if outcome == 1 then
                    for j = 1, n do
                        redis.call('SADD', KEYS[1], ARGV[i + 1 + j])
                    end
                    redis.call('SADD', KEYS[2], ARGV[i + 1])
                end
            end
            table.insert(results, outcome)
            i = i + 2 + n
        end
        redis.call('EXPIRE', KEYS[1], ARGV[2])
        redis.call('EXPIRE', KEYS[2], ARGV[2])
        return results
        ",
    )
});

/// KEYS: set. ARGV: cap, ttl, members...
static CAPPED_SADD_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local cap = tonumber(ARGV[1])
        local added = 0
        for i = 3, #ARGV do
            if redis.call('SCARD', KEYS[1]) >= cap then
                break
            end
            added = added + redis.call('SADD', KEYS[1], ARGV[i])
        end
        redis.call('EXPIRE', KEYS[1], ARGV[2])
        return added
        ",
    )
});

/// KEYS: jobs, jobs_done, jobs_done_ordered, jobs_failed.
/// ARGV: job id, success flag, ttl.
static MARK_DONE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 0 then
            return 0
        end
        if redis.call('SADD', KEYS[2], ARGV[1]) == 0 then
            return 0
        end
        if ARGV[2] == '1' then
            redis.call('RPUSH', KEYS[3], ARGV[1])
        else
            redis.call('SADD', KEYS[4], ARGV[1])
        end
        for i = 2, 4 do
            redis.call('EXPIRE', KEYS[i], ARGV[3])
        end
        return 1
        ",
    )
});

/// KEYS: state, field, version. ARGV: value, ttl.
static SET_FIELD_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then
            return -1
        end
        redis.call('SET', KEYS[2], ARGV[1], 'EX', ARGV[2])
        local version = redis.call('INCR', KEYS[3])
        redis.call('EXPIRE', KEYS[3], ARGV[2])
        return version
        ",
    )
});

struct CrawlKeys {
    state: String,
    cancelled: String,
    origin: String,
    robots_txt: String,
    version: String,
    visited: String,
    visited_unique: String,
    sitemaps_attempted: String,
    jobs: String,
    jobs_done: String,
    jobs_done_ordered: String,
    jobs_failed: String,
    kickoff_finished: String,
    sitemap_jobs: String,
    sitemap_jobs_done: String,
    finish: String,
    robots_blocked: String,
}

impl CrawlKeys {
    fn new(crawl_id: Uuid) -> Self {
        let base = format!("crawl:{crawl_id}");
        Self {
            cancelled: format!("{base}:cancelled"),
            origin: format!("{base}:origin"),
            robots_txt: format!("{base}:robots_txt"),
            version: format!("{base}:version"),
            visited: format!("{base}:visited"),
            visited_unique: format!("{base}:visited_unique"),
            sitemaps_attempted: format!("{base}:sitemaps_attempted"),
            jobs: format!("{base}:jobs"),
            jobs_done: format!("{base}:jobs_done"),
            jobs_done_ordered: format!("{base}:jobs_done_ordered"),
            jobs_failed: format!("{base}:jobs_failed"),
            kickoff_finished: format!("{base}:kickoff:finish"),
            sitemap_jobs: format!("{base}:sitemap_jobs"),
            sitemap_jobs_done: format!("{base}:sitemap_jobs_done"),
            finish: format!("{base}:finish"),
            robots_blocked: format!("{base}:robots_blocked"),
            state: base,
        }
    }

    fn all(&self) -> [&str; 17] {
        [
            &self.state,
            &self.cancelled,
            &self.origin,
            &self.robots_txt,
            &self.version,
            &self.visited,
            &self.visited_unique,
            &self.sitemaps_attempted,
            &self.jobs,
            &self.jobs_done,
            &self.jobs_done_ordered,
            &self.jobs_failed,
            &self.kickoff_finished,
            &self.sitemap_jobs,
            &self.sitemap_jobs_done,
            &self.finish,
            &self.robots_blocked,
        ]
    }
}

/// Frontier store on a shared Redis instance.
///
/// Every key written for a crawl expires after `retention`.
#[derive(Clone)]
pub struct RedisFrontierStore {
    con: MultiplexedConnection,
    retention: Duration,
}

impl RedisFrontierStore {
    pub fn new(con: MultiplexedConnection, retention: Duration) -> Self {
        Self { con, retention }
    }

    /// Connect to `redis_url` and build a store.
    pub async fn connect(redis_url: &str, retention: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let con = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(con, retention))
    }

    fn ttl_secs(&self) -> i64 {
        self.retention.as_secs().max(1) as i64
    }

    async fn set_field(&self, crawl_id: Uuid, field: &str, value: &str) -> Result<u64> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let version: i64 = SET_FIELD_SCRIPT
            .key(&keys.state)
            .key(field)
            .key(&keys.version)
            .arg(value)
            .arg(self.ttl_secs())
            .invoke_async(&mut con)
            .await?;

        if version < 0 {
            return Err(FrontierError::CrawlNotFound(crawl_id));
        }
        Ok(version as u64)
    }

    async fn add_to_set(&self, key: &str, job_ids: &[Uuid]) -> Result<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        let members: Vec<String> = job_ids.iter().map(Uuid::to_string).collect();
        let mut con = self.con.clone();
        let _: () = redis::pipe()
            .atomic()
            .sadd(key, members)
            .ignore()
            .expire(key, self.ttl_secs())
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FrontierStore for RedisFrontierStore {
    async fn save_crawl(&self, state: &CrawlState) -> Result<()> {
        let keys = CrawlKeys::new(state.id);
        let json = serde_json::to_string(state)?;
        let ttl = self.ttl_secs() as u64;
        let mut con = self.con.clone();

        let overrides = [
            keys.cancelled.as_str(),
            keys.origin.as_str(),
            keys.robots_txt.as_str(),
        ];
        let _: () = redis::pipe()
            .atomic()
            .del(&overrides[..])
            .ignore()
            .set_ex(&keys.state, json, ttl)
            .ignore()
            .set_ex(&keys.version, state.version, ttl)
            .ignore()
            .query_async(&mut con)
            .await?;

        debug!(crawl_id = %state.id, "Saved crawl state");
        Ok(())
    }

    async fn get_crawl(&self, crawl_id: Uuid) -> Result<Option<CrawlState>> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();

        let (json, cancelled, origin, robots_txt, version): (
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<u64>,
        ) = redis::cmd("MGET")
            .arg(&keys.state)
            .arg(&keys.cancelled)
            .arg(&keys.origin)
            .arg(&keys.robots_txt)
            .arg(&keys.version)
            .query_async(&mut con)
            .await?;

        let Some(json) = json else {
            return Ok(None);
        };

        let mut state: CrawlState = serde_json::from_str(&json)?;
        if cancelled.is_some() {
            state.cancelled = true;
        }
        if let Some(origin) = origin {
            state.origin_url = origin;
        }
        if let Some(robots_txt) = robots_txt {
            state.robots_txt = Some(robots_txt);
        }
        if let Some(version) = version {
            state.version = version;
        }
        Ok(Some(state))
    }

    async fn set_cancelled(&self, crawl_id: Uuid) -> Result<u64> {
        let keys = CrawlKeys::new(crawl_id);
        self.set_field(crawl_id, &keys.cancelled, "1").await
    }

    async fn set_origin(&self, crawl_id: Uuid, origin_url: &str) -> Result<u64> {
        let keys = CrawlKeys::new(crawl_id);
        self.set_field(crawl_id, &keys.origin, origin_url).await
    }

    async fn set_robots_txt(&self, crawl_id: Uuid, content: &str) -> Result<u64> {
        let keys = CrawlKeys::new(crawl_id);
        self.set_field(crawl_id, &keys.robots_txt, content).await
    }

    async fn lock_urls(
        &self,
        crawl_id: Uuid,
        requests: &[LockRequest],
        limit: Option<u32>,
    ) -> Result<Vec<LockOutcome>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let keys = CrawlKeys::new(crawl_id);

        let mut invocation = LOCK_URLS_SCRIPT.prepare_invoke();
        invocation
            .key(&keys.visited)
            .key(&keys.visited_unique)
            .arg(limit.unwrap_or(0))
            .arg(self.ttl_secs());
        for request in requests {
            invocation
                .arg(request.permutation_keys.len())
                .arg(&request.unique_key);
            for key in &request.permutation_keys {
                invocation.arg(key);
            }
        }

        let mut con = self.con.clone();
        let codes: Vec<i64> = invocation.invoke_async(&mut con).await?;

        Ok(codes
            .into_iter()
            .map(|code| match code {
                1 => LockOutcome::Locked,
                -1 => LockOutcome::LimitReached,
                _ => LockOutcome::AlreadyLocked,
            })
            .collect())
    }

    async fn visited_count(&self, crawl_id: Uuid) -> Result<u64> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let count: u64 = con.scard(&keys.visited_unique).await?;
        Ok(count)
    }

    async fn add_sitemap_attempt(&self, crawl_id: Uuid, url: &str, cap: usize) -> Result<bool> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let added: i64 = CAPPED_SADD_SCRIPT
            .key(&keys.sitemaps_attempted)
            .arg(cap)
            .arg(self.ttl_secs())
            .arg(url)
            .invoke_async(&mut con)
            .await?;
        Ok(added == 1)
    }

    async fn add_pending_jobs(&self, crawl_id: Uuid, job_ids: &[Uuid]) -> Result<()> {
        let keys = CrawlKeys::new(crawl_id);
        self.add_to_set(&keys.jobs, job_ids).await
    }

    async fn mark_job_done(&self, crawl_id: Uuid, job_id: Uuid, success: bool) -> Result<bool> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let moved: i64 = MARK_DONE_SCRIPT
            .key(&keys.jobs)
            .key(&keys.jobs_done)
            .key(&keys.jobs_done_ordered)
            .key(&keys.jobs_failed)
            .arg(job_id.to_string())
            .arg(if success { "1" } else { "0" })
            .arg(self.ttl_secs())
            .invoke_async(&mut con)
            .await?;
        Ok(moved == 1)
    }

    async fn job_counts(&self, crawl_id: Uuid) -> Result<JobCounts> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let (total, done, failed): (u64, u64, u64) = redis::pipe()
            .atomic()
            .scard(&keys.jobs)
            .scard(&keys.jobs_done)
            .scard(&keys.jobs_failed)
            .query_async(&mut con)
            .await?;

        Ok(JobCounts {
            total,
            completed: done.saturating_sub(failed),
            failed,
        })
    }

    async fn completed_job_ids(&self, crawl_id: Uuid) -> Result<Vec<Uuid>> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let ids: Vec<String> = con.lrange(&keys.jobs_done_ordered, 0, -1).await?;
        Ok(ids.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect())
    }

    async fn mark_kickoff_finished(&self, crawl_id: Uuid) -> Result<()> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let _: () = con
            .set_ex(&keys.kickoff_finished, "yes", self.ttl_secs() as u64)
            .await?;
        Ok(())
    }

    async fn add_sitemap_jobs(&self, crawl_id: Uuid, job_ids: &[Uuid]) -> Result<()> {
        let keys = CrawlKeys::new(crawl_id);
        self.add_to_set(&keys.sitemap_jobs, job_ids).await
    }

    async fn mark_sitemap_job_done(&self, crawl_id: Uuid, job_id: Uuid) -> Result<()> {
        let keys = CrawlKeys::new(crawl_id);
        self.add_to_set(&keys.sitemap_jobs_done, &[job_id]).await
    }

    async fn discovery_finished(&self, crawl_id: Uuid) -> Result<bool> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let (kickoff_finished, spawned, done): (bool, u64, u64) = redis::pipe()
            .atomic()
            .exists(&keys.kickoff_finished)
            .scard(&keys.sitemap_jobs)
            .scard(&keys.sitemap_jobs_done)
            .query_async(&mut con)
            .await?;
        Ok(kickoff_finished && done >= spawned)
    }

    async fn claim_finish(&self, crawl_id: Uuid) -> Result<bool> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(&keys.finish)
            .arg("yes")
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(&mut con)
            .await?;
        Ok(set.is_some())
    }

    async fn is_finished(&self, crawl_id: Uuid) -> Result<bool> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let exists: bool = con.exists(&keys.finish).await?;
        Ok(exists)
    }

    async fn record_robots_blocked(
        &self,
        crawl_id: Uuid,
        urls: &[String],
        cap: usize,
        ttl: Duration,
    ) -> Result<usize> {
        if urls.is_empty() {
            return Ok(0);
        }
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let added: i64 = CAPPED_SADD_SCRIPT
            .key(&keys.robots_blocked)
            .arg(cap)
            .arg(ttl.as_secs().max(1))
            .arg(urls)
            .invoke_async(&mut con)
            .await?;
        Ok(added.max(0) as usize)
    }

    async fn robots_blocked(&self, crawl_id: Uuid) -> Result<Vec<String>> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let mut urls: Vec<String> = con.smembers(&keys.robots_blocked).await?;
        urls.sort();
        Ok(urls)
    }

    async fn purge_crawl(&self, crawl_id: Uuid) -> Result<()> {
        let keys = CrawlKeys::new(crawl_id);
        let mut con = self.con.clone();
        let removed: u64 = con.del(&keys.all()[..]).await?;
        debug!(crawl_id = %crawl_id, removed, "Purged crawl keys");
        Ok(())
    }
}
