//! Redis-backed concurrency ledger.
//!
//! Key layout per pool and team:
//! - `concurrency:{pool}:active:{team}` sorted set, score = lease expiry (ms)
//! - `concurrency:{pool}:backlog:{team}` sorted set, score = priority,
//!   member = `{arrival ms, 13 digits}:{job id}` so ties break by arrival
//! - `concurrency:{pool}:backlog_members:{team}` hash, job id -> member
//! - `concurrency:{pool}:teams` set of team ids

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use super::error::{AdmissionError, AdmissionResult};
use super::ledger::{ConcurrencyLedger, LedgerKey};
use crate::kernel::jobs::JobPool;

/// Width of the arrival prefix plus the separator.
const MEMBER_PREFIX_LEN: usize = 14;

/// KEYS: active, teams. ARGV: now, job id, limit, expiry, team.
static TRY_ACQUIRE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        if not redis.call('ZSCORE', KEYS[1], ARGV[2]) then
            if redis.call('ZCARD', KEYS[1]) >= tonumber(ARGV[3]) then
                return 0
            end
        end
        redis.call('ZADD', KEYS[1], ARGV[4], ARGV[2])
        redis.call('SADD', KEYS[2], ARGV[5])
        return 1
        ",
    )
});

/// KEYS: active. ARGV: job id, expiry.
static RENEW_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
            return 0
        end
        redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
        return 1
        ",
    )
});

/// KEYS: backlog, members, teams. ARGV: job id, priority, member, team.
static PUSH_BACKLOG_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 1 then
            return 0
        end
        redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
        redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
        redis.call('SADD', KEYS[3], ARGV[4])
        return 1
        ",
    )
});

/// KEYS: active, backlog, members. ARGV: now, limit, expiry.
static PROMOTE_NEXT_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        if redis.call('ZCARD', KEYS[1]) >= tonumber(ARGV[2]) then
            return false
        end
        local popped = redis.call('ZPOPMIN', KEYS[2])
        if #popped == 0 then
            return false
        end
        local job = string.sub(popped[1], 15)
        redis.call('HDEL', KEYS[3], job)
        redis.call('ZADD', KEYS[1], ARGV[3], job)
        return job
        ",
    )
});

/// KEYS: backlog, members. ARGV: job id.
static REMOVE_BACKLOG_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local member = redis.call('HGET', KEYS[2], ARGV[1])
        if not member then
            return 0
        end
        redis.call('ZREM', KEYS[1], member)
        redis.call('HDEL', KEYS[2], ARGV[1])
        return 1
        ",
    )
});

struct LedgerKeys {
    active: String,
    backlog: String,
    members: String,
    teams: String,
}

impl LedgerKeys {
    fn new(key: &LedgerKey) -> Self {
        let base = format!("concurrency:{}", key.pool);
        Self {
            active: format!("{base}:active:{}", key.team_id),
            backlog: format!("{base}:backlog:{}", key.team_id),
            members: format!("{base}:backlog_members:{}", key.team_id),
            teams: teams_key(key.pool),
        }
    }
}

fn teams_key(pool: JobPool) -> String {
    format!("concurrency:{pool}:teams")
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(lease: Duration) -> i64 {
    now_ms().saturating_add(lease.as_millis().min(i64::MAX as u128) as i64)
}

fn backlog_member(job_id: Uuid, arrival: DateTime<Utc>) -> String {
    format!("{:013}:{}", arrival.timestamp_millis().max(0), job_id)
}

fn parse_job_id(raw: &str) -> AdmissionResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| AdmissionError::Ledger(format!("bad job id {raw:?}: {e}")))
}

fn parse_member(member: &str) -> AdmissionResult<Uuid> {
    let raw = member
        .get(MEMBER_PREFIX_LEN..)
        .ok_or_else(|| AdmissionError::Ledger(format!("bad backlog member {member:?}")))?;
    parse_job_id(raw)
}

/// Redis-backed concurrency ledger.
#[derive(Clone)]
pub struct RedisConcurrencyLedger {
    con: MultiplexedConnection,
}

impl RedisConcurrencyLedger {
    pub fn new(con: MultiplexedConnection) -> Self {
        Self { con }
    }

    pub async fn connect(url: &str) -> AdmissionResult<Self> {
        let client = redis::Client::open(url)?;
        let con = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(con))
    }
}

#[async_trait]
impl ConcurrencyLedger for RedisConcurrencyLedger {
    async fn try_acquire(
        &self,
        key: &LedgerKey,
        job_id: Uuid,
        limit: usize,
        lease: Duration,
    ) -> AdmissionResult<bool> {
        let keys = LedgerKeys::new(key);
        let mut con = self.con.clone();
        let acquired: i64 = TRY_ACQUIRE_SCRIPT
            .key(&keys.active)
            .key(&keys.teams)
            .arg(now_ms())
            .arg(job_id.to_string())
            .arg(limit)
            .arg(expiry_ms(lease))
            .arg(&key.team_id)
            .invoke_async(&mut con)
            .await?;
        Ok(acquired == 1)
    }

    async fn renew_lease(&self, key: &LedgerKey, job_id: Uuid, lease: Duration) -> AdmissionResult<bool> {
        let keys = LedgerKeys::new(key);
        let mut con = self.con.clone();
        let renewed: i64 = RENEW_SCRIPT
            .key(&keys.active)
            .arg(job_id.to_string())
            .arg(expiry_ms(lease))
            .invoke_async(&mut con)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &LedgerKey, job_id: Uuid) -> AdmissionResult<bool> {
        let keys = LedgerKeys::new(key);
        let mut con = self.con.clone();
        let removed: i64 = con.zrem(&keys.active, job_id.to_string()).await?;
        Ok(removed > 0)
    }

    async fn active_count(&self, key: &LedgerKey) -> AdmissionResult<usize> {
        let keys = LedgerKeys::new(key);
        let mut con = self.con.clone();
        let (_, count): (i64, usize) = redis::pipe()
            .atomic()
            .zrembyscore(&keys.active, "-inf", now_ms())
            .zcard(&keys.active)
            .query_async(&mut con)
            .await?;
        Ok(count)
    }

    async fn active_job_ids(&self, key: &LedgerKey) -> AdmissionResult<Vec<Uuid>> {
        let keys = LedgerKeys::new(key);
        let mut con = self.con.clone();
        let (_, members): (i64, Vec<String>) = redis::pipe()
            .atomic()
            .zrembyscore(&keys.active, "-inf", now_ms())
            .zrange(&keys.active, 0, -1)
            .query_async(&mut con)
            .await?;
        members.iter().map(|m| parse_job_id(m)).collect()
    }

    async fn push_backlog(
        &self,
        key: &LedgerKey,
        job_id: Uuid,
        priority: i32,
        arrival: DateTime<Utc>,
    ) -> AdmissionResult<bool> {
        let keys = LedgerKeys::new(key);
        let mut con = self.con.clone();
        let pushed: i64 = PUSH_BACKLOG_SCRIPT
            .key(&keys.backlog)
            .key(&keys.members)
            .key(&keys.teams)
            .arg(job_id.to_string())
            .arg(priority)
            .arg(backlog_member(job_id, arrival))
            .arg(&key.team_id)
            .invoke_async(&mut con)
            .await?;
        Ok(pushed == 1)
    }

    async fn promote_next(
        &self,
        key: &LedgerKey,
        limit: usize,
        lease: Duration,
    ) -> AdmissionResult<Option<Uuid>> {
        let keys = LedgerKeys::new(key);
        let mut con = self.con.clone();
        let promoted: Option<String> = PROMOTE_NEXT_SCRIPT
            .key(&keys.active)
            .key(&keys.backlog)
            .key(&keys.members)
            .arg(now_ms())
            .arg(limit)
            .arg(expiry_ms(lease))
            .invoke_async(&mut con)
            .await?;
        promoted.as_deref().map(parse_job_id).transpose()
    }

    async fn backlog_job_ids(&self, key: &LedgerKey) -> AdmissionResult<Vec<Uuid>> {
        let keys = LedgerKeys::new(key);
        let mut con = self.con.clone();
        let members: Vec<String> = con.zrange(&keys.backlog, 0, -1).await?;
        members.iter().map(|m| parse_member(m)).collect()
    }

    async fn remove_backlog(&self, key: &LedgerKey, job_id: Uuid) -> AdmissionResult<bool> {
        let keys = LedgerKeys::new(key);
        let mut con = self.con.clone();
        let removed: i64 = REMOVE_BACKLOG_SCRIPT
            .key(&keys.backlog)
            .key(&keys.members)
            .arg(job_id.to_string())
            .invoke_async(&mut con)
            .await?;
        Ok(removed == 1)
    }

    async fn teams(&self, pool: JobPool) -> AdmissionResult<Vec<String>> {
        let mut con = self.con.clone();
        let mut teams: Vec<String> = con.smembers(teams_key(pool)).await?;
        teams.sort();
        Ok(teams)
    }
}
