//! Concurrency ledger contract.
//!
//! Per team and pool the ledger keeps an *active* lease set (job id to lease
//! expiry) and a *backlog* ordered by priority, then arrival. Expired leases
//! are dropped before every capacity check, so a crashed holder frees its
//! slot once the lease runs out.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::AdmissionResult;
use crate::kernel::jobs::JobPool;

/// Identifies one team's ledger within a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub team_id: String,
    pub pool: JobPool,
}

impl LedgerKey {
    pub fn new(team_id: impl Into<String>, pool: JobPool) -> Self {
        Self {
            team_id: team_id.into(),
            pool,
        }
    }
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.pool, self.team_id)
    }
}

#[async_trait]
pub trait ConcurrencyLedger: Send + Sync {
    /// Take a slot for `job_id` if fewer than `limit` unexpired leases exist.
    /// Re-acquiring a held slot refreshes its lease.
    async fn try_acquire(&self, key: &LedgerKey, job_id: Uuid, limit: usize, lease: Duration)
        -> AdmissionResult<bool>;

    /// Extend an existing lease. `false` if the job holds no slot.
    async fn renew_lease(&self, key: &LedgerKey, job_id: Uuid, lease: Duration) -> AdmissionResult<bool>;

    async fn release(&self, key: &LedgerKey, job_id: Uuid) -> AdmissionResult<bool>;

    async fn active_count(&self, key: &LedgerKey) -> AdmissionResult<usize>;

    async fn active_job_ids(&self, key: &LedgerKey) -> AdmissionResult<Vec<Uuid>>;

    /// Park `job_id`. `false` if it is already in the backlog.
    async fn push_backlog(
        &self,
        key: &LedgerKey,
        job_id: Uuid,
        priority: i32,
        arrival: DateTime<Utc>,
    ) -> AdmissionResult<bool>;

    /// Atomically move the best backlog entry into the active set if a slot
    /// is free.
    async fn promote_next(&self, key: &LedgerKey, limit: usize, lease: Duration)
        -> AdmissionResult<Option<Uuid>>;

    /// Backlog in promotion order.
    async fn backlog_job_ids(&self, key: &LedgerKey) -> AdmissionResult<Vec<Uuid>>;

    async fn remove_backlog(&self, key: &LedgerKey, job_id: Uuid) -> AdmissionResult<bool>;

    /// Teams that ever used the pool.
    async fn teams(&self, pool: JobPool) -> AdmissionResult<Vec<String>>;
}
