//! In-memory concurrency ledger for tests and local runs.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::AdmissionResult;
use super::ledger::{ConcurrencyLedger, LedgerKey};
use crate::kernel::jobs::JobPool;

#[derive(Default)]
struct TeamLedger {
    /// job id -> lease expiry
    active: HashMap<Uuid, DateTime<Utc>>,
    /// (priority, arrival ms, job id)
    backlog: BTreeSet<(i32, i64, Uuid)>,
}

impl TeamLedger {
    fn prune(&mut self, now: DateTime<Utc>) {
        self.active.retain(|_, expiry| *expiry > now);
    }

    fn backlog_entry(&self, job_id: Uuid) -> Option<(i32, i64, Uuid)> {
        self.backlog.iter().find(|(_, _, id)| *id == job_id).copied()
    }
}

fn expiry(lease: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::days(365))
}

#[derive(Default)]
pub struct MemoryConcurrencyLedger {
    ledgers: RwLock<HashMap<LedgerKey, TeamLedger>>,
}

impl MemoryConcurrencyLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConcurrencyLedger for MemoryConcurrencyLedger {
    async fn try_acquire(
        &self,
        key: &LedgerKey,
        job_id: Uuid,
        limit: usize,
        lease: Duration,
    ) -> AdmissionResult<bool> {
        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers.entry(key.clone()).or_default();
        ledger.prune(Utc::now());

        if !ledger.active.contains_key(&job_id) && ledger.active.len() >= limit {
            return Ok(false);
        }
        ledger.active.insert(job_id, expiry(lease));
        Ok(true)
    }

    async fn renew_lease(&self, key: &LedgerKey, job_id: Uuid, lease: Duration) -> AdmissionResult<bool> {
        let mut ledgers = self.ledgers.write().await;
        let Some(ledger) = ledgers.get_mut(key) else {
            return Ok(false);
        };
        match ledger.active.get_mut(&job_id) {
            Some(current) => {
                *current = expiry(lease);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, key: &LedgerKey, job_id: Uuid) -> AdmissionResult<bool> {
        let mut ledgers = self.ledgers.write().await;
        Ok(ledgers
            .get_mut(key)
            .is_some_and(|ledger| ledger.active.remove(&job_id).is_some()))
    }

    async fn active_count(&self, key: &LedgerKey) -> AdmissionResult<usize> {
        Ok(self.active_job_ids(key).await?.len())
    }

    async fn active_job_ids(&self, key: &LedgerKey) -> AdmissionResult<Vec<Uuid>> {
        let mut ledgers = self.ledgers.write().await;
        let Some(ledger) = ledgers.get_mut(key) else {
            return Ok(Vec::new());
        };
        ledger.prune(Utc::now());
        Ok(ledger.active.keys().copied().collect())
    }

    async fn push_backlog(
        &self,
        key: &LedgerKey,
        job_id: Uuid,
        priority: i32,
        arrival: DateTime<Utc>,
    ) -> AdmissionResult<bool> {
        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers.entry(key.clone()).or_default();
        if ledger.backlog_entry(job_id).is_some() {
            return Ok(false);
        }
        ledger
            .backlog
            .insert((priority, arrival.timestamp_millis(), job_id));
        Ok(true)
    }

    async fn promote_next(
        &self,
        key: &LedgerKey,
        limit: usize,
        lease: Duration,
    ) -> AdmissionResult<Option<Uuid>> {
        let mut ledgers = self.ledgers.write().await;
        let Some(ledger) = ledgers.get_mut(key) else {
            return Ok(None);
        };
        ledger.prune(Utc::now());
        if ledger.active.len() >= limit {
            return Ok(None);
        }
        let Some((_, _, job_id)) = ledger.backlog.pop_first() else {
            return Ok(None);
        };
        ledger.active.insert(job_id, expiry(lease));
        Ok(Some(job_id))
    }

    async fn backlog_job_ids(&self, key: &LedgerKey) -> AdmissionResult<Vec<Uuid>> {
        let ledgers = self.ledgers.read().await;
        Ok(ledgers
            .get(key)
            .map(|ledger| ledger.backlog.iter().map(|(_, _, id)| *id).collect())
            .unwrap_or_default())
    }

    async fn remove_backlog(&self, key: &LedgerKey, job_id: Uuid) -> AdmissionResult<bool> {
        let mut ledgers = self.ledgers.write().await;
        let Some(ledger) = ledgers.get_mut(key) else {
            return Ok(false);
        };
        match ledger.backlog_entry(job_id) {
            Some(entry) => Ok(ledger.backlog.remove(&entry)),
            None => Ok(false),
        }
    }

    async fn teams(&self, pool: JobPool) -> AdmissionResult<Vec<String>> {
        let ledgers = self.ledgers.read().await;
        let mut teams: Vec<String> = ledgers
            .keys()
            .filter(|key| key.pool == pool)
            .map(|key| key.team_id.clone())
            .collect();
        teams.sort();
        Ok(teams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_respects_limit_and_reacquire_is_idempotent() {
        let ledger = MemoryConcurrencyLedger::new();
        let key = LedgerKey::new("t", JobPool::Scrape);
        let lease = Duration::from_secs(60);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(ledger.try_acquire(&key, a, 1, lease).await.unwrap());
        assert!(ledger.try_acquire(&key, a, 1, lease).await.unwrap());
        assert!(!ledger.try_acquire(&key, b, 1, lease).await.unwrap());
        assert_eq!(ledger.active_count(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_frees_slot() {
        let ledger = MemoryConcurrencyLedger::new();
        let key = LedgerKey::new("t", JobPool::Scrape);

        assert!(ledger
            .try_acquire(&key, Uuid::new_v4(), 1, Duration::ZERO)
            .await
            .unwrap());
        assert!(ledger
            .try_acquire(&key, Uuid::new_v4(), 1, Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_backlog_orders_by_priority_then_arrival() {
        let ledger = MemoryConcurrencyLedger::new();
        let key = LedgerKey::new("t", JobPool::Scrape);
        let now = Utc::now();
        let (late_urgent, early, late) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        ledger
            .push_backlog(&key, late, 5, now + chrono::Duration::seconds(2))
            .await
            .unwrap();
        ledger.push_backlog(&key, early, 5, now).await.unwrap();
        ledger
            .push_backlog(&key, late_urgent, 1, now + chrono::Duration::seconds(3))
            .await
            .unwrap();
        assert!(!ledger.push_backlog(&key, early, 5, now).await.unwrap());

        assert_eq!(
            ledger.backlog_job_ids(&key).await.unwrap(),
            vec![late_urgent, early, late]
        );

        let lease = Duration::from_secs(60);
        assert_eq!(ledger.promote_next(&key, 2, lease).await.unwrap(), Some(late_urgent));
        assert_eq!(ledger.promote_next(&key, 2, lease).await.unwrap(), Some(early));
        assert_eq!(ledger.promote_next(&key, 2, lease).await.unwrap(), None);
    }
}
