//! Per-team admission control in front of the job queue.
//!
//! A job either takes a slot in its team's active set and goes straight to
//! the queue, or is parked in backlog storage (queue side) and in the ledger
//! backlog (coordination side). Freed capacity promotes backlog entries in
//! priority, then arrival order. `reconcile` repairs drift between the ledger
//! and the queue of record.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::AdmissionResult;
use super::ledger::{ConcurrencyLedger, LedgerKey};
use super::limits::ConcurrencyLimits;
use crate::kernel::jobs::{Job, JobPool, JobQueue, JobStatus, NewJob};

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub limits: ConcurrencyLimits,
    /// Lease TTL of an active slot; workers renew it while the job runs
    pub lease: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            limits: ConcurrencyLimits::default(),
            lease: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AdmissionOutcome {
    /// In the queue with an active slot
    Admitted(Job),
    /// Parked until the team has capacity
    Backlogged { job_id: Uuid },
}

impl AdmissionOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            AdmissionOutcome::Admitted(job) => job.id,
            AdmissionOutcome::Backlogged { job_id } => *job_id,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionOutcome::Admitted(_))
    }
}

/// Drift repaired by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub ledgers_checked: usize,
    /// Backlogged in storage but missing from the ledger backlog
    pub backlog_added: usize,
    /// In the ledger backlog but gone from storage
    pub backlog_removed: usize,
    /// Live in the queue but holding no slot
    pub active_added: usize,
    /// Queued past the limit and moved back to the backlog
    pub demoted: usize,
    /// Holding a slot for a job that is no longer live
    pub active_released: usize,
    pub promoted: usize,
}

impl ReconcileReport {
    pub fn drift(&self) -> usize {
        self.backlog_added + self.backlog_removed + self.active_added + self.active_released + self.demoted
    }

    fn merge(&mut self, other: ReconcileReport) {
        self.ledgers_checked += other.ledgers_checked;
        self.backlog_added += other.backlog_added;
        self.backlog_removed += other.backlog_removed;
        self.active_added += other.active_added;
        self.demoted += other.demoted;
        self.active_released += other.active_released;
        self.promoted += other.promoted;
    }
}

#[derive(Debug, Default)]
struct SlotSync {
    adopted: usize,
    demoted: usize,
}

#[derive(Clone)]
pub struct AdmissionControl {
    queue: Arc<dyn JobQueue>,
    ledger: Arc<dyn ConcurrencyLedger>,
    config: AdmissionConfig,
}

impl AdmissionControl {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        ledger: Arc<dyn ConcurrencyLedger>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            queue,
            ledger,
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn ConcurrencyLedger> {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    fn limit(&self, key: &LedgerKey) -> usize {
        self.config.limits.limit_for(&key.team_id, key.pool)
    }

    /// Admit `job` into the queue or park it in the team backlog.
    pub async fn check_admission(&self, job: NewJob) -> AdmissionResult<AdmissionOutcome> {
        let key = LedgerKey::new(job.team_id.clone(), job.pool);
        let job_id = job.id;

        if self
            .ledger
            .try_acquire(&key, job_id, self.limit(&key), self.config.lease)
            .await?
        {
            return match self.queue.add_job(job).await {
                Ok(added) => {
                    debug!(job_id = %job_id, team_id = %key.team_id, pool = %key.pool, "job admitted");
                    Ok(AdmissionOutcome::Admitted(added))
                }
                Err(e) => {
                    self.ledger.release(&key, job_id).await?;
                    Err(e.into())
                }
            };
        }

        let (priority, arrival) = (job.priority, job.created_at);
        self.queue.add_backlog_job(job).await?;
        self.ledger
            .push_backlog(&key, job_id, priority, arrival)
            .await?;
        debug!(job_id = %job_id, team_id = %key.team_id, pool = %key.pool, "job backlogged");

        // A slot may have freed between the acquire and the push
        self.on_capacity_freed(&key.team_id, key.pool).await?;

        Ok(AdmissionOutcome::Backlogged { job_id })
    }

    /// Promote backlog entries until the team is full or the backlog empty.
    /// Returns the promoted job ids.
    ///
    /// Slots of jobs still live in the queue are re-held first, so a queued
    /// job whose lease ran out is never counted as free capacity.
    pub async fn on_capacity_freed(&self, team_id: &str, pool: JobPool) -> AdmissionResult<Vec<Uuid>> {
        let key = LedgerKey::new(team_id, pool);
        self.hold_live_slots(&key).await?;
        self.promote_backlog(&key).await
    }

    async fn promote_backlog(&self, key: &LedgerKey) -> AdmissionResult<Vec<Uuid>> {
        let limit = self.limit(key);
        let mut promoted = Vec::new();

        while let Some(job_id) = self
            .ledger
            .promote_next(key, limit, self.config.lease)
            .await?
        {
            match self.queue.promote_backlog_job(job_id).await? {
                Some(_) => promoted.push(job_id),
                None => {
                    let live = self
                        .queue
                        .get_job(job_id)
                        .await?
                        .is_some_and(|job| !job.status.is_terminal());
                    if !live {
                        warn!(job_id = %job_id, team_id = %key.team_id, "backlog entry missing from storage");
                        self.ledger.release(key, job_id).await?;
                    }
                }
            }
        }

        if !promoted.is_empty() {
            debug!(team_id = %key.team_id, pool = %key.pool, count = promoted.len(), "promoted backlog jobs");
        }
        Ok(promoted)
    }

    /// Make every queued or active job hold a slot with a fresh lease.
    ///
    /// Active jobs are already running and are always counted. A queued job
    /// that cannot get a slot within the limit goes back to the backlog.
    async fn hold_live_slots(&self, key: &LedgerKey) -> AdmissionResult<SlotSync> {
        let limit = self.limit(key);
        let mut sync = SlotSync::default();

        for job in self.queue.live_jobs(&key.team_id, key.pool).await? {
            if self.ledger.renew_lease(key, job.id, self.config.lease).await? {
                continue;
            }

            let running = job.status == JobStatus::Active;
            let cap = if running { usize::MAX } else { limit };
            if self.ledger.try_acquire(key, job.id, cap, self.config.lease).await? {
                if self.still_live(job.id).await? {
                    sync.adopted += 1;
                } else {
                    self.ledger.release(key, job.id).await?;
                }
                continue;
            }

            if self.queue.demote_queued_job(job.id).await? {
                self.ledger
                    .push_backlog(key, job.id, job.priority, job.created_at)
                    .await?;
                sync.demoted += 1;
                debug!(job_id = %job.id, team_id = %key.team_id, pool = %key.pool, "queued job returned to backlog");
            } else if self.still_live(job.id).await? {
                // Claimed between the listing and the demotion
                self.ledger
                    .try_acquire(key, job.id, usize::MAX, self.config.lease)
                    .await?;
                sync.adopted += 1;
            }
        }

        if sync.adopted > 0 || sync.demoted > 0 {
            warn!(
                team_id = %key.team_id,
                pool = %key.pool,
                adopted = sync.adopted,
                demoted = sync.demoted,
                "live jobs were missing concurrency slots"
            );
        }
        Ok(sync)
    }

    async fn still_live(&self, job_id: Uuid) -> AdmissionResult<bool> {
        Ok(self
            .queue
            .get_job(job_id)
            .await?
            .is_some_and(|job| !job.status.is_terminal()))
    }

    /// Heartbeat for a running job's slot.
    pub async fn renew_active_lease(
        &self,
        team_id: &str,
        pool: JobPool,
        job_id: Uuid,
        ttl: Duration,
    ) -> AdmissionResult<bool> {
        let key = LedgerKey::new(team_id, pool);
        let renewed = self.ledger.renew_lease(&key, job_id, ttl).await?;
        if !renewed {
            debug!(job_id = %job_id, team_id = %team_id, "no active lease to renew");
        }
        Ok(renewed)
    }

    /// Free a finished job's slot and promote from the backlog.
    pub async fn release(&self, team_id: &str, pool: JobPool, job_id: Uuid) -> AdmissionResult<Vec<Uuid>> {
        let key = LedgerKey::new(team_id, pool);
        self.ledger.release(&key, job_id).await?;
        self.on_capacity_freed(team_id, pool).await
    }

    /// Promote for every team known to the ledger. Picks up slots freed by
    /// expired leases.
    pub async fn promote_all(&self) -> AdmissionResult<usize> {
        let mut promoted = 0;
        for pool in JobPool::ALL {
            for team_id in self.ledger.teams(pool).await? {
                promoted += self.on_capacity_freed(&team_id, pool).await?.len();
            }
        }
        Ok(promoted)
    }

    /// Compare backlog storage, the ledger backlog and the active set against
    /// the queue, fix drift both ways, then promote. `None` checks every team.
    pub async fn reconcile(&self, team_id: Option<&str>) -> AdmissionResult<ReconcileReport> {
        let keys = self.reconcile_targets(team_id).await?;
        let mut report = ReconcileReport::default();
        for key in keys {
            report.merge(self.reconcile_key(&key).await?);
        }

        if report.drift() > 0 {
            info!(
                team_id = team_id.unwrap_or("*"),
                backlog_added = report.backlog_added,
                backlog_removed = report.backlog_removed,
                active_added = report.active_added,
                demoted = report.demoted,
                active_released = report.active_released,
                promoted = report.promoted,
                "reconciled concurrency drift"
            );
        } else {
            debug!(team_id = team_id.unwrap_or("*"), ledgers = report.ledgers_checked, "no concurrency drift");
        }
        Ok(report)
    }

    async fn reconcile_targets(&self, team_id: Option<&str>) -> AdmissionResult<BTreeSet<LedgerKey>> {
        let mut keys = BTreeSet::new();
        match team_id {
            Some(team_id) => {
                for pool in JobPool::ALL {
                    keys.insert(LedgerKey::new(team_id, pool));
                }
            }
            None => {
                for (team_id, pool) in self.queue.tracked_teams().await? {
                    keys.insert(LedgerKey::new(team_id, pool));
                }
                for pool in JobPool::ALL {
                    for team_id in self.ledger.teams(pool).await? {
                        keys.insert(LedgerKey::new(team_id, pool));
                    }
                }
            }
        }
        Ok(keys)
    }

    async fn reconcile_key(&self, key: &LedgerKey) -> AdmissionResult<ReconcileReport> {
        let mut report = ReconcileReport {
            ledgers_checked: 1,
            ..Default::default()
        };

        // Backlog: storage is the record
        let stored = self.queue.backlog_entries(&key.team_id, key.pool).await?;
        let stored_ids: HashSet<Uuid> = stored.iter().map(|e| e.id).collect();
        let ledger_backlog: HashSet<Uuid> = self.ledger.backlog_job_ids(key).await?.into_iter().collect();

        for entry in stored.iter().filter(|e| !ledger_backlog.contains(&e.id)) {
            if self
                .ledger
                .push_backlog(key, entry.id, entry.priority, entry.created_at)
                .await?
            {
                report.backlog_added += 1;
            }
        }
        for job_id in ledger_backlog.difference(&stored_ids) {
            if self.ledger.remove_backlog(key, *job_id).await? {
                report.backlog_removed += 1;
            }
        }

        // Active set: queued or active jobs are the record
        let live: HashSet<Uuid> = self
            .queue
            .live_jobs(&key.team_id, key.pool)
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect();
        for job_id in self.ledger.active_job_ids(key).await? {
            if !live.contains(&job_id) && self.ledger.release(key, job_id).await? {
                report.active_released += 1;
            }
        }

        let sync = self.hold_live_slots(key).await?;
        report.active_added = sync.adopted;
        report.demoted = sync.demoted;
        report.promoted = self.promote_backlog(key).await?.len();
        Ok(report)
    }
}
