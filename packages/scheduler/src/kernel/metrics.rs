//! Operational metrics feed.
//!
//! Queue depth by status, per-team backlog size and active-lease counts,
//! served as JSON and logged on an interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domains::concurrency::{AdmissionControl, LedgerKey};
use crate::kernel::jobs::{JobPool, JobQueue, StatusCounts};
use crate::kernel::service_host::Service;

#[derive(Debug, Clone, Serialize)]
pub struct TeamMetrics {
    pub team_id: String,
    pub pool: JobPool,
    pub active_leases: usize,
    pub backlog: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub collected_at: DateTime<Utc>,
    pub queue: StatusCounts,
    pub teams: Vec<TeamMetrics>,
}

impl MetricsSnapshot {
    pub async fn collect(queue: &dyn JobQueue, admission: &AdmissionControl) -> Result<Self> {
        let counts = queue.status_counts().await?;
        let ledger = admission.ledger();

        let mut teams = Vec::new();
        for pool in JobPool::ALL {
            for team_id in ledger.teams(pool).await? {
                let key = LedgerKey::new(team_id, pool);
                let active_leases = ledger.active_count(&key).await?;
                let backlog = ledger.backlog_job_ids(&key).await?.len();
                if active_leases == 0 && backlog == 0 {
                    continue;
                }
                teams.push(TeamMetrics {
                    limit: admission.config().limits.limit_for(&key.team_id, pool),
                    team_id: key.team_id,
                    pool,
                    active_leases,
                    backlog,
                });
            }
        }

        Ok(Self {
            collected_at: Utc::now(),
            queue: counts,
            teams,
        })
    }
}

/// Logs a metrics snapshot on an interval.
pub struct MetricsReporter {
    queue: Arc<dyn JobQueue>,
    admission: AdmissionControl,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(queue: Arc<dyn JobQueue>, admission: AdmissionControl, interval: Duration) -> Self {
        Self {
            queue,
            admission,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl Service for MetricsReporter {
    fn name(&self) -> &'static str {
        "metrics-reporter"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match MetricsSnapshot::collect(self.queue.as_ref(), &self.admission).await {
                        Ok(snapshot) => info!(
                            queued = snapshot.queue.queued,
                            active = snapshot.queue.active,
                            completed = snapshot.queue.completed,
                            failed = snapshot.queue.failed,
                            backlog = snapshot.queue.backlog,
                            busy_teams = snapshot.teams.len(),
                            "queue metrics"
                        ),
                        Err(e) => error!(error = %e, "failed to collect metrics"),
                    }
                }
            }
        }
        Ok(())
    }
}
