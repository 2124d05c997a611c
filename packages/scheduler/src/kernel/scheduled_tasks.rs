//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! Periodic reconciliation of the concurrency ledger against the queue of
//! record. Runs independently of the worker loop.
//!
//! ```text
//! Scheduler (RECONCILE_CRON, default every 5 minutes)
//!     │
//!     └─► AdmissionControl.reconcile(None)
//!             └─► fix drift for every tracked team, promote backlog
//! ```

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::domains::concurrency::AdmissionControl;

/// Start all scheduled tasks
pub async fn start_scheduler(admission: AdmissionControl, reconcile_cron: &str) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let reconcile_job = Job::new_async(reconcile_cron, move |_uuid, _lock| {
        let admission = admission.clone();
        Box::pin(async move {
            if let Err(e) = run_reconcile(&admission).await {
                tracing::error!(error = %e, "scheduled reconciliation failed");
            }
        })
    })?;

    scheduler.add(reconcile_job).await?;
    scheduler.start().await?;

    tracing::info!(cron = %reconcile_cron, "scheduled tasks started (concurrency reconciliation)");
    Ok(scheduler)
}

async fn run_reconcile(admission: &AdmissionControl) -> Result<()> {
    let report = admission.reconcile(None).await?;
    tracing::debug!(
        ledgers = report.ledgers_checked,
        drift = report.drift(),
        promoted = report.promoted,
        "scheduled reconciliation complete"
    );
    Ok(())
}
