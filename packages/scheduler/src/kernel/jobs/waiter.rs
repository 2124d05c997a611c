//! Waiting for a job to reach a terminal state.
//!
//! A finished-notification subscription races a periodic poll. The job is
//! re-checked once right after subscribing so a notification sent between
//! the caller's decision to wait and the subscription is never missed. Both
//! sides are dropped as soon as one resolves.

use std::time::Duration;

use futures::StreamExt;
use tracing::debug;
use uuid::Uuid;

use super::error::{QueueError, QueueResult};
use super::job::{Job, JobStatus};
use super::queue::JobQueue;

pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Wait for `id` to finish, polling at [`DEFAULT_WAIT_POLL_INTERVAL`].
pub async fn wait_for_job(queue: &dyn JobQueue, id: Uuid, timeout: Duration) -> QueueResult<Job> {
    wait_for_job_with_poll(queue, id, timeout, DEFAULT_WAIT_POLL_INTERVAL).await
}

/// Wait for `id` to finish.
///
/// Resolves with the completed job, `JobFailed` if it failed, `NotFound` if
/// the row disappears, or `WaitTimeout` after `timeout`.
pub async fn wait_for_job_with_poll(
    queue: &dyn JobQueue,
    id: Uuid,
    timeout: Duration,
    poll_interval: Duration,
) -> QueueResult<Job> {
    match tokio::time::timeout(timeout, wait_inner(queue, id, poll_interval)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(job_id = %id, ?timeout, "wait for job timed out");
            Err(QueueError::WaitTimeout(id))
        }
    }
}

async fn wait_inner(queue: &dyn JobQueue, id: Uuid, poll_interval: Duration) -> QueueResult<Job> {
    let mut finished = queue.subscribe_finished().await?;

    if let Some(result) = check(queue, id).await? {
        return result;
    }

    let mut poll = tokio::time::interval(poll_interval);
    poll.tick().await; // Skip first immediate tick
    let mut subscribed = true;

    loop {
        tokio::select! {
            next = finished.next(), if subscribed => match next {
                Some(finished_id) if finished_id == id => {}
                Some(_) => continue,
                None => {
                    // Subscription dropped; keep polling
                    subscribed = false;
                    continue;
                }
            },
            _ = poll.tick() => {}
        }

        if let Some(result) = check(queue, id).await? {
            return result;
        }
    }
}

/// `Some` once the wait can resolve.
async fn check(queue: &dyn JobQueue, id: Uuid) -> QueueResult<Option<QueueResult<Job>>> {
    let Some(job) = queue.get_job(id).await? else {
        return Ok(Some(Err(QueueError::NotFound(id))));
    };

    Ok(match job.status {
        JobStatus::Completed => Some(Ok(job)),
        JobStatus::Failed => Some(Err(QueueError::JobFailed {
            id,
            reason: job.failed_reason.unwrap_or_default(),
        })),
        JobStatus::Queued | JobStatus::Active => None,
    })
}
