//! Job infrastructure for background execution.
//!
//! This module provides the kernel-level infrastructure for job execution:
//! - [`JobQueue`] - Claim-leased priority queue contract
//! - [`PostgresJobQueue`] - Database-backed queue of record
//! - [`MemoryJobQueue`] - In-process queue for tests and local runs
//! - [`JobWorker`] - Long-running service that claims and executes jobs
//! - [`StallReaper`] - Requeues or fails jobs whose lease went stale
//! - [`wait_for_job`] - Await a job's terminal state
//!
//! # Architecture
//!
//! ```text
//! Producer
//!     └─► add_job(id, data, priority)            queued
//!
//! JobWorker
//!     ├─► get_job_to_process(token)               active, locked
//!     ├─► renew_lock(id, token)  (heartbeat)
//!     └─► job_finish / job_fail(id, token)        completed | failed
//!             └─► notify job_finished(id) ─► wait_for_job
//!
//! StallReaper
//!     ├─► stale lease, stalls < budget            queued, stalls += 1
//!     ├─► stale lease, stalls >= budget           failed
//!     └─► prune terminal rows past their TTL
//! ```
//!
//! Domain-specific handlers live in their respective domains.

mod error;
mod job;
mod memory;
mod queue;
mod reaper;
mod waiter;
mod worker;

pub use error::{QueueError, QueueResult};
pub use job::{BacklogEntry, Job, JobPool, JobStatus, LiveJob, NewJob, ReapReport, StatusCounts};
pub use memory::MemoryJobQueue;
pub use queue::{JobQueue, PostgresJobQueue, JOB_FINISHED_CHANNEL, STALLED_FAILURE_REASON};
pub use reaper::{QueueConfig, StallReaper};
pub use waiter::{wait_for_job, wait_for_job_with_poll, DEFAULT_WAIT_POLL_INTERVAL};
pub use worker::{
    JobHandler, JobLifecycle, JobOutcome, JobWorker, JobWorkerConfig, NoopLifecycle, GENERIC_FAILURE_REASON,
};
