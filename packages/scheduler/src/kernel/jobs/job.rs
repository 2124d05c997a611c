//! Job model for the claim-leased queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Concurrency pool a job is admitted under. Each team has a separate limit
/// per pool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "job_pool", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPool {
    #[default]
    Scrape,
    Extract,
}

impl JobPool {
    pub const ALL: [JobPool; 2] = [JobPool::Scrape, JobPool::Extract];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPool::Scrape => "scrape",
            JobPool::Extract => "extract",
        }
    }
}

impl std::fmt::Display for JobPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobPool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrape" => Ok(JobPool::Scrape),
            "extract" => Ok(JobPool::Extract),
            other => Err(format!("unknown job pool: {other}")),
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// A queue row.
///
/// Only the holder of `lock_token` may move an active job to a terminal
/// state; the stall reaper is the one exception.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub team_id: String,
    pub pool: JobPool,
    pub status: JobStatus,
    pub data: serde_json::Value,
    /// Lower is more urgent
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub lock_token: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Number of times the reaper reclaimed this job
    pub stalls: i32,
    pub finished_at: Option<DateTime<Utc>>,
    pub return_value: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    /// Set once the terminal hook ran to completion
    pub settled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Deserialize the payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone())
    }
}

/// A job as submitted by a producer. The id is chosen by the producer so it
/// can be handed back before the job runs.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    pub team_id: String,
    #[builder(default)]
    pub pool: JobPool,
    #[builder(default = serde_json::Value::Object(Default::default()))]
    pub data: serde_json::Value,
    #[builder(default = 10)]
    pub priority: i32,
    /// Preserved when a backlogged job is promoted
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    /// Row as first inserted into the primary queue.
    pub fn into_queued(self) -> Job {
        Job {
            id: self.id,
            team_id: self.team_id,
            pool: self.pool,
            status: JobStatus::Queued,
            data: self.data,
            priority: self.priority,
            created_at: self.created_at,
            lock_token: None,
            locked_at: None,
            stalls: 0,
            finished_at: None,
            return_value: None,
            failed_reason: None,
            settled_at: None,
        }
    }
}

/// A job parked in backlog storage until its team has a free slot.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct BacklogEntry {
    pub id: Uuid,
    pub team_id: String,
    pub pool: JobPool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// A queued or active job as seen by admission control.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct LiveJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// Queue depth by status, plus backlog storage size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub backlog: i64,
}

/// Result of one stall-reaper pass.
#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    /// Jobs moved back to `queued`
    pub requeued: Vec<Uuid>,
    /// Jobs failed terminally after exhausting the stall budget
    pub failed: Vec<Job>,
    /// Terminal jobs whose hook was replayed after the finisher went away
    pub settled: Vec<Uuid>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty() && self.settled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_defaults() {
        let job = NewJob::builder().team_id("team-1").build();
        assert_eq!(job.pool, JobPool::Scrape);
        assert_eq!(job.priority, 10);

        let queued = job.clone().into_queued();
        assert_eq!(queued.status, JobStatus::Queued);
        assert_eq!(queued.id, job.id);
        assert!(queued.lock_token.is_none());
    }

    #[test]
    fn test_pool_parse() {
        assert_eq!("extract".parse::<JobPool>().unwrap(), JobPool::Extract);
        assert!("bogus".parse::<JobPool>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
    }
}
