use thiserror::Error;
use uuid::Uuid;

/// Job queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job already exists: {0}")]
    DuplicateJob(Uuid),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Timed out waiting for job {0}")]
    WaitTimeout(Uuid),

    #[error("Job {id} failed: {reason}")]
    JobFailed { id: Uuid, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Subscription error: {0}")]
    Subscription(String),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
