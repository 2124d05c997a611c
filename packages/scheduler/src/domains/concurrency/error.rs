use thiserror::Error;

use crate::kernel::jobs::QueueError;

/// Admission control errors.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type AdmissionResult<T> = std::result::Result<T, AdmissionError>;
