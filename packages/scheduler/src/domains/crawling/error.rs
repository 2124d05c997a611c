use crawl_frontier::{DenialReason, FrontierError};
use thiserror::Error;

use crate::domains::concurrency::AdmissionError;
use crate::kernel::jobs::QueueError;

/// Outcomes of a crawl job other than a plain success.
///
/// `Cancelled` and `Denied` are expected stops: the job completes and the
/// crawl bookkeeping records it. Everything else fails the job.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("crawl was cancelled")]
    Cancelled,

    #[error("denied ({reason}): {detail}")]
    Denied { reason: DenialReason, detail: String },

    #[error("frontier error: {0}")]
    Frontier(#[from] FrontierError),

    #[error("admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("scrape engine error: {0}")]
    Engine(#[source] anyhow::Error),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl CrawlError {
    /// Whether the job should complete rather than fail.
    pub fn is_expected(&self) -> bool {
        matches!(self, CrawlError::Cancelled | CrawlError::Denied { .. })
    }
}

pub type CrawlResult<T> = std::result::Result<T, CrawlError>;
