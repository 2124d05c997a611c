//! Typed errors for the crawl frontier.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so the scheduler can
//! tell storage faults apart from bad input.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during frontier operations.
#[derive(Debug, Error)]
pub enum FrontierError {
    /// Coordination store operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Redis command failed
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// URL could not be parsed or has no host
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Crawl state missing (expired or never saved)
    #[error("crawl not found: {0}")]
    CrawlNotFound(Uuid),

    /// Sitemap XML could not be parsed
    #[error("sitemap parse error: {0}")]
    SitemapParse(String),

    /// JSON encoding of crawl state failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FrontierError {
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }
}

/// Result type alias for frontier operations.
pub type Result<T> = std::result::Result<T, FrontierError>;
