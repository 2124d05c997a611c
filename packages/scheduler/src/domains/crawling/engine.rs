//! The fetch/render pipeline seen from the scheduler.
//!
//! Infrastructure trait only: browsers, proxies and document conversion live
//! behind it.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A fetched page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedPage {
    /// URL after redirects
    pub final_url: String,
    pub status_code: u16,
    /// Raw hrefs found on the page, unresolved
    pub links: Vec<String>,
    /// Rendered document handed back to the producer
    pub document: serde_json::Value,
}

#[async_trait]
pub trait ScrapeEngine: Send + Sync {
    /// Fetch and render `url` with the crawl's scrape options.
    async fn scrape(&self, url: &str, scrape_options: &serde_json::Value) -> Result<ScrapedPage>;

    /// Fetch a plain-text resource (robots.txt, sitemaps). `None` if absent.
    async fn fetch_text(&self, url: &str) -> Result<Option<String>>;
}
