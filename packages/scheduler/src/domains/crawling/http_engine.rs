//! Static-HTML scrape engine - plain HTTP fetch + HTML parsing
//!
//! This implementation:
//! - Uses reqwest for HTTP requests (redirects followed, final URL kept)
//! - Uses scraper for title, main content and `a[href]` extraction
//! - Uses htmd for HTML to Markdown conversion
//!
//! Limitations:
//! - No JavaScript rendering (static HTML sites only)
//! - Gzipped sitemaps are not inflated

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use super::engine::{ScrapeEngine, ScrapedPage};
use crawl_frontier::CRAWLER_USER_AGENT;

const MAX_REDIRECTS: usize = 10;

/// Main content candidates, most specific first
const MAIN_SELECTORS: [&str; 6] = ["main", "article", "[role='main']", "#content", "#main", ".content"];

pub struct HttpScrapeEngine {
    client: reqwest::Client,
}

impl HttpScrapeEngine {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(CRAWLER_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    fn extract_title(document: &Html) -> Option<String> {
        let title_selector = Selector::parse("title").ok()?;
        document
            .select(&title_selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    }

    fn extract_main_content(document: &Html) -> String {
        for selector_str in MAIN_SELECTORS {
            if let Ok(selector) = Selector::parse(selector_str) {
                if let Some(main) = document.select(&selector).next() {
                    return main.html();
                }
            }
        }

        if let Ok(body_selector) = Selector::parse("body") {
            if let Some(body) = document.select(&body_selector).next() {
                return body.html();
            }
        }

        document.html()
    }

    fn html_to_markdown(html: &str) -> String {
        htmd::convert(html).unwrap_or_else(|_| {
            // Fallback: plain text
            let document = Html::parse_document(html);
            document.root_element().text().collect::<String>()
        })
    }

    /// Raw hrefs; resolution and policy belong to the link filter
    fn extract_links(document: &Html) -> Vec<String> {
        let Ok(link_selector) = Selector::parse("a[href]") else {
            return vec![];
        };

        document
            .select(&link_selector)
            .filter_map(|el| el.value().attr("href"))
            .map(|href| href.trim().to_string())
            .filter(|href| !href.is_empty())
            .collect()
    }
}

#[async_trait]
impl ScrapeEngine for HttpScrapeEngine {
    async fn scrape(&self, url: &str, _scrape_options: &serde_json::Value) -> Result<ScrapedPage> {
        debug!(url = %url, "fetching page");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("HTTP request failed")?;

        let status = response.status();
        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            warn!(url = %url, status = %status, "non-success response");
        }

        // Html is !Send; keep it out of any await
        let (title, markdown, links) = {
            let document = Html::parse_document(&html);
            let main_content = Self::extract_main_content(&document);
            (
                Self::extract_title(&document),
                Self::html_to_markdown(&main_content),
                Self::extract_links(&document),
            )
        };

        Ok(ScrapedPage {
            final_url: final_url.clone(),
            status_code: status.as_u16(),
            links,
            document: json!({
                "url": final_url,
                "title": title,
                "markdown": markdown,
            }),
        })
    }

    async fn fetch_text(&self, url: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("HTTP request failed")?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(None),
            status if status.is_success() => Ok(Some(
                response
                    .text()
                    .await
                    .context("Failed to read response body")?,
            )),
            status => anyhow::bail!("HTTP {} for {}", status, url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_raw_links_and_main_content() {
        let html = r#"<html><head><title> Docs </title></head><body>
            <nav><a href="/nav">nav</a></nav>
            <main><h1>Hello</h1><a href="/a">a</a><a href=" ">blank</a></main>
            <a href="https://other.com/b">b</a>
        </body></html>"#;
        let document = Html::parse_document(html);

        assert_eq!(HttpScrapeEngine::extract_title(&document).as_deref(), Some("Docs"));
        assert_eq!(
            HttpScrapeEngine::extract_links(&document),
            vec!["/nav", "/a", "https://other.com/b"]
        );
        let main = HttpScrapeEngine::extract_main_content(&document);
        assert!(main.contains("Hello"));
        assert!(!main.contains("/nav"));
    }
}
