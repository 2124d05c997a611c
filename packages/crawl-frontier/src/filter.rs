//! Link policy: which discovered links a crawl may schedule.
//!
//! Every rejected link carries a structured [`DenialReason`] so callers can do
//! bookkeeping (robots reporting, denial statistics) without matching on
//! message text.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::robots::RobotsTxt;
use crate::types::CrawlState;

static FILE_EXTENSIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        ".png", ".jpg", ".jpeg", ".gif", ".css", ".js", ".ico", ".svg", ".tiff", ".zip", ".exe",
        ".dmg", ".mp4", ".mp3", ".wav", ".pptx", ".xlsx", ".avi", ".flv", ".woff", ".ttf",
        ".woff2", ".webp", ".inc",
    ]
    .into_iter()
    .collect()
});

const SOCIAL_MEDIA_OR_EMAIL: &[&str] = &[
    "facebook.com",
    "twitter.com",
    "linkedin.com",
    "instagram.com",
    "pinterest.com",
    "mailto:",
    "github.com",
    "calendly.com",
    "discord.gg",
    "discord.com",
];

/// Why a link was not scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    UrlParseError,
    DepthLimit,
    ExcludePattern,
    IncludePattern,
    BackwardCrawling,
    RobotsTxt,
    FileType,
    SocialMedia,
    ExternalLink,
    SectionLink,
}

impl DenialReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            DenialReason::UrlParseError => "URL_PARSE_ERROR",
            DenialReason::DepthLimit => "DEPTH_LIMIT",
            DenialReason::ExcludePattern => "EXCLUDE_PATTERN",
            DenialReason::IncludePattern => "INCLUDE_PATTERN",
            DenialReason::BackwardCrawling => "BACKWARD_CRAWLING",
            DenialReason::RobotsTxt => "ROBOTS_TXT",
            DenialReason::FileType => "FILE_TYPE",
            DenialReason::SocialMedia => "SOCIAL_MEDIA",
            DenialReason::ExternalLink => "EXTERNAL_LINK",
            DenialReason::SectionLink => "SECTION_LINK",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_code())
    }
}

/// A structured denial: reason code plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub reason: DenialReason,
    pub detail: String,
}

impl Denial {
    pub fn new(reason: DenialReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// Result of filtering the links found on one page.
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    /// Allowed links, resolved to absolute URLs, in discovery order
    pub links: Vec<String>,
    /// Rejected links keyed by the link as discovered
    pub denials: HashMap<String, Denial>,
}

impl FilterOutcome {
    /// Absolute URLs rejected by robots rules.
    pub fn robots_blocked(&self) -> Vec<String> {
        self.denials
            .iter()
            .filter(|(_, d)| d.reason == DenialReason::RobotsTxt)
            .map(|(link, d)| {
                if d.detail.is_empty() {
                    link.clone()
                } else {
                    d.detail.clone()
                }
            })
            .collect()
    }
}

/// Caller-supplied "extract and filter links" step.
///
/// The scraping engine may provide its own; [`PolicyLinkFilter`] applies the
/// crawl policy stored on [`CrawlState`].
pub trait LinkFilter: Send + Sync {
    fn filter_links(
        &self,
        crawl: &CrawlState,
        page_url: &str,
        links: Vec<String>,
        limit: Option<usize>,
    ) -> FilterOutcome;
}

/// Default link filter driven entirely by crawl options.
#[derive(Debug, Clone, Default)]
pub struct PolicyLinkFilter;

impl LinkFilter for PolicyLinkFilter {
    fn filter_links(
        &self,
        crawl: &CrawlState,
        page_url: &str,
        links: Vec<String>,
        limit: Option<usize>,
    ) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        let limit = limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return outcome;
        }

        let Ok(base_url) = Url::parse(&crawl.origin_url) else {
            for link in links {
                outcome.denials.insert(
                    link,
                    Denial::new(DenialReason::UrlParseError, "crawl origin is not a valid URL"),
                );
            }
            return outcome;
        };
        let page = Url::parse(page_url).unwrap_or_else(|_| base_url.clone());
        let policy = CompiledPolicy::new(crawl);

        for link in links {
            if outcome.links.len() >= limit {
                break;
            }
            match policy.check(&link, &page, &base_url) {
                Ok(url) => outcome.links.push(url),
                Err(denial) => {
                    outcome.denials.insert(link, denial);
                }
            }
        }

        outcome
    }
}

/// Crawl options with patterns and robots rules parsed once per page.
struct CompiledPolicy<'a> {
    crawl: &'a CrawlState,
    excludes: Vec<Regex>,
    includes: Vec<Regex>,
    robots: Option<RobotsTxt>,
}

impl<'a> CompiledPolicy<'a> {
    fn new(crawl: &'a CrawlState) -> Self {
        let options = &crawl.crawler_options;
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect::<Vec<_>>()
        };

        let robots = match (&crawl.robots_txt, options.ignore_robots_txt) {
            (Some(content), false) if !content.is_empty() => Some(RobotsTxt::parse(content)),
            _ => None,
        };

        Self {
            crawl,
            excludes: compile(&options.excludes),
            includes: compile(&options.includes),
            robots,
        }
    }

    fn check(&self, link: &str, page: &Url, base_url: &Url) -> Result<String, Denial> {
        let options = &self.crawl.crawler_options;

        let url = page
            .join(link)
            .map_err(|e| Denial::new(DenialReason::UrlParseError, e.to_string()))?;
        let path = url.path();
        let url_str = url.as_str();

        let depth = url_depth(path);
        if depth > options.max_depth {
            return Err(Denial::new(
                DenialReason::DepthLimit,
                format!("path depth {depth} exceeds {}", options.max_depth),
            ));
        }

        if is_file(&path.to_lowercase()) {
            return Err(Denial::new(DenialReason::FileType, path));
        }

        let match_target = if options.regex_on_full_url {
            url_str
        } else {
            path
        };

        if is_internal_link(&url, base_url) {
            if !no_sections(url_str) {
                return Err(Denial::new(DenialReason::SectionLink, url_str));
            }

            if !options.crawl_entire_domain && !path.starts_with(base_url.path()) {
                return Err(Denial::new(
                    DenialReason::BackwardCrawling,
                    format!("{path} is outside {}", base_url.path()),
                ));
            }

            if let Some(pattern) = self.excludes.iter().find(|r| r.is_match(match_target)) {
                return Err(Denial::new(DenialReason::ExcludePattern, pattern.as_str()));
            }

            if !self.includes.is_empty() && !self.includes.iter().any(|r| r.is_match(match_target))
            {
                return Err(Denial::new(DenialReason::IncludePattern, match_target));
            }

            if let Some(robots) = &self.robots {
                if !robots.is_url_allowed(&url) {
                    return Err(Denial::new(DenialReason::RobotsTxt, url_str));
                }
            }

            return Ok(url.to_string());
        }

        // External links
        if is_social_media_or_email(url_str) {
            return Err(Denial::new(DenialReason::SocialMedia, url_str));
        }

        if let Some(pattern) = self.excludes.iter().find(|r| r.is_match(url_str)) {
            return Err(Denial::new(DenialReason::ExcludePattern, pattern.as_str()));
        }

        if is_internal_link(page, base_url)
            && options.allow_external_content_links
            && !is_main_page(&url)
        {
            return Ok(url.to_string());
        }

        if options.allow_subdomains && is_subdomain(&url, base_url) {
            if !self.includes.is_empty() && !self.includes.iter().any(|r| r.is_match(match_target))
            {
                return Err(Denial::new(DenialReason::IncludePattern, match_target));
            }
            return Ok(url.to_string());
        }

        Err(Denial::new(DenialReason::ExternalLink, url_str))
    }
}

/// Whether a (lowercased) path points at a static asset.
pub fn is_file(path: &str) -> bool {
    match path.rfind('.') {
        Some(dot) => FILE_EXTENSIONS.contains(&path[dot..]),
        None => false,
    }
}

/// Number of meaningful path segments.
pub fn url_depth(path: &str) -> u32 {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != "index.php" && *s != "index.html")
        .count() as u32
}

fn bare_host(url: &Url) -> &str {
    url.host_str().unwrap_or("").trim_start_matches("www.")
}

fn is_internal_link(url: &Url, base_url: &Url) -> bool {
    bare_host(url) == bare_host(base_url)
}

/// Registrable domain approximated as the last two host labels.
fn registrable_domain(host: &str) -> &str {
    let mut dots = host.rmatch_indices('.');
    dots.next();
    match dots.next() {
        Some((idx, _)) => &host[idx + 1..],
        None => host,
    }
}

fn is_subdomain(url: &Url, base_url: &Url) -> bool {
    match (url.host_str(), base_url.host_str()) {
        (Some(link), Some(base)) => registrable_domain(link) == registrable_domain(base),
        _ => false,
    }
}

/// A `#fragment` only counts as a distinct page when it looks like a route.
fn no_sections(url_str: &str) -> bool {
    match url_str.split_once('#') {
        None => true,
        Some((_, fragment)) => fragment.len() > 1 && fragment.contains('/'),
    }
}

fn is_social_media_or_email(url_str: &str) -> bool {
    SOCIAL_MEDIA_OR_EMAIL.iter().any(|d| url_str.contains(d))
}

fn is_main_page(url: &Url) -> bool {
    url.path_segments()
        .map(|mut segments| segments.all(|s| s.is_empty()))
        .unwrap_or(true)
}
