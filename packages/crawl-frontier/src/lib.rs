//! Crawl frontier: per-crawl URL reservation, link policy and completion
//! tracking on a shared coordination store.
//!
//! The main entry point is [`Frontier`], constructed once per process over a
//! [`FrontierStore`] (Redis in production, memory in tests).

pub mod error;
pub mod filter;
pub mod frontier;
pub mod normalize;
pub mod robots;
pub mod sitemap;
pub mod storage;
pub mod traits;
pub mod types;

pub use error::{FrontierError, Result};
pub use filter::{Denial, DenialReason, FilterOutcome, LinkFilter, PolicyLinkFilter};
pub use frontier::{is_cross_domain_redirect, Frontier, FrontierConfig};
pub use normalize::{generate_url_permutations, lock_request, normalize_url};
pub use robots::{RobotsTxt, CRAWLER_USER_AGENT};
pub use sitemap::{default_sitemap_urls, process_sitemap, SitemapInstructions};
pub use storage::{MemoryFrontierStore, RedisFrontierStore};
pub use traits::FrontierStore;
pub use types::*;
