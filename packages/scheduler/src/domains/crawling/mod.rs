//! Crawling domain - crawl jobs on top of the frontier, admission control
//! and the job queue.
//!
//! # Architecture
//!
//! ```text
//! CrawlService.start_crawl(state)
//!     ├─► Frontier.create_crawl
//!     └─► AdmissionControl.check_admission(Kickoff)
//!
//! JobWorker ─► CrawlProcessor (JobHandler)
//!     └─► Kickoff / Sitemap / Scrape
//!
//! CrawlLifecycle (JobLifecycle)
//!     ├─► heartbeat ─► renew concurrency lease
//!     └─► terminal  ─► frontier done ─► finish_crawl_if_needed ─► CrawlCompletionHook
//!                   └─► release slot ─► promote backlog
//! ```

pub mod engine;
pub mod error;
pub mod http_engine;
pub mod lifecycle;
pub mod payload;
pub mod processor;
pub mod service;

pub use engine::{ScrapeEngine, ScrapedPage};
pub use error::{CrawlError, CrawlResult};
pub use http_engine::HttpScrapeEngine;
pub use lifecycle::{CrawlCompletionHook, CrawlLifecycle, LogCompletionHook};
pub use payload::{CrawlJob, CrawlJobResult, CrawlJobStatus};
pub use processor::CrawlProcessor;
pub use service::{CrawlService, CrawlStarted};
