//! End-to-end crawl tests: kickoff, sitemap and scrape jobs run by a real
//! worker over in-memory stores, with a scripted scrape engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crawl_frontier::{CrawlState, CrawlStatus, CrawlSummary, Frontier, FrontierConfig, MemoryFrontierStore};
use scheduler_core::domains::concurrency::{AdmissionConfig, AdmissionControl, MemoryConcurrencyLedger};
use scheduler_core::domains::crawling::{CrawlCompletionHook, ScrapeEngine, ScrapedPage};
use scheduler_core::kernel::jobs::{
    Job, JobLifecycle, JobOutcome, JobQueue, JobWorker, JobWorkerConfig, MemoryJobQueue, QueueConfig, StallReaper,
};
use scheduler_core::kernel::SchedulerKernel;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SEED: &str = "https://site.test";

/// Serves a fixed link graph and records every page it fetched.
#[derive(Default)]
struct ScriptedEngine {
    pages: HashMap<String, Vec<String>>,
    redirects: HashMap<String, String>,
    robots: Option<String>,
    scraped: Mutex<Vec<String>>,
    /// Cancel this crawl while fetching the given URL
    cancel_during: Mutex<Option<(String, Frontier, Uuid)>>,
}

impl ScriptedEngine {
    fn with_pages(pages: &[(&str, &[&str])]) -> Self {
        Self {
            pages: pages
                .iter()
                .map(|(url, links)| (url.to_string(), links.iter().map(|l| l.to_string()).collect()))
                .collect(),
            ..Default::default()
        }
    }

    fn scraped(&self) -> Vec<String> {
        self.scraped.lock().unwrap().clone()
    }
}

fn key(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[async_trait::async_trait]
impl ScrapeEngine for ScriptedEngine {
    async fn scrape(&self, url: &str, _scrape_options: &serde_json::Value) -> anyhow::Result<ScrapedPage> {
        self.scraped.lock().unwrap().push(key(url));

        let cancel = self.cancel_during.lock().unwrap().clone();
        if let Some((target, frontier, crawl_id)) = cancel {
            if target == key(url) {
                frontier.cancel(crawl_id).await?;
            }
        }

        let final_url = self.redirects.get(&key(url)).cloned().unwrap_or_else(|| url.to_string());
        let links = self.pages.get(&key(&final_url)).cloned().unwrap_or_default();
        Ok(ScrapedPage {
            final_url: final_url.clone(),
            status_code: 200,
            links,
            document: json!({ "url": final_url }),
        })
    }

    async fn fetch_text(&self, url: &str) -> anyhow::Result<Option<String>> {
        if url.ends_with("/robots.txt") {
            return Ok(self.robots.clone());
        }
        Ok(None)
    }
}

#[derive(Default)]
struct RecordingHook {
    calls: AtomicUsize,
    last: Mutex<Option<CrawlSummary>>,
}

#[async_trait::async_trait]
impl CrawlCompletionHook for RecordingHook {
    async fn crawl_finished(&self, summary: &CrawlSummary) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(summary.clone());
        Ok(())
    }
}

struct Harness {
    kernel: SchedulerKernel,
    engine: Arc<ScriptedEngine>,
    hook: Arc<RecordingHook>,
    worker: JobWorker,
}

impl Harness {
    fn new(engine: ScriptedEngine) -> Self {
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let frontier = Frontier::new(Arc::new(MemoryFrontierStore::new()), FrontierConfig::default());
        let admission = AdmissionControl::new(
            queue.clone(),
            Arc::new(MemoryConcurrencyLedger::new()),
            AdmissionConfig::default(),
        );
        let hook = Arc::new(RecordingHook::default());
        let kernel = SchedulerKernel::new(queue, frontier, admission, hook.clone());

        let engine = Arc::new(engine);
        let worker = kernel.worker(kernel.processor(engine.clone()), JobWorkerConfig::with_worker_id("test"));
        Self {
            kernel,
            engine,
            hook,
            worker,
        }
    }

    async fn start(&self) -> Uuid {
        self.kernel
            .crawls
            .start_crawl(CrawlState::new("acme", SEED))
            .await
            .unwrap()
            .crawl_id
    }

    /// Run jobs until the queue is empty.
    async fn drain(&self) {
        let shutdown = CancellationToken::new();
        while self.worker.run_once(&shutdown).await.unwrap() {}
    }

    async fn step(&self) -> bool {
        self.worker.run_once(&CancellationToken::new()).await.unwrap()
    }
}

#[tokio::test]
async fn test_crawl_scrapes_each_logical_url_once() {
    let harness = Harness::new(ScriptedEngine::with_pages(&[
        (SEED, &["/a", "/b", "/a/", "http://site.test/b", "https://elsewhere.test/x"]),
        ("https://site.test/a", &["/b", "/c"]),
        ("https://site.test/b", &[]),
        ("https://site.test/c", &["/"]),
    ]));
    let crawl_id = harness.start().await;

    harness.drain().await;

    let mut scraped = harness.engine.scraped();
    scraped.sort();
    assert_eq!(
        scraped,
        vec![SEED, "https://site.test/a", "https://site.test/b", "https://site.test/c"]
    );

    let summary = harness
        .kernel
        .crawls
        .wait_for_crawl(crawl_id, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(summary.status, CrawlStatus::Completed);
    assert_eq!(summary.counts.completed, 4);
    assert_eq!(summary.counts.failed, 0);
    assert_eq!(summary.completed_job_ids.len(), 4);

    assert_eq!(harness.hook.calls.load(Ordering::SeqCst), 1);
    let reported = harness.hook.last.lock().unwrap().clone().unwrap();
    assert_eq!(reported.crawl_id, crawl_id);

    // Every slot went back to the team
    let counts = harness.kernel.queue.status_counts().await.unwrap();
    assert_eq!(counts.queued + counts.active + counts.backlog, 0);
}

#[tokio::test]
async fn test_robots_rules_block_and_are_reported() {
    let mut engine = ScriptedEngine::with_pages(&[(SEED, &["/public", "/private/report"])]);
    engine.robots = Some("User-agent: *\nDisallow: /private".to_string());
    let harness = Harness::new(engine);
    let crawl_id = harness.start().await;

    harness.drain().await;

    assert!(!harness.engine.scraped().iter().any(|u| u.contains("/private")));
    let summary = harness.kernel.crawls.crawl_status(crawl_id).await.unwrap();
    assert_eq!(summary.status, CrawlStatus::Completed);
    assert!(summary.robots_blocked.iter().any(|u| u.contains("/private/report")));
}

#[tokio::test]
async fn test_redirect_onto_reserved_url_is_a_benign_race() {
    let mut engine = ScriptedEngine::with_pages(&[
        (SEED, &["/moved", "/b"]),
        ("https://site.test/b", &[]),
    ]);
    engine
        .redirects
        .insert("https://site.test/moved".into(), "https://site.test/b".into());
    let harness = Harness::new(engine);
    let crawl_id = harness.start().await;

    harness.drain().await;

    let summary = harness.kernel.crawls.crawl_status(crawl_id).await.unwrap();
    assert_eq!(summary.status, CrawlStatus::Completed);
    // seed and /b; the redirect branch stops without a result
    assert_eq!(summary.counts.completed, 2);
    assert_eq!(summary.counts.total, 3);
}

#[tokio::test]
async fn test_cancel_stops_new_children_and_keeps_partial_results() {
    let harness = Harness::new(ScriptedEngine::with_pages(&[
        (SEED, &["/a", "/b"]),
        ("https://site.test/a", &["/c"]),
        ("https://site.test/b", &[]),
    ]));
    let crawl_id = harness.start().await;

    // Kickoff, then run until the seed page is in
    assert!(harness.step().await);
    while harness.engine.scraped().is_empty() {
        assert!(harness.step().await);
    }

    harness.kernel.crawls.cancel_crawl(crawl_id).await.unwrap();
    harness.drain().await;

    // Children claimed after the cancel never fetch
    assert_eq!(harness.engine.scraped(), vec![SEED.to_string()]);

    let summary = harness
        .kernel
        .crawls
        .wait_for_crawl(crawl_id, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(summary.status, CrawlStatus::Cancelled);
    assert_eq!(summary.counts.completed, 1);
    assert_eq!(summary.counts.pending(), 0);
    assert_eq!(harness.hook.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_during_fetch_finishes_page_without_children() {
    let harness = Harness::new(ScriptedEngine::with_pages(&[
        (SEED, &["/a", "/b"]),
        ("https://site.test/a", &[]),
    ]));
    let crawl_id = harness.start().await;
    *harness.engine.cancel_during.lock().unwrap() =
        Some((SEED.to_string(), harness.kernel.frontier.clone(), crawl_id));

    harness.drain().await;

    assert_eq!(harness.engine.scraped(), vec![SEED.to_string()]);
    let summary = harness.kernel.crawls.crawl_status(crawl_id).await.unwrap();
    assert_eq!(summary.status, CrawlStatus::Cancelled);
    assert_eq!(summary.counts.total, 1);
    assert_eq!(summary.counts.completed, 1);
}

/// Stands in for a worker process that dies right after committing a job.
struct DyingLifecycle;

#[async_trait::async_trait]
impl JobLifecycle for DyingLifecycle {
    async fn on_terminal(&self, _job: &Job, _outcome: JobOutcome<'_>) -> anyhow::Result<()> {
        anyhow::bail!("process exited before bookkeeping")
    }
}

#[tokio::test]
async fn test_crawl_resolves_when_terminal_bookkeeping_was_lost() {
    let harness = Harness::new(ScriptedEngine::with_pages(&[
        (SEED, &["/a"]),
        ("https://site.test/a", &[]),
    ]));
    let crawl_id = harness.start().await;

    let dying = JobWorker::with_config(
        harness.kernel.queue.clone(),
        harness.kernel.processor(harness.engine.clone()),
        Arc::new(DyingLifecycle),
        JobWorkerConfig::with_worker_id("dying"),
    );
    let shutdown = CancellationToken::new();
    let mut finished = 0;
    while dying.run_once(&shutdown).await.unwrap() {
        finished += 1;
    }

    // Every job is terminal in the queue, but the frontier never heard
    let counts = harness.kernel.queue.status_counts().await.unwrap();
    assert_eq!(counts.completed, finished);
    let stuck = harness.kernel.crawls.crawl_status(crawl_id).await.unwrap();
    assert_eq!(stuck.status, CrawlStatus::Scraping);
    assert_eq!(harness.hook.calls.load(Ordering::SeqCst), 0);

    let reaper = StallReaper::new(
        harness.kernel.queue.clone(),
        harness.kernel.lifecycle.clone(),
        QueueConfig {
            settle_grace: Duration::ZERO,
            ..Default::default()
        },
    );
    let report = reaper.run_once().await.unwrap();
    assert_eq!(report.settled.len() as i64, finished);

    let summary = harness.kernel.crawls.crawl_status(crawl_id).await.unwrap();
    assert_eq!(summary.status, CrawlStatus::Completed);
    assert_eq!(summary.counts.completed, 2);
    assert_eq!(harness.hook.calls.load(Ordering::SeqCst), 1);

    // A second pass has nothing left to replay
    assert!(reaper.run_once().await.unwrap().settled.is_empty());
    assert_eq!(harness.hook.calls.load(Ordering::SeqCst), 1);
}
