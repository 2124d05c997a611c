// SchedulerKernel - core infrastructure shared by workers and the HTTP surface
//
// Holds the queue of record, the crawl frontier and admission control, and
// wires them into workers, the stall reaper and the backlog sweeper.

use std::sync::Arc;
use std::time::Duration;

use crawl_frontier::{Frontier, FrontierConfig, LinkFilter, MemoryFrontierStore, PolicyLinkFilter};

use super::jobs::{JobLifecycle, JobQueue, JobWorker, JobWorkerConfig, MemoryJobQueue, QueueConfig, StallReaper};
use super::metrics::MetricsReporter;
use super::service_host::Service;
use crate::domains::concurrency::{
    AdmissionConfig, AdmissionControl, BacklogSweeper, MemoryConcurrencyLedger,
};
use crate::domains::crawling::{
    CrawlCompletionHook, CrawlLifecycle, CrawlProcessor, CrawlService, LogCompletionHook, ScrapeEngine,
};

/// Backlog sweep cadence, a safety net behind release-time promotion
const BACKLOG_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// SchedulerKernel holds all scheduler dependencies
#[derive(Clone)]
pub struct SchedulerKernel {
    pub queue: Arc<dyn JobQueue>,
    pub frontier: Frontier,
    pub admission: AdmissionControl,
    pub crawls: CrawlService,
    pub lifecycle: Arc<CrawlLifecycle>,
}

impl SchedulerKernel {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        frontier: Frontier,
        admission: AdmissionControl,
        completion: Arc<dyn CrawlCompletionHook>,
    ) -> Self {
        let crawls = CrawlService::new(frontier.clone(), admission.clone());
        let lifecycle = Arc::new(CrawlLifecycle::new(frontier.clone(), admission.clone(), completion));
        Self {
            queue,
            frontier,
            admission,
            crawls,
            lifecycle,
        }
    }

    /// Kernel over in-memory stores (tests, local experiments).
    pub fn in_memory(admission: AdmissionConfig) -> Self {
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let frontier = Frontier::new(Arc::new(MemoryFrontierStore::new()), FrontierConfig::default());
        let admission = AdmissionControl::new(queue.clone(), Arc::new(MemoryConcurrencyLedger::new()), admission);
        Self::new(queue, frontier, admission, Arc::new(LogCompletionHook))
    }

    /// Crawl job handler over `engine` with the default link policy.
    pub fn processor(&self, engine: Arc<dyn ScrapeEngine>) -> Arc<CrawlProcessor> {
        self.processor_with_filter(engine, Arc::new(PolicyLinkFilter))
    }

    pub fn processor_with_filter(
        &self,
        engine: Arc<dyn ScrapeEngine>,
        filter: Arc<dyn LinkFilter>,
    ) -> Arc<CrawlProcessor> {
        Arc::new(CrawlProcessor::new(
            self.frontier.clone(),
            self.admission.clone(),
            engine,
            filter,
        ))
    }

    pub fn worker(&self, processor: Arc<CrawlProcessor>, config: JobWorkerConfig) -> JobWorker {
        let lifecycle: Arc<dyn JobLifecycle> = self.lifecycle.clone();
        JobWorker::with_config(self.queue.clone(), processor, lifecycle, config)
    }

    /// Workers plus the reaper, sweeper and metrics reporter.
    pub fn background_services(
        &self,
        processor: Arc<CrawlProcessor>,
        worker_count: usize,
        worker: &JobWorkerConfig,
        queue: &QueueConfig,
        metrics_interval: Duration,
    ) -> Vec<Box<dyn Service>> {
        let mut services: Vec<Box<dyn Service>> = Vec::with_capacity(worker_count + 3);

        for n in 0..worker_count {
            let config = JobWorkerConfig {
                worker_id: format!("{}-{n}", worker.worker_id),
                ..worker.clone()
            };
            services.push(Box::new(self.worker(processor.clone(), config)));
        }

        let lifecycle: Arc<dyn JobLifecycle> = self.lifecycle.clone();
        services.push(Box::new(StallReaper::new(self.queue.clone(), lifecycle, queue.clone())));
        services.push(Box::new(BacklogSweeper::new(self.admission.clone(), BACKLOG_SWEEP_INTERVAL)));
        services.push(Box::new(MetricsReporter::new(
            self.queue.clone(),
            self.admission.clone(),
            metrics_interval,
        )));
        services
    }
}
