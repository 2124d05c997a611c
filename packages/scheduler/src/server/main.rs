// Main entry point for the scheduler worker host

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use crawl_frontier::{Frontier, FrontierConfig, RedisFrontierStore};
use scheduler_core::domains::concurrency::{AdmissionControl, RedisConcurrencyLedger};
use scheduler_core::domains::crawling::{HttpScrapeEngine, LogCompletionHook};
use scheduler_core::kernel::jobs::{JobQueue, PostgresJobQueue};
use scheduler_core::kernel::{start_scheduler, SchedulerKernel, Service, ServiceHost};
use scheduler_core::{server::build_app, Config};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Operational HTTP surface as a hosted service
struct HttpService {
    listener: tokio::net::TcpListener,
    app: Router,
}

#[async_trait::async_trait]
impl Service for HttpService {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Server error")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scheduler_core=debug,crawl_frontier=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting crawl scheduler");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(workers = config.worker_count, "Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections((config.worker_count as u32 + 4).max(10))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Coordination store
    let frontier_config = FrontierConfig::default();
    let frontier_store = RedisFrontierStore::connect(&config.redis_url, frontier_config.retention)
        .await
        .context("Failed to connect frontier store to Redis")?;
    let ledger = RedisConcurrencyLedger::connect(&config.redis_url)
        .await
        .context("Failed to connect concurrency ledger to Redis")?;
    tracing::info!("Redis connected");

    let queue: Arc<dyn JobQueue> = Arc::new(PostgresJobQueue::new(pool));
    let frontier = Frontier::new(Arc::new(frontier_store), frontier_config);
    let admission = AdmissionControl::new(queue.clone(), Arc::new(ledger), config.admission.clone());
    let kernel = SchedulerKernel::new(queue, frontier, admission, Arc::new(LogCompletionHook));

    let engine = Arc::new(HttpScrapeEngine::new(config.scrape_timeout)?);
    let processor = kernel.processor(engine);

    // Scheduled reconciliation
    let _scheduler = start_scheduler(kernel.admission.clone(), &config.reconcile_cron)
        .await
        .context("Failed to start scheduled tasks")?;

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Operational surface on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);
    tracing::info!("Metrics: http://localhost:{}/metrics", config.port);

    let mut host = ServiceHost::new().with_service(HttpService {
        listener,
        app: build_app(kernel.clone()),
    });
    for service in kernel.background_services(
        processor,
        config.worker_count,
        &config.worker,
        &config.queue,
        config.metrics_interval,
    ) {
        host = host.with_boxed_service(service);
    }

    host.run_until_shutdown().await
}
