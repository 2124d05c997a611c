use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::concurrency::{AdmissionConfig, ConcurrencyLimits};
use crate::kernel::jobs::{JobWorkerConfig, QueueConfig};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    pub worker_count: usize,
    pub scrape_timeout: Duration,
    pub metrics_interval: Duration,
    pub queue: QueueConfig,
    pub worker: JobWorkerConfig,
    pub admission: AdmissionConfig,
    pub reconcile_cron: String,
}

/// Parse an optional variable, falling back to `default` when unset.
fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn secs_or(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(var_or(name, default)?))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let queue = QueueConfig {
            lease_timeout: secs_or("JOB_LEASE_TIMEOUT_SECS", 60)?,
            stall_budget: var_or("JOB_STALL_BUDGET", 9)?,
            completed_ttl: secs_or("JOB_COMPLETED_TTL_SECS", 3600)?,
            failed_ttl: secs_or("JOB_FAILED_TTL_SECS", 21600)?,
            reaper_interval: secs_or("REAPER_INTERVAL_SECS", 15)?,
            settle_grace: secs_or("JOB_SETTLE_GRACE_SECS", 60)?,
        };

        let worker = JobWorkerConfig {
            lock_renew_interval: secs_or("JOB_LOCK_RENEW_SECS", 15)?,
            ..Default::default()
        };

        let admission = AdmissionConfig {
            limits: ConcurrencyLimits {
                default_limit: var_or("TEAM_CONCURRENCY_DEFAULT", 10)?,
                extract_default_limit: var_or("TEAM_CONCURRENCY_EXTRACT_DEFAULT", 5)?,
                ..Default::default()
            },
            lease: secs_or("CONCURRENCY_LEASE_SECS", 600)?,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            port: var_or("PORT", 8080)?,
            worker_count: var_or("WORKER_COUNT", 4)?,
            scrape_timeout: secs_or("SCRAPE_TIMEOUT_SECS", 30)?,
            metrics_interval: secs_or("METRICS_INTERVAL_SECS", 60)?,
            queue,
            worker,
            admission,
            reconcile_cron: env::var("RECONCILE_CRON").unwrap_or_else(|_| "0 */5 * * * *".to_string()),
        })
    }
}
