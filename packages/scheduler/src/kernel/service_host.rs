//! Hosting for long-running background services.
//!
//! Each service runs on its own task and receives a child of one shared
//! `CancellationToken`. Ctrl-C (or an explicit cancel) stops all of them, and
//! the host waits for every service to return before exiting.
//!
//! ```ignore
//! ServiceHost::new()
//!     .with_service(worker)
//!     .with_service(reaper)
//!     .run_until_shutdown()
//!     .await?;
//! ```

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running service.
#[async_trait::async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run until `shutdown` is cancelled.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_service(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    pub fn with_boxed_service(mut self, service: Box<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Token that stops every hosted service when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run all services until Ctrl-C or the shutdown token fires.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        });
        self.run().await
    }

    /// Run all services until the shutdown token fires.
    pub async fn run(self) -> Result<()> {
        let mut tasks = JoinSet::new();
        for service in self.services {
            let name = service.name();
            let token = self.shutdown.child_token();
            info!(service = name, "starting service");
            tasks.spawn(async move { (name, service.run(token).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(service = name, "service stopped"),
                Ok((name, Err(e))) => {
                    error!(service = name, error = %e, "service failed");
                    self.shutdown.cancel();
                }
                Err(e) => {
                    error!(error = %e, "service task panicked");
                    self.shutdown.cancel();
                }
            }
        }
        Ok(())
    }
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}
