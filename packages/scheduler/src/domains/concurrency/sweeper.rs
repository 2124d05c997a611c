//! Periodic backlog promotion.
//!
//! A slot whose holder never reached the queue frees up only when its lease
//! expires, and nothing else observes that moment. The sweeper promotes for
//! every known team on a fixed interval. Jobs still live in the queue keep
//! their slots through each pass.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::admission::AdmissionControl;
use crate::kernel::service_host::Service;

pub struct BacklogSweeper {
    admission: AdmissionControl,
    interval: Duration,
}

impl BacklogSweeper {
    pub fn new(admission: AdmissionControl, interval: Duration) -> Self {
        Self {
            admission,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl Service for BacklogSweeper {
    fn name(&self) -> &'static str {
        "backlog-sweeper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.admission.promote_all().await {
                        Ok(0) => {}
                        Ok(promoted) => debug!(promoted, "backlog sweep promoted jobs"),
                        Err(e) => error!(error = %e, "backlog sweep failed"),
                    }
                }
            }
        }
        Ok(())
    }
}
