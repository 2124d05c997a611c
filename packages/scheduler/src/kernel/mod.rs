//! Kernel module - scheduler infrastructure and dependencies.

pub mod jobs;
pub mod metrics;
pub mod notify_hub;
pub mod scheduled_tasks;
pub mod server_kernel;
pub mod service_host;

pub use metrics::{MetricsReporter, MetricsSnapshot, TeamMetrics};
pub use notify_hub::NotificationHub;
pub use scheduled_tasks::start_scheduler;
pub use server_kernel::SchedulerKernel;
pub use service_host::{Service, ServiceHost};
