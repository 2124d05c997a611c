// Crawl Scheduler - Core
//
// Durable claim-leased job queue, per-team concurrency admission and crawl
// jobs on top of the crawl frontier.
//
// Infrastructure lives in kernel/, business logic in domains/*/.

pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
