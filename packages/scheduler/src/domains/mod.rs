// Business domains
pub mod concurrency;
pub mod crawling;
