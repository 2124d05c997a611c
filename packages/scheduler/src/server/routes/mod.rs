// HTTP routes
pub mod admin;
pub mod health;
pub mod metrics;

pub use admin::*;
pub use health::*;
pub use metrics::*;
