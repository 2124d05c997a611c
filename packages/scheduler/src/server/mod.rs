// HTTP server setup (Axum, operational surface)
pub mod app;
pub mod routes;

pub use app::*;
