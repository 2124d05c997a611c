//! Application setup for the operational HTTP surface.

use std::time::Duration;

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::SchedulerKernel;
use crate::server::routes::{health_handler, metrics_handler, reconcile_handler};

/// Reconciliation walks every tracked team; give it room
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub kernel: SchedulerKernel,
}

/// Build the Axum application router
pub fn build_app(kernel: SchedulerKernel) -> Router {
    let app_state = AppState { kernel };

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/reconcile", post(reconcile_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(app_state))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::concurrency::{AdmissionConfig, ConcurrencyLimits};
    use crate::kernel::jobs::NewJob;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn kernel() -> SchedulerKernel {
        SchedulerKernel::in_memory(AdmissionConfig {
            limits: ConcurrencyLimits {
                default_limit: 1,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_health_reports_ok() {
        let response = build_app(kernel())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_metrics_feed_shows_backlog() {
        let kernel = kernel();
        for _ in 0..3 {
            kernel
                .admission
                .check_admission(NewJob::builder().team_id("acme").build())
                .await
                .unwrap();
        }

        let response = build_app(kernel)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["queue"]["queued"], 1);
        assert_eq!(body["queue"]["backlog"], 2);
        assert_eq!(body["teams"][0]["team_id"], "acme");
        assert_eq!(body["teams"][0]["active_leases"], 1);
    }

    #[tokio::test]
    async fn test_reconcile_for_one_team() {
        let response = build_app(kernel())
            .oneshot(
                Request::post("/admin/reconcile")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"team_id":"acme"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["promoted"], 0);
    }
}
