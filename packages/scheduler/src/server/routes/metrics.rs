use axum::{extract::Extension, http::StatusCode, Json};
use tracing::error;

use crate::kernel::metrics::MetricsSnapshot;
use crate::server::app::AppState;

/// Queue depth by status plus per-team backlog and active leases.
pub async fn metrics_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<MetricsSnapshot>, (StatusCode, String)> {
    MetricsSnapshot::collect(state.kernel.queue.as_ref(), &state.kernel.admission)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "failed to collect metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
}
