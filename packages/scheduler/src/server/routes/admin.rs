use axum::{extract::Extension, http::StatusCode, Json};
use serde::Deserialize;
use tracing::{error, info};

use crate::domains::concurrency::ReconcileReport;
use crate::server::app::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileRequest {
    /// Reconcile a single team; all tracked teams when absent
    pub team_id: Option<String>,
}

/// Admin trigger for ledger reconciliation.
pub async fn reconcile_handler(
    Extension(state): Extension<AppState>,
    body: Option<Json<ReconcileRequest>>,
) -> Result<Json<ReconcileReport>, (StatusCode, String)> {
    let request = body.map(|Json(request)| request).unwrap_or_default();

    let report = state
        .kernel
        .admission
        .reconcile(request.team_id.as_deref())
        .await
        .map_err(|e| {
            error!(error = %e, "reconciliation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    info!(
        team_id = ?request.team_id,
        drift = report.drift(),
        promoted = report.promoted,
        "admin reconciliation complete"
    );
    Ok(Json(report))
}
