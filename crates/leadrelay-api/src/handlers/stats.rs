//! Pipeline statistics and Prometheus exposition.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use leadrelay_delivery::PipelineSnapshot;
use tracing::instrument;

use super::ApiError;
use crate::AppState;

/// `GET /stats`: totals, store counts, queue depth and per-destination
/// bucket utilization.
#[instrument(name = "pipeline_stats", skip(state))]
pub async fn pipeline_stats(
    State(state): State<AppState>,
) -> Result<Json<PipelineSnapshot>, ApiError> {
    Ok(Json(state.admin.snapshot().await?))
}

/// `GET /metrics`: Prometheus text format.
pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed")
            .into_response(),
    }
}
