//! HTTP request handlers for the admin API.
//!
//! Handlers are grouped by functionality:
//! - `health` - liveness and store health
//! - `stats` - pipeline snapshot and Prometheus exposition
//! - `dead_letters` - dead-letter listing and replay
//!
//! Failures are returned as `{"error": "..."}` with 503 for unreachable
//! stores and 500 otherwise.

pub mod dead_letters;
pub mod health;
pub mod stats;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
pub use dead_letters::{list_dead_letters, reprocess_dead_letters, DeadLetterQuery};
pub use health::{health_check, liveness_check};
use leadrelay_delivery::PipelineError;
use serde_json::json;
pub use stats::{pipeline_stats, prometheus_metrics};

/// Error returned by admin handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Error with an explicit status.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match err {
            PipelineError::StoreUnavailable(_) | PipelineError::QueueUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(error = %err, "admin request failed");
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
