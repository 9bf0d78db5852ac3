//! Dead-letter listing and replay.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    Json,
};
use leadrelay_core::{DeadLetter, DeadLetterFilter, DestinationName, ErrorClass};
use leadrelay_delivery::ReprocessReport;
use serde::Deserialize;
use tracing::{info, instrument};

use super::ApiError;
use crate::AppState;

/// Most entries a single request may select.
pub const MAX_LIMIT: usize = 1000;

/// Dead-letter selection, as query string or JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeadLetterQuery {
    /// Only entries of this destination.
    pub destination: Option<String>,
    /// Only entries of this class: `decode`, `permanent` or
    /// `retries_exhausted`.
    pub error_class: Option<ErrorClass>,
    /// Only entries dead for at least this many seconds.
    pub min_age_seconds: Option<u64>,
    /// Only entries dead for at most this many seconds.
    pub max_age_seconds: Option<u64>,
    /// Only entries replayed fewer than this many times.
    pub max_reprocess_count: Option<u32>,
    /// Maximum entries selected, capped at [`MAX_LIMIT`].
    pub limit: Option<usize>,
}

impl DeadLetterQuery {
    /// Converts into the store filter.
    pub fn to_filter(&self) -> DeadLetterFilter {
        let defaults = DeadLetterFilter::default();
        DeadLetterFilter {
            min_age: self.min_age_seconds.map(Duration::from_secs),
            max_age: self.max_age_seconds.map(Duration::from_secs),
            destination: self.destination.as_deref().map(DestinationName::from),
            error_class: self.error_class,
            max_reprocess_count: self.max_reprocess_count,
            limit: self.limit.unwrap_or(defaults.limit).clamp(1, MAX_LIMIT),
        }
    }
}

/// `GET /dead-letters`
#[instrument(name = "list_dead_letters", skip(state))]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    Ok(Json(state.admin.dead_letters(&query.to_filter()).await?))
}

/// `POST /dead-letters/reprocess`
#[instrument(name = "reprocess_dead_letters", skip(state))]
pub async fn reprocess_dead_letters(
    State(state): State<AppState>,
    Json(query): Json<DeadLetterQuery>,
) -> Result<Json<ReprocessReport>, ApiError> {
    let report = state.admin.reprocess(&query.to_filter()).await?;
    info!(
        matched = report.matched,
        reprocessed = report.reprocessed.len(),
        skipped = report.skipped.len(),
        "dead letters reprocessed on request"
    );
    Ok(Json(report))
}
