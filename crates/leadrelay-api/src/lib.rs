//! Configuration and admin HTTP surface for leadrelay.
//!
//! The admin server exposes health, pipeline statistics, Prometheus
//! metrics and dead-letter inspection and replay. Everything but `/health`
//! sits behind a bearer token when one is configured.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod server;

use std::{fmt, sync::Arc};

pub use config::{Config, DestinationConfig, StoreBackend};
use leadrelay_core::Clock;
use leadrelay_delivery::PipelineAdmin;
use metrics_exporter_prometheus::PrometheusHandle;
pub use server::{create_router, shutdown_signal, start_server};

/// Shared state handed to every admin handler.
#[derive(Clone)]
pub struct AppState {
    /// Pipeline inspection and replay.
    pub admin: PipelineAdmin,
    /// Renders the Prometheus exposition; `None` when no recorder is
    /// installed.
    pub metrics: Option<PrometheusHandle>,
    /// Bearer token required on protected routes.
    pub admin_token: Option<Arc<str>>,
    /// Time source for health timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates state without a metrics handle or token.
    pub fn new(admin: PipelineAdmin, clock: Arc<dyn Clock>) -> Self {
        Self { admin, metrics: None, admin_token: None, clock }
    }

    /// Serves `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Requires `token` on protected routes. Empty tokens are ignored.
    #[must_use]
    pub fn with_admin_token(mut self, token: Option<&str>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty()).map(Arc::from);
        self
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("admin", &self.admin)
            .field("metrics", &self.metrics.is_some())
            .field("admin_token", &self.admin_token.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}
