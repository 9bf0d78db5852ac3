//! Admin HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID propagation or generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Bearer token check (protected routes only)
//! 5. Handler execution

use std::{future::Future, net::SocketAddr, time::Duration};

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{handlers, middleware::auth::require_admin_token, AppState};

/// Header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Creates the Axum router with all admin routes and middleware.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use leadrelay_api::{create_router, AppState};
///
/// fn router(state: AppState) -> axum::Router {
///     create_router(state, Duration::from_secs(30))
/// }
/// ```
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let open_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/live", get(handlers::liveness_check));

    let protected_routes = Router::new()
        .route("/stats", get(handlers::pipeline_stats))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/dead-letters", get(handlers::list_dead_letters))
        .route("/dead-letters/reprocess", post(handlers::reprocess_dead_letters))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin_token));

    Router::new()
        .merge(open_routes)
        .merge(protected_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Propagates the caller's `X-Request-Id` or generates one, and echoes it
/// on the response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

/// Serves the admin router on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound.
pub async fn start_server<F>(router: Router, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Admin server listening on {}", actual_addr);

    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

    info!("Admin server stopped gracefully");
    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
