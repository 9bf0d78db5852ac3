//! Health, liveness and request id behavior.

mod common;

use axum::http::StatusCode;
use common::{get, json_body, send, TestAdmin};

#[tokio::test]
async fn health_reports_store_status() {
    let admin = TestAdmin::start(200).await;

    let response = send(admin.router(), get("/health", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["store"]["status"], "up");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    admin.events.set_unavailable(true);
    let response = send(admin.router(), get("/health", None)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["store"]["status"], "down");
    assert!(body["checks"]["store"]["message"].is_string());

    admin.events.set_unavailable(false);
    admin.shutdown().await;
}

#[tokio::test]
async fn liveness_answers_without_dependencies() {
    let admin = TestAdmin::start(200).await;
    admin.events.set_unavailable(true);

    let response = send(admin.router(), get("/live", None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "alive");
    admin.events.set_unavailable(false);
    admin.shutdown().await;
}

#[tokio::test]
async fn request_ids_are_generated_or_propagated() {
    let admin = TestAdmin::start(200).await;

    let generated = send(admin.router(), get("/health", None)).await;
    let id = generated.headers().get("x-request-id").unwrap().to_str().unwrap();
    assert_eq!(id.len(), 36);

    let mut request = get("/health", None);
    request.headers_mut().insert("x-request-id", "trace-123".parse().unwrap());
    let propagated = send(admin.router(), request).await;
    assert_eq!(propagated.headers().get("x-request-id").unwrap(), "trace-123");

    admin.shutdown().await;
}
