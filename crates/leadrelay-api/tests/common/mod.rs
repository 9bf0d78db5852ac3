//! Shared setup for admin route tests: a running pipeline on in-memory
//! storage whose only destination is a mock webhook.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Method, Request, Response, StatusCode},
    Router,
};
use leadrelay_api::{create_router, AppState};
use leadrelay_core::{
    queue::memory::InMemoryQueue,
    storage::memory::{InMemoryDeadLetterStore, InMemoryEventStore},
    Clock, Destination, DestinationKind, DestinationName, DurableQueue, RateLimit, RealClock,
    Storage,
};
use leadrelay_delivery::{BatchConfig, ConsumerConfig, Pipeline, PipelineConfig, PipelineHandle};
use serde_json::Value;
use tower::ServiceExt;
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

pub const TOKEN: &str = "admin-secret";

pub struct TestAdmin {
    pub server: MockServer,
    pub events: Arc<InMemoryEventStore>,
    pub storage: Storage,
    pub handle: Option<PipelineHandle>,
    pub state: AppState,
}

impl TestAdmin {
    /// Starts a pipeline whose webhook answers every call with `status`.
    pub async fn start(status: u16) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let events = Arc::new(InMemoryEventStore::new());
        let storage = Storage::from_parts(
            events.clone(),
            Arc::new(InMemoryDeadLetterStore::new()),
            Arc::new(InMemoryQueue::new(clock.clone())),
        );

        let destination = Destination {
            name: DestinationName::from("hook"),
            kind: DestinationKind::Webhook { headers: Default::default() },
            endpoint: format!("{}/hook", server.uri()),
            rate_limit: RateLimit { tokens: 100, interval: Duration::from_secs(1) },
            timeout: Duration::from_secs(2),
            bulk: false,
            events: Vec::new(),
            enabled: true,
        };
        let config = PipelineConfig {
            consumer: ConsumerConfig {
                poll_interval: Duration::from_millis(10),
                ..ConsumerConfig::default()
            },
            batch: BatchConfig {
                max_batch_size: 1,
                max_batch_age: Duration::from_millis(20),
                ..BatchConfig::default()
            },
            shutdown_timeout: Duration::from_secs(5),
            ..PipelineConfig::default()
        };

        let pipeline =
            Pipeline::with_http_client(config, vec![destination], storage.clone(), clock.clone())
                .unwrap();
        let handle = pipeline.start().await;
        let state = AppState::new(handle.admin(), clock).with_admin_token(Some(TOKEN));

        Self { server, events, storage, handle: Some(handle), state }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone(), Duration::from_secs(5))
    }

    pub async fn enqueue_lead(&self, id: &str) {
        let body = serde_json::to_vec(&serde_json::json!({
            "id": id,
            "lead_score": 70,
            "payload": { "schema_version": 1, "event_name": "Lead", "telegram_id": "9" }
        }))
        .unwrap();
        self.storage.queue.enqueue(0, &body).await.unwrap();
    }

    /// Replaces the mock so every call is answered with `status`.
    pub async fn respond_with(&self, status: u16) {
        self.server.reset().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await.unwrap();
        }
    }
}

pub fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    request(Method::GET, uri, token, Body::empty())
}

pub fn post_json(uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    request(Method::POST, uri, token, Body::from(body.to_string()))
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Body) -> Request<Body> {
    let mut builder =
        Request::builder().method(method).uri(uri).header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(body).unwrap()
}

pub async fn send(router: Router, request: Request<Body>) -> Response<Body> {
    router.oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn send_json(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = send(router, request).await;
    let status = response.status();
    (status, json_body(response).await)
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
