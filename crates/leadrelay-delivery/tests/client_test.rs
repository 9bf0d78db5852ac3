//! Integration tests for the HTTP destination client.
//!
//! Each supported protocol is exercised against a mock server and the
//! request that reached it is inspected.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use chrono::Utc;
use leadrelay_core::{
    decode_entry, Destination, DestinationKind, DestinationName, LeadEvent, RateLimit,
};
use leadrelay_delivery::{
    conversions::bulk_outcomes, ClientConfig, DeliveryError, DestinationClient,
    HttpDestinationClient,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn destination(name: &str, kind: DestinationKind, endpoint: String, bulk: bool) -> Destination {
    Destination {
        name: DestinationName::from(name),
        kind,
        endpoint,
        rate_limit: RateLimit { tokens: 10, interval: Duration::from_secs(1) },
        timeout: Duration::from_secs(5),
        bulk,
        events: Vec::new(),
        enabled: true,
    }
}

fn facebook(endpoint: String) -> Destination {
    destination(
        "capi",
        DestinationKind::FacebookCapi {
            pixel_id: "123456".into(),
            access_token: "secret-token".into(),
            api_version: "v20.0".into(),
            test_event_code: Some("TEST42".into()),
            action_source: "chat".into(),
            event_id_salt: "salt".into(),
        },
        endpoint,
        true,
    )
}

fn lead(id: &str, destination: &str, payload: Value) -> LeadEvent {
    let body = serde_json::to_vec(&json!({ "id": id, "lead_score": 50, "payload": payload }))
        .unwrap();
    let decoded = decode_entry(&body, Utc::now()).unwrap();
    LeadEvent::from_lead(&decoded, &DestinationName::from(destination), Utc::now())
}

fn sha256(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

async fn last_body(server: &MockServer) -> (String, Value) {
    let requests = server.received_requests().await.unwrap();
    let request = requests.last().unwrap();
    let target = match request.url.query() {
        Some(query) => format!("{}?{query}", request.url.path()),
        None => request.url.path().to_string(),
    };
    (target, serde_json::from_slice(&request.body).unwrap())
}

#[tokio::test]
async fn facebook_bulk_request_hashes_personal_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v20.0/123456/events"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"events_received":2}"#))
        .expect(1)
        .mount(&server)
        .await;

    let dest = facebook(server.uri());
    let events = [
        lead(
            "a",
            "capi",
            json!({
                "schema_version": 1,
                "event_name": "Lead",
                "telegram_id": "1001",
                "user_data": { "email": " Someone@Example.com ", "phone": "+55 (11) 98765-4321", "fbp": "fb.1.abc" }
            }),
        ),
        lead(
            "b",
            "capi",
            json!({
                "schema_version": 1,
                "event_name": "Subscribe",
                "external_id": "ext-9",
                "custom_data": { "currency": "USD", "value": 19.9 }
            }),
        ),
    ];

    let client = HttpDestinationClient::with_defaults().unwrap();
    let response = client.deliver(&dest, &events, Utc::now()).await.unwrap();
    assert_eq!(response.status_code, 200);

    let (target, body) = last_body(&server).await;
    assert!(target.contains("access_token=secret-token"));
    assert!(target.contains("test_event_code=TEST42"));

    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);

    let first = &data[0];
    assert_eq!(first["event_name"], "Lead");
    assert_eq!(first["action_source"], "chat");
    assert_eq!(first["user_data"]["em"], sha256("someone@example.com"));
    assert_eq!(first["user_data"]["ph"], sha256("5511987654321"));
    assert_eq!(first["user_data"]["external_id"], sha256("1001"));
    assert_eq!(first["user_data"]["fbp"], "fb.1.abc");
    assert_eq!(first["custom_data"]["currency"], "BRL");
    assert!(first["custom_data"].get("value").is_none());
    assert_eq!(first["event_id"].as_str().unwrap().len(), 64);

    let second = &data[1];
    assert_eq!(second["event_name"], "Subscribe");
    assert_eq!(second["custom_data"]["currency"], "USD");
    assert_eq!(second["custom_data"]["value"], 19.9);
}

#[tokio::test]
async fn ga4_request_maps_event_names_and_client_ids() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mp/collect"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dest = destination(
        "ga4",
        DestinationKind::Ga4 {
            measurement_id: "G-TEST".into(),
            api_secret: "ga-secret".into(),
            client_id_prefix: "tg.".into(),
        },
        server.uri(),
        false,
    );
    let event = lead(
        "a",
        "ga4",
        json!({
            "schema_version": 1,
            "event_name": "Lead",
            "telegram_id": "77",
            "attribution": { "utm_source": "ads" }
        }),
    );

    let client = HttpDestinationClient::with_defaults().unwrap();
    client.deliver(&dest, std::slice::from_ref(&event), Utc::now()).await.unwrap();

    let (target, body) = last_body(&server).await;
    assert!(target.contains("measurement_id=G-TEST"));
    assert!(target.contains("api_secret=ga-secret"));
    assert_eq!(body["client_id"], "tg.77");
    assert_eq!(body["user_id"], "77");
    assert_eq!(body["events"][0]["name"], "generate_lead");
    assert_eq!(body["events"][0]["params"]["source"], "ads");
}

#[tokio::test]
async fn ga4_rejects_multi_event_requests_without_calling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let dest = destination(
        "ga4",
        DestinationKind::Ga4 {
            measurement_id: "G-TEST".into(),
            api_secret: "ga-secret".into(),
            client_id_prefix: String::new(),
        },
        server.uri(),
        false,
    );
    let payload = json!({ "schema_version": 1, "event_name": "Lead", "telegram_id": "1" });
    let events = [lead("a", "ga4", payload.clone()), lead("b", "ga4", payload)];

    let client = HttpDestinationClient::with_defaults().unwrap();
    let err = client.deliver(&dest, &events, Utc::now()).await.unwrap_err();

    assert!(matches!(err, DeliveryError::ConfigurationError { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn webhook_bulk_body_lists_every_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/leads"))
        .and(header("x-api-key", "k-123"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let headers = [("x-api-key".to_string(), "k-123".to_string())].into_iter().collect();
    let dest = destination(
        "hook",
        DestinationKind::Webhook { headers },
        format!("{}/hooks/leads", server.uri()),
        true,
    );
    let payload = json!({ "schema_version": 1, "event_name": "Lead", "telegram_id": "5" });
    let events = [lead("a", "hook", payload.clone()), lead("b", "hook", payload)];

    let client = HttpDestinationClient::with_defaults().unwrap();
    client.deliver(&dest, &events, Utc::now()).await.unwrap();

    let (_, body) = last_body(&server).await;
    let listed: Vec<&str> =
        body["events"].as_array().unwrap().iter().map(|e| e["event_id"].as_str().unwrap()).collect();
    assert_eq!(listed, vec!["a:hook", "b:hook"]);
    assert_eq!(body["events"][0]["payload"]["telegram_id"], "5");
}

#[tokio::test]
async fn per_destination_timeout_applies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let mut dest = destination(
        "hook",
        DestinationKind::Webhook { headers: Default::default() },
        server.uri(),
        false,
    );
    dest.timeout = Duration::from_millis(100);
    let event = lead(
        "a",
        "hook",
        json!({ "schema_version": 1, "event_name": "Lead", "telegram_id": "5" }),
    );

    let client = HttpDestinationClient::new(ClientConfig::default()).unwrap();
    let err = client.deliver(&dest, &[event], Utc::now()).await.unwrap_err();

    assert!(matches!(err, DeliveryError::Timeout { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn facebook_short_acknowledgement_fails_the_bulk_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v20.0/123456/events"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"events_received":1}"#))
        .expect(1)
        .mount(&server)
        .await;

    let dest = facebook(server.uri());
    let payload = json!({ "schema_version": 1, "event_name": "Lead", "telegram_id": "7" });
    let events = [lead("a", "capi", payload.clone()), lead("b", "capi", payload)];

    let client = HttpDestinationClient::with_defaults().unwrap();
    let response = client.deliver(&dest, &events, Utc::now()).await.unwrap();
    let outcomes = bulk_outcomes(&dest, &events, &response);

    assert_eq!(outcomes.len(), 2);
    for outcome in outcomes {
        let err = outcome.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("acknowledged 1 of 2"));
    }
}

#[tokio::test]
async fn facebook_full_acknowledgement_delivers_every_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"events_received":2}"#))
        .mount(&server)
        .await;

    let dest = facebook(server.uri());
    let payload = json!({ "schema_version": 1, "event_name": "Lead", "telegram_id": "7" });
    let events = [lead("a", "capi", payload.clone()), lead("b", "capi", payload)];

    let client = HttpDestinationClient::with_defaults().unwrap();
    let response = client.deliver(&dest, &events, Utc::now()).await.unwrap();

    assert!(bulk_outcomes(&dest, &events, &response).iter().all(Result::is_ok));
}
