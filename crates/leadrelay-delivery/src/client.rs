//! HTTP client for destination calls.
//!
//! Builds the protocol request, posts it with the destination timeout and
//! turns the response into either a [`DeliveryResponse`] or a classified
//! [`DeliveryError`] the retry coordinator can act on.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadrelay_core::{Destination, LeadEvent};
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    conversions::build_request,
    error::{DeliveryError, Result},
};

const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_LOGGED_BODY_SIZE: usize = 1024;

/// Configuration for the destination HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upper bound for any request; destinations set their own shorter
    /// timeout per call.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("leadrelay/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// Successful destination response.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated when large.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

/// Sends events to a destination.
///
/// One call carries one event, or a whole batch for bulk destinations. An
/// error applies to every event in the call; per-event outcomes of a
/// successful bulk call are read with [`crate::conversions::bulk_outcomes`].
#[async_trait]
pub trait DestinationClient: Send + Sync + std::fmt::Debug + 'static {
    /// Delivers `events` to `destination`.
    ///
    /// # Errors
    ///
    /// A classified [`DeliveryError`] when the call did not succeed.
    async fn deliver(
        &self,
        destination: &Destination,
        events: &[LeadEvent],
        now: DateTime<Utc>,
    ) -> Result<DeliveryResponse>;
}

/// [`DestinationClient`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpDestinationClient {
    client: reqwest::Client,
}

impl HttpDestinationClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client })
    }

    /// Creates a client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    async fn read_response(response: Response, duration: Duration) -> DeliveryResponse {
        let status_code = response.status().as_u16();
        let headers = extract_headers(response.headers());

        let body = match response.bytes().await {
            Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
                let suffix = "... (truncated)";
                let truncated =
                    String::from_utf8_lossy(&bytes[..MAX_LOGGED_BODY_SIZE - suffix.len()]);
                format!("{truncated}{suffix}")
            },
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!("failed to read response body: {}", e);
                format!("[failed to read response body: {e}]")
            },
        };

        DeliveryResponse { status_code, headers, body, duration }
    }
}

#[async_trait]
impl DestinationClient for HttpDestinationClient {
    async fn deliver(
        &self,
        destination: &Destination,
        events: &[LeadEvent],
        now: DateTime<Utc>,
    ) -> Result<DeliveryResponse> {
        let request = build_request(destination, events, now)?;
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "destination_call",
            destination = %destination.name,
            kind = destination.kind.label(),
            events = events.len(),
            first_event_id = %request.event_ids.first().map(|id| id.as_str()).unwrap_or_default(),
        );

        async move {
            tracing::debug!(url = %redact(&request.url), "starting destination call");

            let mut http_request = self
                .client
                .post(request.url.clone())
                .timeout(destination.timeout)
                .json(&request.body);

            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }
            if let [event] = events {
                http_request = http_request
                    .header("X-Leadrelay-Event-Id", event.id.as_str())
                    .header("X-Leadrelay-Attempt", (event.attempt_count + 1).to_string());
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(destination.timeout));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let response = Self::read_response(response, start_time.elapsed()).await;
            tracing::debug!(
                status = response.status_code,
                duration_ms = response.duration.as_millis(),
                "received response"
            );

            classify_response(response)
        }
        .instrument(span)
        .await
    }
}

/// Maps a destination response to success or a classified error.
///
/// # Errors
///
/// Any non-2xx status.
pub fn classify_response(response: DeliveryResponse) -> Result<DeliveryResponse> {
    match response.status_code {
        200..=299 => {
            tracing::info!("destination accepted events");
            Ok(response)
        },
        429 => {
            let retry_after = extract_retry_after_seconds(&response.headers).unwrap_or(60);
            tracing::warn!(retry_after, "destination rate limited");
            Err(DeliveryError::rate_limited(retry_after))
        },
        status @ 400..=499 => {
            tracing::warn!(status, body = %response.body, "client error response");
            Err(DeliveryError::client_error(status, response.body))
        },
        status @ 500..=599 => {
            tracing::warn!(status, "server error response");
            Err(DeliveryError::server_error(status, response.body))
        },
        status => {
            tracing::warn!(status, "unexpected status code");
            Err(DeliveryError::network(format!("unexpected status code {status}")))
        },
    }
}

fn redact(url: &reqwest::Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }

    headers
}

/// Headers the client sets itself and never copies from configuration.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Extracts retry-after delay from response headers.
///
/// Supports both seconds format and HTTP-date format. Returns the delay in
/// seconds, or a default value (60s) if parsing fails.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<u64> {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    let retry_after = headers.get("retry-after").or_else(|| headers.get("Retry-After"))?;
    if let Ok(seconds) = retry_after.trim().parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date_time) = DateTime::parse_from_rfc2822(retry_after) {
        let now = Utc::now();
        let retry_time = date_time.with_timezone(&Utc);
        if retry_time > now {
            if let Ok(std_duration) = retry_time.signed_duration_since(now).to_std() {
                return Some(std_duration.as_secs());
            }
        }
    }

    Some(DEFAULT_RETRY_AFTER)
}
