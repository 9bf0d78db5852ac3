//! Request builders for the supported destination protocols.
//!
//! Personal data never leaves the process in clear text for pixel-style
//! APIs: identifiers are trimmed, lowercased and SHA-256 hashed, phone
//! numbers are reduced to digits first. Browser cookies, IP address and user
//! agent are forwarded as captured because the providers match on them raw.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use leadrelay_core::{Destination, DestinationKind, EventId, LeadEvent, LeadPayload};
use reqwest::Url;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::{
    client::DeliveryResponse,
    error::{DeliveryError, Result},
};

/// Oldest event age, in days, that pixel APIs still accept.
pub const EVENT_TIME_WINDOW_DAYS: i64 = 7;

/// Currency reported when the lead carries none.
pub const DEFAULT_CURRENCY: &str = "BRL";

/// A fully built destination request.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    /// Target URL including credentials in the query where the protocol
    /// requires them.
    pub url: Url,
    /// Extra headers.
    pub headers: BTreeMap<String, String>,
    /// JSON body.
    pub body: Value,
    /// Events carried by this request, in body order.
    pub event_ids: Vec<EventId>,
}

/// Builds one request carrying `events` for `destination`.
///
/// GA4 accepts a single event per request; callers sending to GA4 must pass
/// exactly one event.
///
/// # Errors
///
/// `ConfigurationError` for an unusable endpoint or a multi-event GA4
/// request, `InvalidPayload` for an empty event list.
pub fn build_request(
    destination: &Destination,
    events: &[LeadEvent],
    now: DateTime<Utc>,
) -> Result<OutboundRequest> {
    if events.is_empty() {
        return Err(DeliveryError::invalid_payload("request without events"));
    }
    let event_ids = events.iter().map(|e| e.id.clone()).collect();

    match &destination.kind {
        DestinationKind::FacebookCapi {
            pixel_id,
            access_token,
            api_version,
            test_event_code,
            action_source,
            event_id_salt,
        } => {
            let mut url = parse_endpoint(&destination.endpoint)?;
            url.path_segments_mut()
                .map_err(|()| DeliveryError::configuration("endpoint cannot be a base URL"))?
                .pop_if_empty()
                .extend([api_version.as_str(), pixel_id.as_str(), "events"]);
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("access_token", access_token);
                if let Some(code) = test_event_code.as_deref().filter(|c| !c.is_empty()) {
                    query.append_pair("test_event_code", code);
                }
            }

            let data: Vec<Value> = events
                .iter()
                .map(|event| facebook_event(&event.payload, action_source, event_id_salt, now))
                .collect();

            Ok(OutboundRequest {
                url,
                headers: BTreeMap::new(),
                body: json!({ "data": data }),
                event_ids,
            })
        },
        DestinationKind::Ga4 { measurement_id, api_secret, client_id_prefix } => {
            let [event] = events else {
                return Err(DeliveryError::configuration(
                    "ga4 accepts exactly one event per request",
                ));
            };

            let mut url = parse_endpoint(&destination.endpoint)?;
            url.path_segments_mut()
                .map_err(|()| DeliveryError::configuration("endpoint cannot be a base URL"))?
                .pop_if_empty()
                .extend(["mp", "collect"]);
            url.query_pairs_mut()
                .append_pair("measurement_id", measurement_id)
                .append_pair("api_secret", api_secret);

            Ok(OutboundRequest {
                url,
                headers: BTreeMap::new(),
                body: ga4_body(&event.payload, client_id_prefix),
                event_ids,
            })
        },
        DestinationKind::Webhook { headers } => {
            let url = parse_endpoint(&destination.endpoint)?;
            let items: Vec<Value> = events.iter().map(webhook_event).collect();

            Ok(OutboundRequest {
                url,
                headers: headers.clone(),
                body: json!({ "events": items }),
                event_ids,
            })
        },
    }
}

/// Reads per-event outcomes from the answer to a successful bulk request.
///
/// The conversions API reports how many events it ingested in
/// `events_received` without naming them, so a short count fails every event
/// of the call as transient. Replays carry the same dedup `event_id`, which
/// lets the provider drop the ones it already has. Webhooks answer for the
/// whole request.
pub fn bulk_outcomes(
    destination: &Destination,
    events: &[LeadEvent],
    response: &DeliveryResponse,
) -> Vec<Result<()>> {
    let accepted = match &destination.kind {
        DestinationKind::FacebookCapi { .. } => facebook_events_received(&response.body),
        DestinationKind::Ga4 { .. } | DestinationKind::Webhook { .. } => None,
    };

    match accepted {
        Some(received) if received < events.len() => {
            let error = DeliveryError::internal(format!(
                "destination acknowledged {received} of {} events",
                events.len()
            ));
            vec![Err(error); events.len()]
        },
        _ => vec![Ok(()); events.len()],
    }
}

fn facebook_events_received(body: &str) -> Option<usize> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.get("events_received")?.as_u64().and_then(|n| usize::try_from(n).ok())
}

fn parse_endpoint(endpoint: &str) -> Result<Url> {
    Url::parse(endpoint)
        .map_err(|e| DeliveryError::configuration(format!("invalid endpoint {endpoint}: {e}")))
}

/// Clamps an event timestamp into the window pixel APIs accept.
///
/// Missing or zero timestamps become `now`. Older timestamps are moved to
/// one day inside the window.
pub fn clamp_event_time(event_time: Option<i64>, now: DateTime<Utc>) -> i64 {
    let now_ts = now.timestamp();
    match event_time {
        None | Some(0) => now_ts,
        Some(ts) => {
            let oldest = now - ChronoDuration::days(EVENT_TIME_WINDOW_DAYS - 1);
            ts.max(oldest.timestamp())
        },
    }
}

fn norm(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_lowercase()
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Deterministic deduplication id for a conversion.
///
/// Identical leads reported twice within the same second hash to the same
/// id, so the provider drops the duplicate.
pub fn dedup_event_id(payload: &LeadPayload, event_time: i64, salt: &str) -> String {
    let attribution = &payload.attribution;
    let user = &payload.user_data;
    let keys = [
        norm(Some(payload.event_name.as_str())),
        norm(payload.telegram_id.as_deref()),
        norm(payload.external_id.as_deref()),
        norm(attribution.click_id.as_deref()),
        norm(user.fbp.as_deref()),
        norm(user.fbc.as_deref()),
        norm(attribution.gclid.as_deref()),
        norm(attribution.gbraid.as_deref()),
        norm(attribution.wbraid.as_deref()),
        event_time.to_string(),
        salt.to_string(),
    ];
    sha256_hex(&keys.join("|"))
}

fn insert_hashed(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    let normalized = norm(value);
    if !normalized.is_empty() {
        map.insert(key.to_string(), Value::String(sha256_hex(&normalized)));
    }
}

fn insert_raw(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        map.insert(key.to_string(), Value::String(v.to_string()));
    }
}

/// Hashed `user_data` block for pixel conversions.
pub fn hashed_user_data(payload: &LeadPayload) -> Map<String, Value> {
    let user = &payload.user_data;
    let mut map = Map::new();

    insert_hashed(&mut map, "em", user.email.as_deref());
    let digits: String =
        user.phone.as_deref().unwrap_or_default().chars().filter(char::is_ascii_digit).collect();
    if !digits.is_empty() {
        map.insert("ph".into(), Value::String(sha256_hex(&digits)));
    }
    insert_hashed(&mut map, "fn", user.first_name.as_deref());
    insert_hashed(&mut map, "ln", user.last_name.as_deref());
    insert_hashed(&mut map, "country", user.country.as_deref());
    insert_hashed(&mut map, "st", user.state.as_deref());
    insert_hashed(&mut map, "ct", user.city.as_deref());
    insert_hashed(&mut map, "zp", user.zip.as_deref());
    insert_hashed(&mut map, "external_id", payload.subject_id());

    insert_raw(&mut map, "fbp", user.fbp.as_deref());
    insert_raw(&mut map, "fbc", user.fbc.as_deref());
    insert_raw(&mut map, "client_ip_address", user.ip.as_deref());
    insert_raw(&mut map, "client_user_agent", user.user_agent.as_deref());

    map
}

fn custom_data(payload: &LeadPayload) -> Map<String, Value> {
    let custom = &payload.custom_data;
    let attribution = &payload.attribution;
    let mut map = Map::new();

    let currency = custom.currency.as_deref().filter(|c| !c.is_empty()).unwrap_or(DEFAULT_CURRENCY);
    map.insert("currency".into(), Value::String(currency.to_string()));
    if let Some(value) = custom.value.filter(|v| v.is_finite() && *v > 0.0) {
        map.insert("value".into(), json!(value));
    }
    insert_raw(&mut map, "utm_source", attribution.utm_source.as_deref());
    insert_raw(&mut map, "utm_medium", attribution.utm_medium.as_deref());
    insert_raw(&mut map, "utm_campaign", attribution.utm_campaign.as_deref());
    insert_raw(&mut map, "utm_term", attribution.utm_term.as_deref());
    insert_raw(&mut map, "utm_content", attribution.utm_content.as_deref());
    insert_raw(&mut map, "device", custom.device.as_deref());
    insert_raw(&mut map, "os", custom.os.as_deref());

    map
}

fn facebook_event(
    payload: &LeadPayload,
    action_source: &str,
    salt: &str,
    now: DateTime<Utc>,
) -> Value {
    let event_time = clamp_event_time(payload.event_time, now);
    let mut event = Map::new();
    event.insert("event_name".into(), Value::String(payload.event_name.as_str().to_string()));
    event.insert("event_time".into(), json!(event_time));
    event.insert("event_id".into(), Value::String(dedup_event_id(payload, event_time, salt)));
    event.insert("action_source".into(), Value::String(action_source.to_string()));
    insert_raw(&mut event, "event_source_url", payload.event_source_url.as_deref());
    event.insert("user_data".into(), Value::Object(hashed_user_data(payload)));
    event.insert("custom_data".into(), Value::Object(custom_data(payload)));
    Value::Object(event)
}

/// GA4 client id: click id, explicit client id, or a synthesized one.
pub fn ga4_client_id(payload: &LeadPayload, prefix: &str) -> String {
    let attribution = &payload.attribution;
    attribution
        .gclid
        .as_deref()
        .filter(|s| !s.is_empty())
        .or_else(|| attribution.client_id.as_deref().filter(|s| !s.is_empty()))
        .map_or_else(
            || format!("{prefix}{}", payload.subject_id().unwrap_or("anon")),
            str::to_string,
        )
}

fn ga4_body(payload: &LeadPayload, client_id_prefix: &str) -> Value {
    let attribution = &payload.attribution;
    let custom = &payload.custom_data;
    let mut params = Map::new();

    insert_raw(&mut params, "source", attribution.utm_source.as_deref());
    insert_raw(&mut params, "medium", attribution.utm_medium.as_deref());
    insert_raw(&mut params, "campaign", attribution.utm_campaign.as_deref());
    insert_raw(&mut params, "term", attribution.utm_term.as_deref());
    insert_raw(&mut params, "content", attribution.utm_content.as_deref());
    insert_raw(&mut params, "event_source_url", payload.event_source_url.as_deref());
    let currency = custom.currency.as_deref().filter(|c| !c.is_empty()).unwrap_or(DEFAULT_CURRENCY);
    params.insert("currency".into(), Value::String(currency.to_string()));
    if let Some(value) = custom.value.filter(|v| v.is_finite() && *v > 0.0) {
        params.insert("value".into(), json!(value));
    }
    insert_raw(&mut params, "device", custom.device.as_deref());
    insert_raw(&mut params, "os", custom.os.as_deref());

    let mut body = Map::new();
    body.insert("client_id".into(), Value::String(ga4_client_id(payload, client_id_prefix)));
    if let Some(user_id) = payload.subject_id() {
        body.insert("user_id".into(), Value::String(user_id.to_string()));
    }
    body.insert(
        "events".into(),
        json!([{ "name": payload.event_name.ga4_name(), "params": params }]),
    );
    Value::Object(body)
}

fn webhook_event(event: &LeadEvent) -> Value {
    json!({
        "event_id": event.id,
        "lead_id": event.lead_id,
        "lead_score": event.lead_score,
        "created_at": event.created_at,
        "attempt_count": event.attempt_count,
        "reprocessed": event.reprocessed,
        "payload": event.payload,
    })
}
