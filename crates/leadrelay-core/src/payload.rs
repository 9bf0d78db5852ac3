//! Versioned lead payload schema and queue entry decoding.
//!
//! Producers append JSON entries of the form:
//!
//! ```json
//! {
//!   "id": "lead-8812",
//!   "lead_score": 90,
//!   "created_at": "2026-03-01T12:00:00Z",
//!   "payload": { "schema_version": 1, "event_name": "Lead", "telegram_id": "8812" }
//! }
//! ```
//!
//! Decoding is strict: unknown fields, unknown schema versions, unknown
//! event names and failed validations all produce a [`DecodeError`], which
//! the consumer treats as a poison message.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Schema versions this build can decode.
pub const SUPPORTED_SCHEMA_VERSIONS: &[u64] = &[1];

/// Upper bound on lead identifier length.
pub const MAX_LEAD_ID_LEN: usize = 128;

/// Conversion event kinds forwarded to destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversionEvent {
    /// A user entered the funnel.
    Lead,
    /// A user subscribed to the paid tier.
    Subscribe,
}

impl ConversionEvent {
    /// Name used by pixel-style conversion APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lead => "Lead",
            Self::Subscribe => "Subscribe",
        }
    }

    /// Name used by the GA4 measurement protocol.
    pub fn ga4_name(&self) -> &'static str {
        match self {
            Self::Lead => "generate_lead",
            Self::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for ConversionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Personal data captured by the bot. Hashed before leaving the process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserData {
    /// Email address.
    pub email: Option<String>,
    /// Phone number in any format; digits are extracted before hashing.
    pub phone: Option<String>,
    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Chat username.
    pub username: Option<String>,
    /// ISO country code.
    pub country: Option<String>,
    /// State or region.
    pub state: Option<String>,
    /// City.
    pub city: Option<String>,
    /// Postal code.
    pub zip: Option<String>,
    /// Browser pixel cookie.
    pub fbp: Option<String>,
    /// Click identifier cookie.
    pub fbc: Option<String>,
    /// Client IP address.
    pub ip: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Whether the user has a premium chat account.
    #[serde(default)]
    pub premium: bool,
}

/// Campaign attribution captured from the landing page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Attribution {
    /// Generic click identifier.
    pub click_id: Option<String>,
    /// Google click identifier.
    pub gclid: Option<String>,
    /// Google app click identifier.
    pub gbraid: Option<String>,
    /// Google web click identifier.
    pub wbraid: Option<String>,
    /// GA4 client identifier.
    pub client_id: Option<String>,
    /// UTM source.
    pub utm_source: Option<String>,
    /// UTM medium.
    pub utm_medium: Option<String>,
    /// UTM campaign.
    pub utm_campaign: Option<String>,
    /// UTM term.
    pub utm_term: Option<String>,
    /// UTM content.
    pub utm_content: Option<String>,
}

/// Commercial and device context for the conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomData {
    /// ISO currency code.
    pub currency: Option<String>,
    /// Conversion value.
    pub value: Option<f64>,
    /// Device family.
    pub device: Option<String>,
    /// Operating system.
    pub os: Option<String>,
    /// Number of previous subscriptions by this user.
    #[serde(default)]
    pub subscribe_count: u32,
}

/// Lead payload, schema version 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeadPayload {
    /// Schema version tag. Always one of [`SUPPORTED_SCHEMA_VERSIONS`].
    pub schema_version: u64,
    /// Conversion being reported.
    pub event_name: ConversionEvent,
    /// Chat platform user identifier.
    pub telegram_id: Option<String>,
    /// Identifier in the operator's own systems.
    pub external_id: Option<String>,
    /// Unix timestamp of the conversion.
    pub event_time: Option<i64>,
    /// Page where the conversion originated.
    pub event_source_url: Option<String>,
    /// Personal data.
    #[serde(default)]
    pub user_data: UserData,
    /// Campaign attribution.
    #[serde(default)]
    pub attribution: Attribution,
    /// Commercial context.
    #[serde(default)]
    pub custom_data: CustomData,
}

impl LeadPayload {
    /// Identifier used for cross-destination user matching.
    pub fn subject_id(&self) -> Option<&str> {
        self.external_id.as_deref().or(self.telegram_id.as_deref()).filter(|s| !s.is_empty())
    }
}

/// Computes the business priority of a lead from its profile.
///
/// Used when the producer does not supply `lead_score` explicitly.
pub fn priority_score(payload: &LeadPayload) -> f64 {
    let user = &payload.user_data;
    let mut score = 0.0;
    if user.username.as_deref().is_some_and(|s| !s.is_empty()) {
        score += 2.0;
    }
    if user.first_name.as_deref().is_some_and(|s| !s.is_empty()) {
        score += 1.0;
    }
    if user.premium {
        score += 3.0;
    }
    if user.country.as_deref().is_some_and(|s| !s.is_empty()) {
        score += 1.0;
    }
    if payload.external_id.as_deref().is_some_and(|s| !s.is_empty()) {
        score += 2.0;
    }
    score + f64::from(payload.custom_data.subscribe_count) * 3.0
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    id: String,
    lead_score: Option<f64>,
    created_at: Option<DateTime<Utc>>,
    payload: serde_json::Value,
}

/// A queue entry that passed decoding and validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLead {
    /// Producer-assigned lead identifier.
    pub lead_id: String,
    /// Business priority; higher is delivered first.
    pub lead_score: f64,
    /// When the producer created the lead.
    pub created_at: DateTime<Utc>,
    /// Validated payload.
    pub payload: LeadPayload,
}

/// Decodes and validates a raw queue entry.
///
/// `received_at` is used as `created_at` when the producer omitted it.
///
/// # Errors
///
/// Returns a [`DecodeError`] for anything that is not a well-formed,
/// supported lead entry.
pub fn decode_entry(body: &[u8], received_at: DateTime<Utc>) -> Result<DecodedLead, DecodeError> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let version = match envelope.payload.get("schema_version") {
        None => return Err(DecodeError::MissingSchemaVersion),
        Some(value) => value.as_u64().ok_or_else(|| {
            DecodeError::invalid("schema_version", "must be a non-negative integer")
        })?,
    };
    if !SUPPORTED_SCHEMA_VERSIONS.contains(&version) {
        return Err(DecodeError::UnsupportedSchemaVersion(version));
    }

    let payload: LeadPayload = serde_json::from_value(envelope.payload)
        .map_err(|e| DecodeError::Shape { version, message: e.to_string() })?;

    let lead_id = envelope.id.trim().to_string();
    if lead_id.is_empty() {
        return Err(DecodeError::invalid("id", "must not be empty"));
    }
    if lead_id.len() > MAX_LEAD_ID_LEN {
        return Err(DecodeError::invalid("id", format!("longer than {MAX_LEAD_ID_LEN} bytes")));
    }
    if payload.subject_id().is_none() {
        return Err(DecodeError::invalid(
            "payload",
            "one of telegram_id or external_id is required",
        ));
    }

    let lead_score = match envelope.lead_score {
        Some(score) if !score.is_finite() => {
            return Err(DecodeError::invalid("lead_score", "must be finite"));
        },
        Some(score) => score,
        None => priority_score(&payload),
    };

    Ok(DecodedLead {
        lead_id,
        lead_score,
        created_at: envelope.created_at.unwrap_or(received_at),
        payload,
    })
}
