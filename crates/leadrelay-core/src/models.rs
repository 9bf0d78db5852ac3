//! Core domain models and strongly-typed identifiers.
//!
//! Defines lead events, their delivery lifecycle, dead-letter entries and
//! destination configuration. Includes database serialization traits and
//! the state transition rules every store enforces.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::{ConversionEvent, DecodedLead, LeadPayload};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed event identifier.
///
/// One lead produces one event per destination, so the identifier is the
/// composite `"{lead_id}:{destination}"`. It is the deduplication key for the
/// whole pipeline.
///
/// # Example
///
/// ```
/// use leadrelay_core::models::EventId;
/// let id = EventId::for_destination("lead-1", "capi");
/// assert_eq!(id.as_str(), "lead-1:capi");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Builds the identifier of a lead's event for one destination.
    pub fn for_destination(lead_id: &str, destination: &str) -> Self {
        Self(format!("{lead_id}:{destination}"))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Name of a configured destination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationName(pub String);

impl DestinationName {
    /// Borrow the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Event lifecycle status.
///
/// ```text
/// pending -> in_flight -> delivered
///    ^          |
///    |          +-----> pending (retry, capacity, stale recovery)
///    |          +-----> dead
///    +--------------------- dead (operator reprocess)
/// ```
///
/// `delivered` is terminal. The only way out of `dead` is an explicit
/// reprocess. Every [`StatusUpdate`] also names the statuses it may start
/// from, so two updates with the same target are not interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Durably recorded and waiting for a batch.
    Pending,
    /// Selected into a batch; an external call may be running.
    InFlight,
    /// Accepted by the destination. Terminal.
    Delivered,
    /// Moved to the dead-letter queue.
    Dead,
}

impl EventStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Pending, Self::InFlight, Self::Delivered, Self::Dead];

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Pending | Self::Delivered | Self::Dead)
                | (Self::Dead, Self::Pending)
        )
    }

    /// String form used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "delivered" => Ok(Self::Delivered),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("invalid event status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for EventStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeouts, network errors, 5xx and 429 responses.
    Transient,
    /// 4xx responses and payloads the destination rejects.
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// Why an entry ended up in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Queue entry could not be decoded.
    Decode,
    /// Destination rejected the event permanently.
    Permanent,
    /// Transient failures exhausted the attempt budget.
    RetriesExhausted,
}

impl ErrorClass {
    /// String form used in storage and filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Permanent => "permanent",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decode" => Ok(Self::Decode),
            "permanent" => Ok(Self::Permanent),
            "retries_exhausted" => Ok(Self::RetriesExhausted),
            _ => Err(format!("invalid error class: {s}")),
        }
    }
}

/// Scheduling state of an event waiting for its next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    /// Earliest time the event may be selected again.
    pub next_attempt_at: DateTime<Utc>,
    /// Un-jittered backoff that produced `next_attempt_at`.
    pub backoff_interval: Duration,
    /// Error of the attempt that scheduled this retry.
    pub last_error: String,
}

/// One failed delivery attempt, kept for the dead-letter history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt number, 1-based.
    pub attempt: u32,
    /// Error returned by the destination or transport.
    pub error: String,
    /// Classification of the error.
    pub failure_class: FailureClass,
    /// When the attempt failed.
    pub at: DateTime<Utc>,
}

/// A lead routed to one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadEvent {
    /// Unique identifier, see [`EventId::for_destination`].
    pub id: EventId,
    /// Producer-assigned lead identifier.
    pub lead_id: String,
    /// Destination this event is delivered to.
    pub destination: DestinationName,
    /// Business priority; higher is delivered first.
    pub lead_score: f64,
    /// Validated payload.
    pub payload: LeadPayload,
    /// When the producer created the lead.
    pub created_at: DateTime<Utc>,
    /// Failed delivery attempts counted against the retry budget.
    pub attempt_count: u32,
    /// Current lifecycle status.
    pub status: EventStatus,
    /// Present while the event waits for a retry.
    pub retry: Option<RetryState>,
    /// Set once an operator or the scheduler replayed the event from the DLQ.
    pub reprocessed: bool,
    /// Failed attempts, oldest first.
    pub history: Vec<AttemptRecord>,
    /// Last time the record was written.
    pub updated_at: DateTime<Utc>,
}

impl LeadEvent {
    /// Creates the pending event of `lead` for `destination`.
    pub fn from_lead(lead: &DecodedLead, destination: &DestinationName, now: DateTime<Utc>) -> Self {
        Self {
            id: EventId::for_destination(&lead.lead_id, destination.as_str()),
            lead_id: lead.lead_id.clone(),
            destination: destination.clone(),
            lead_score: lead.lead_score,
            payload: lead.payload.clone(),
            created_at: lead.created_at,
            attempt_count: 0,
            status: EventStatus::Pending,
            retry: None,
            reprocessed: false,
            history: Vec::new(),
            updated_at: now,
        }
    }

    /// Earliest time the event may be selected, if it is waiting for a retry.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.retry.as_ref().map(|r| r.next_attempt_at)
    }

    /// Applies `update` to this record.
    ///
    /// Callers check the transition first; this only copies fields.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        if let Some(attempt_count) = update.attempt_count {
            self.attempt_count = attempt_count;
        }
        self.retry = update.retry.clone();
        if let Some(reprocessed) = update.reprocessed {
            self.reprocessed = reprocessed;
        }
        if let Some(record) = &update.record_attempt {
            self.history.push(record.clone());
        }
        self.updated_at = now;
    }
}

/// Field changes accompanying a status transition.
///
/// `retry` always overwrites the stored retry state, so every transition
/// other than a scheduled retry clears it.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// Target status.
    pub status: EventStatus,
    /// Statuses the record must be in for the update to apply.
    pub from: &'static [EventStatus],
    /// New attempt count, if it changes.
    pub attempt_count: Option<u32>,
    /// Retry state after the transition.
    pub retry: Option<RetryState>,
    /// New reprocessed flag, if it changes.
    pub reprocessed: Option<bool>,
    /// Failed attempt to append to the history.
    pub record_attempt: Option<AttemptRecord>,
}

impl StatusUpdate {
    fn to(status: EventStatus, from: &'static [EventStatus]) -> Self {
        Self {
            status,
            from,
            attempt_count: None,
            retry: None,
            reprocessed: None,
            record_attempt: None,
        }
    }

    /// Whether the update applies to a record currently in `current`.
    pub fn applies_to(&self, current: EventStatus) -> bool {
        self.from.contains(&current) && current.can_transition_to(self.status)
    }

    /// Event selected into a batch.
    pub fn in_flight() -> Self {
        Self::to(EventStatus::InFlight, &[EventStatus::Pending])
    }

    /// Destination accepted the event.
    pub fn delivered() -> Self {
        Self::to(EventStatus::Delivered, &[EventStatus::InFlight])
    }

    /// Event returned to the working set without consuming an attempt.
    pub fn released() -> Self {
        Self::to(EventStatus::Pending, &[EventStatus::InFlight])
    }

    /// Transient failure with attempts left.
    pub fn retry_scheduled(attempt_count: u32, retry: RetryState, record: AttemptRecord) -> Self {
        Self {
            attempt_count: Some(attempt_count),
            retry: Some(retry),
            record_attempt: Some(record),
            ..Self::to(EventStatus::Pending, &[EventStatus::InFlight])
        }
    }

    /// Event moved to the dead-letter queue.
    pub fn dead(attempt_count: u32, record: AttemptRecord) -> Self {
        Self {
            attempt_count: Some(attempt_count),
            record_attempt: Some(record),
            ..Self::to(EventStatus::Dead, &[EventStatus::InFlight])
        }
    }

    /// Event replayed from the dead-letter queue.
    pub fn reprocess() -> Self {
        Self {
            attempt_count: Some(0),
            reprocessed: Some(true),
            ..Self::to(EventStatus::Pending, &[EventStatus::Dead])
        }
    }
}

/// Result of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed; a pending one was created.
    Inserted,
    /// A pending record existed and its payload was overwritten.
    Refreshed,
    /// A record past `pending` existed and was left untouched.
    Unchanged(EventStatus),
}

impl UpsertOutcome {
    /// Whether the event should be handed to the batcher.
    pub fn should_forward(&self) -> bool {
        matches!(self, Self::Inserted | Self::Refreshed)
    }
}

/// Number of stored events per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Pending events.
    pub pending: u64,
    /// In-flight events.
    pub in_flight: u64,
    /// Delivered events.
    pub delivered: u64,
    /// Dead events.
    pub dead: u64,
}

impl StatusCounts {
    /// Increments the counter of `status`.
    pub fn add(&mut self, status: EventStatus, count: u64) {
        match status {
            EventStatus::Pending => self.pending += count,
            EventStatus::InFlight => self.in_flight += count,
            EventStatus::Delivered => self.delivered += count,
            EventStatus::Dead => self.dead += count,
        }
    }
}

/// An entry of the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Entry identifier.
    pub id: Uuid,
    /// Dead event, absent for undecodable queue entries.
    pub event_id: Option<EventId>,
    /// Destination of the dead event.
    pub destination: Option<DestinationName>,
    /// Lead of the dead event.
    pub lead_id: Option<String>,
    /// Failure category.
    pub error_class: ErrorClass,
    /// Human-readable reason.
    pub reason: String,
    /// Last raw error.
    pub last_error: String,
    /// Attempts made before dying.
    pub attempt_count: u32,
    /// Failed attempts, oldest first.
    pub attempt_history: Vec<AttemptRecord>,
    /// Original queue entry for undecodable messages.
    pub raw_entry: Option<String>,
    /// When the entry was (last) dead-lettered.
    pub dead_at: DateTime<Utc>,
    /// How many times the entry was replayed.
    pub reprocess_count: u32,
    /// Last replay time.
    pub last_reprocessed_at: Option<DateTime<Utc>>,
}

/// Selection of dead-letter entries for listing or replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    /// Only entries dead for at least this long.
    pub min_age: Option<Duration>,
    /// Only entries dead for at most this long.
    pub max_age: Option<Duration>,
    /// Only entries of this destination.
    pub destination: Option<DestinationName>,
    /// Only entries of this class.
    pub error_class: Option<ErrorClass>,
    /// Only entries replayed fewer than this many times.
    pub max_reprocess_count: Option<u32>,
    /// Maximum number of entries returned.
    pub limit: usize,
}

impl Default for DeadLetterFilter {
    fn default() -> Self {
        Self {
            min_age: None,
            max_age: None,
            destination: None,
            error_class: None,
            max_reprocess_count: None,
            limit: 100,
        }
    }
}

impl DeadLetterFilter {
    /// Whether `entry` is selected at time `now`.
    pub fn matches(&self, entry: &DeadLetter, now: DateTime<Utc>) -> bool {
        let age = (now - entry.dead_at).to_std().unwrap_or_default();
        self.min_age.map_or(true, |min| age >= min)
            && self.max_age.map_or(true, |max| age <= max)
            && self.destination.as_ref().map_or(true, |d| entry.destination.as_ref() == Some(d))
            && self.error_class.map_or(true, |c| entry.error_class == c)
            && self.max_reprocess_count.map_or(true, |max| entry.reprocess_count < max)
    }
}

/// Token bucket parameters: `tokens` per `interval`, bursting up to `tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Tokens added per interval, also the bucket capacity.
    pub tokens: u32,
    /// Refill interval.
    pub interval: Duration,
}

impl RateLimit {
    /// Sustained rate in tokens per second.
    pub fn per_second(&self) -> f64 {
        f64::from(self.tokens) / self.interval.as_secs_f64().max(f64::EPSILON)
    }
}

/// Destination protocol and credentials.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationKind {
    /// Pixel conversions API.
    FacebookCapi {
        /// Pixel identifier.
        pixel_id: String,
        /// System user access token.
        access_token: String,
        /// Graph API version, e.g. `v20.0`.
        api_version: String,
        /// Test event code routing events to the test console.
        test_event_code: Option<String>,
        /// Reported action source.
        action_source: String,
        /// Salt mixed into deterministic deduplication ids.
        event_id_salt: String,
    },
    /// GA4 measurement protocol.
    Ga4 {
        /// Measurement stream identifier.
        measurement_id: String,
        /// Measurement protocol secret.
        api_secret: String,
        /// Prefix for synthesized client ids.
        client_id_prefix: String,
    },
    /// Generic JSON webhook.
    Webhook {
        /// Extra headers sent with every request.
        headers: BTreeMap<String, String>,
    },
}

impl DestinationKind {
    /// Short protocol name for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::FacebookCapi { .. } => "facebook_capi",
            Self::Ga4 { .. } => "ga4",
            Self::Webhook { .. } => "webhook",
        }
    }

    /// Whether the protocol accepts several events per request.
    pub fn supports_bulk(&self) -> bool {
        !matches!(self, Self::Ga4 { .. })
    }
}

impl fmt::Debug for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FacebookCapi { pixel_id, api_version, test_event_code, .. } => f
                .debug_struct("FacebookCapi")
                .field("pixel_id", pixel_id)
                .field("access_token", &"***")
                .field("api_version", api_version)
                .field("test_event_code", test_event_code)
                .finish_non_exhaustive(),
            Self::Ga4 { measurement_id, .. } => f
                .debug_struct("Ga4")
                .field("measurement_id", measurement_id)
                .field("api_secret", &"***")
                .finish_non_exhaustive(),
            Self::Webhook { headers } => {
                f.debug_struct("Webhook").field("headers", &headers.keys()).finish()
            },
        }
    }
}

/// An external conversion-tracking API. Static for the life of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    /// Unique destination name.
    pub name: DestinationName,
    /// Protocol and credentials.
    pub kind: DestinationKind,
    /// Base URL (protocol-specific paths are appended) or full webhook URL.
    pub endpoint: String,
    /// Request budget.
    pub rate_limit: RateLimit,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Send a whole batch in one request.
    pub bulk: bool,
    /// Conversion events routed here; empty routes every event.
    pub events: Vec<ConversionEvent>,
    /// Disabled destinations receive nothing.
    pub enabled: bool,
}

impl Destination {
    /// Whether events of kind `event` are routed to this destination.
    pub fn accepts(&self, event: ConversionEvent) -> bool {
        self.enabled && (self.events.is_empty() || self.events.contains(&event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_is_terminal() {
        for next in EventStatus::ALL {
            assert!(!EventStatus::Delivered.can_transition_to(next));
        }
    }

    #[test]
    fn dead_only_leaves_through_reprocess() {
        assert!(EventStatus::Dead.can_transition_to(EventStatus::Pending));
        assert!(!EventStatus::Dead.can_transition_to(EventStatus::InFlight));
        assert!(!EventStatus::Dead.can_transition_to(EventStatus::Delivered));
    }

    #[test]
    fn updates_name_their_source_status() {
        assert!(StatusUpdate::in_flight().applies_to(EventStatus::Pending));
        assert!(!StatusUpdate::in_flight().applies_to(EventStatus::Dead));

        for update in [StatusUpdate::released(), StatusUpdate::delivered()] {
            assert!(update.applies_to(EventStatus::InFlight));
            assert!(!update.applies_to(EventStatus::Dead));
            assert!(!update.applies_to(EventStatus::Pending));
        }

        assert!(StatusUpdate::reprocess().applies_to(EventStatus::Dead));
        assert!(!StatusUpdate::reprocess().applies_to(EventStatus::Pending));
        assert!(!StatusUpdate::reprocess().applies_to(EventStatus::InFlight));
    }

    #[test]
    fn update_sources_stay_inside_the_lifecycle() {
        let updates = [
            StatusUpdate::in_flight(),
            StatusUpdate::delivered(),
            StatusUpdate::released(),
            StatusUpdate::reprocess(),
        ];
        for update in updates {
            for from in update.from {
                assert!(from.can_transition_to(update.status), "{from} -> {}", update.status);
            }
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in EventStatus::ALL {
            assert_eq!(status.as_str().parse::<EventStatus>(), Ok(status));
        }
        assert!("delivering".parse::<EventStatus>().is_err());
    }

    #[test]
    fn reprocess_update_resets_attempts() {
        let update = StatusUpdate::reprocess();
        assert_eq!(update.status, EventStatus::Pending);
        assert_eq!(update.attempt_count, Some(0));
        assert_eq!(update.reprocessed, Some(true));
        assert!(update.retry.is_none());
    }

    #[test]
    fn filter_matches_age_and_class() {
        let now = Utc::now();
        let entry = DeadLetter {
            id: Uuid::new_v4(),
            event_id: Some(EventId::from("abc:capi")),
            destination: Some(DestinationName::from("capi")),
            lead_id: Some("abc".into()),
            error_class: ErrorClass::RetriesExhausted,
            reason: "retries exhausted".into(),
            last_error: "server error: HTTP 500".into(),
            attempt_count: 3,
            attempt_history: Vec::new(),
            raw_entry: None,
            dead_at: now - chrono::Duration::minutes(10),
            reprocess_count: 1,
            last_reprocessed_at: None,
        };

        assert!(DeadLetterFilter::default().matches(&entry, now));
        assert!(DeadLetterFilter { min_age: Some(Duration::from_secs(300)), ..Default::default() }
            .matches(&entry, now));
        assert!(!DeadLetterFilter { max_age: Some(Duration::from_secs(60)), ..Default::default() }
            .matches(&entry, now));
        assert!(!DeadLetterFilter { error_class: Some(ErrorClass::Decode), ..Default::default() }
            .matches(&entry, now));
        assert!(!DeadLetterFilter {
            destination: Some(DestinationName::from("ga4")),
            ..Default::default()
        }
        .matches(&entry, now));
        assert!(!DeadLetterFilter { max_reprocess_count: Some(1), ..Default::default() }
            .matches(&entry, now));
    }

    #[test]
    fn destination_routes_configured_events() {
        let destination = Destination {
            name: DestinationName::from("ga4"),
            kind: DestinationKind::Ga4 {
                measurement_id: "G-1".into(),
                api_secret: "secret".into(),
                client_id_prefix: "tlgrm-".into(),
            },
            endpoint: "https://www.google-analytics.com".into(),
            rate_limit: RateLimit { tokens: 10, interval: Duration::from_secs(1) },
            timeout: Duration::from_secs(20),
            bulk: false,
            events: vec![ConversionEvent::Lead],
            enabled: true,
        };

        assert!(destination.accepts(ConversionEvent::Lead));
        assert!(!destination.accepts(ConversionEvent::Subscribe));
        assert!(!format!("{:?}", destination.kind).contains("secret"));
    }
}
