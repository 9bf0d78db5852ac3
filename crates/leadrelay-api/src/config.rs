//! Configuration management for the leadrelay service.

use std::{collections::BTreeSet, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use leadrelay_core::{
    ConversionEvent, Destination, DestinationKind, DestinationName, PayloadCipher, RateLimit,
};
use leadrelay_delivery::{
    BatchConfig, ClientConfig, ConsumerConfig, PipelineConfig, RetryPolicy, SchedulerConfig,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "leadrelay.toml";

/// Default base URL of the pixel conversions API.
pub const FACEBOOK_GRAPH_ENDPOINT: &str = "https://graph.facebook.com";

/// Default base URL of the GA4 measurement protocol.
pub const GA4_ENDPOINT: &str = "https://www.google-analytics.com";

/// Where events, dead letters and the queue are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// PostgreSQL tables.
    Postgres,
    /// Process memory; lost on restart.
    Memory,
}

/// One `[[destinations]]` entry of the configuration file.
///
/// Protocol fields sit next to the common ones:
///
/// ```toml
/// [[destinations]]
/// name = "capi"
/// kind = "facebook_capi"
/// pixel_id = "1234"
/// access_token = "..."
/// api_version = "v20.0"
/// action_source = "website"
/// event_id_salt = "..."
/// rate_limit_tokens = 50
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Unique destination name.
    pub name: String,
    /// Protocol and credentials.
    #[serde(flatten)]
    pub kind: DestinationKind,
    /// Base URL, or the full URL for webhooks. Pixel and GA4 destinations
    /// default to the public endpoints.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Requests allowed per `rate_limit_interval_ms`, also the burst size.
    #[serde(default = "default_rate_limit_tokens")]
    pub rate_limit_tokens: u32,
    /// Token refill interval in milliseconds.
    #[serde(default = "default_rate_limit_interval_ms")]
    pub rate_limit_interval_ms: u64,
    /// Per-call timeout in milliseconds.
    #[serde(default = "default_destination_timeout_ms")]
    pub timeout_ms: u64,
    /// Send whole batches in one request where the protocol allows it.
    #[serde(default)]
    pub bulk: bool,
    /// Conversion events routed here; empty routes every event.
    #[serde(default)]
    pub events: Vec<ConversionEvent>,
    /// Disabled destinations receive nothing.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl DestinationConfig {
    /// Resolves the endpoint and converts into the pipeline's type.
    ///
    /// # Errors
    ///
    /// Webhook destinations without an endpoint.
    pub fn to_destination(&self) -> Result<Destination> {
        let endpoint = match (&self.endpoint, &self.kind) {
            (Some(endpoint), _) if !endpoint.trim().is_empty() => endpoint.clone(),
            (_, DestinationKind::FacebookCapi { .. }) => FACEBOOK_GRAPH_ENDPOINT.to_string(),
            (_, DestinationKind::Ga4 { .. }) => GA4_ENDPOINT.to_string(),
            (_, DestinationKind::Webhook { .. }) => {
                anyhow::bail!("destination {} needs an endpoint", self.name)
            },
        };

        Ok(Destination {
            name: DestinationName::from(self.name.as_str()),
            kind: self.kind.clone(),
            endpoint,
            rate_limit: RateLimit {
                tokens: self.rate_limit_tokens,
                interval: Duration::from_millis(self.rate_limit_interval_ms),
            },
            timeout: Duration::from_millis(self.timeout_ms),
            bulk: self.bulk,
            events: self.events.clone(),
            enabled: self.enabled,
        })
    }
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`leadrelay.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Destinations are listed in the file. A pixel destination named `capi`
/// is also synthesized from `FB_PIXEL_ID` + `FB_ACCESS_TOKEN`, and a GA4
/// destination named `ga4` from `GA4_MEASUREMENT_ID` + `GA4_API_SECRET`.
///
/// # Example
///
/// ```no_run
/// use leadrelay_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
/// println!("Admin server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Storage
    /// Storage backend, `postgres` or `memory`.
    ///
    /// Environment variable: `STORE_BACKEND`
    #[serde(default = "default_store_backend", alias = "STORE_BACKEND")]
    pub store_backend: StoreBackend,
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Database connection idle timeout in seconds.
    ///
    /// Environment variable: `DATABASE_IDLE_TIMEOUT`
    #[serde(default = "default_idle_timeout", alias = "DATABASE_IDLE_TIMEOUT")]
    pub database_idle_timeout: u64,
    /// Maximum lifetime of database connections in seconds.
    ///
    /// Environment variable: `DATABASE_MAX_LIFETIME`
    #[serde(default = "default_max_lifetime", alias = "DATABASE_MAX_LIFETIME")]
    pub database_max_lifetime: u64,
    /// Connection attempts at startup before giving up.
    ///
    /// Environment variable: `DATABASE_CONNECT_RETRIES`
    #[serde(default = "default_connect_retries", alias = "DATABASE_CONNECT_RETRIES")]
    pub database_connect_retries: u32,

    // Admin server
    /// Admin server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Admin server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// Admin request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,
    /// Bearer token guarding admin routes. Unset leaves them open.
    ///
    /// Environment variable: `ADMIN_TOKEN`
    #[serde(default, alias = "ADMIN_TOKEN")]
    pub admin_token: Option<String>,
    /// Secret that encrypts lead personal data stored in PostgreSQL.
    /// Unset stores it in plaintext.
    ///
    /// Environment variable: `CRYPTO_KEY`
    #[serde(default, alias = "CRYPTO_KEY")]
    pub crypto_key: Option<String>,

    // Consumers and senders
    /// Durable queue partitions, one consumer each.
    ///
    /// Environment variable: `PARTITIONS`
    #[serde(default = "default_partitions", alias = "PARTITIONS")]
    pub partitions: u32,
    /// Name recorded on partition leases.
    ///
    /// Environment variable: `CONSUMER_NAME`
    #[serde(default = "default_consumer_name", alias = "CONSUMER_NAME")]
    pub consumer_name: String,
    /// Queue entries read per poll.
    ///
    /// Environment variable: `READ_BATCH_SIZE`
    #[serde(default = "default_read_batch_size", alias = "READ_BATCH_SIZE")]
    pub read_batch_size: usize,
    /// Wait between polls of an empty partition in milliseconds.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,
    /// Concurrent senders per destination.
    ///
    /// Environment variable: `SENDERS_PER_DESTINATION`
    #[serde(default = "default_senders", alias = "SENDERS_PER_DESTINATION")]
    pub senders_per_destination: usize,

    // Batching
    /// Events per batch.
    ///
    /// Environment variable: `MAX_BATCH_SIZE`
    #[serde(default = "default_max_batch_size", alias = "MAX_BATCH_SIZE")]
    pub max_batch_size: usize,
    /// Longest a ready event waits before its batch closes, in milliseconds.
    ///
    /// Environment variable: `MAX_BATCH_AGE_MS`
    #[serde(default = "default_max_batch_age_ms", alias = "MAX_BATCH_AGE_MS")]
    pub max_batch_age_ms: u64,
    /// Delivery deadline of a closed batch in milliseconds.
    ///
    /// Environment variable: `BATCH_TIMEOUT_MS`
    #[serde(default = "default_batch_timeout_ms", alias = "BATCH_TIMEOUT_MS")]
    pub batch_timeout_ms: u64,
    /// Events each destination's batcher holds before refusing new ones.
    ///
    /// Environment variable: `BATCHER_CAPACITY`
    #[serde(default = "default_batcher_capacity", alias = "BATCHER_CAPACITY")]
    pub batcher_capacity: usize,

    // Retry
    /// Counted failures before an event is dead-lettered.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "MAX_ATTEMPTS")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor", alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,

    // Client
    /// Upper bound for any destination request in seconds.
    ///
    /// Environment variable: `HTTP_TIMEOUT_SECONDS`
    #[serde(default = "default_http_timeout", alias = "HTTP_TIMEOUT_SECONDS")]
    pub http_timeout_seconds: u64,

    // Scheduler
    /// Seconds between housekeeping ticks.
    ///
    /// Environment variable: `TICK_INTERVAL_SECONDS`
    #[serde(default = "default_tick_interval", alias = "TICK_INTERVAL_SECONDS")]
    pub tick_interval_seconds: u64,
    /// Whether ticks replay dead letters that look transient.
    ///
    /// Environment variable: `AUTO_REPROCESS`
    #[serde(default = "default_true", alias = "AUTO_REPROCESS")]
    pub auto_reprocess: bool,
    /// Minimum dead-letter age for scheduled replay, in seconds.
    ///
    /// Environment variable: `AUTO_REPROCESS_MIN_AGE_SECONDS`
    #[serde(default = "default_auto_reprocess_min_age", alias = "AUTO_REPROCESS_MIN_AGE_SECONDS")]
    pub auto_reprocess_min_age_seconds: u64,
    /// Scheduled replays per dead-letter entry.
    ///
    /// Environment variable: `AUTO_REPROCESS_MAX`
    #[serde(default = "default_auto_reprocess_max", alias = "AUTO_REPROCESS_MAX")]
    pub auto_reprocess_max: u32,
    /// In-flight records untouched this many seconds return to pending.
    ///
    /// Environment variable: `STALE_IN_FLIGHT_SECONDS`
    #[serde(default = "default_stale_in_flight", alias = "STALE_IN_FLIGHT_SECONDS")]
    pub stale_in_flight_seconds: u64,
    /// Unacknowledged queue entries idle this many seconds are redelivered.
    ///
    /// Environment variable: `RECLAIM_IDLE_SECONDS`
    #[serde(default = "default_reclaim_idle", alias = "RECLAIM_IDLE_SECONDS")]
    pub reclaim_idle_seconds: u64,

    /// Budget for stopping every worker, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Destinations
    /// Destinations from the configuration file.
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,

    /// Pixel id for the synthesized `capi` destination.
    #[serde(default, alias = "FB_PIXEL_ID")]
    pub fb_pixel_id: Option<String>,
    /// Access token for the synthesized `capi` destination.
    #[serde(default, alias = "FB_ACCESS_TOKEN")]
    pub fb_access_token: Option<String>,
    /// Graph API version.
    #[serde(default = "default_fb_api_version", alias = "FB_API_VERSION")]
    pub fb_api_version: String,
    /// Test event code routing pixel events to the test console.
    #[serde(default, alias = "FB_TEST_EVENT_CODE")]
    pub fb_test_event_code: Option<String>,
    /// Reported action source.
    #[serde(default = "default_fb_action_source", alias = "FB_ACTION_SOURCE")]
    pub fb_action_source: String,
    /// Salt for deterministic deduplication ids.
    #[serde(default = "default_event_id_salt", alias = "EVENT_ID_SALT")]
    pub event_id_salt: String,
    /// Measurement id for the synthesized `ga4` destination.
    #[serde(default, alias = "GA4_MEASUREMENT_ID")]
    pub ga4_measurement_id: Option<String>,
    /// API secret for the synthesized `ga4` destination.
    #[serde(default, alias = "GA4_API_SECRET")]
    pub ga4_api_secret: Option<String>,
    /// Prefix of synthesized GA4 client ids.
    #[serde(default = "default_ga4_client_id_prefix", alias = "GA4_CLIENT_ID_PREFIX")]
    pub ga4_client_id_prefix: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment
    /// variable overrides, then validate it.
    ///
    /// # Errors
    ///
    /// Unparsable sources or values rejected by validation.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// The layered sources [`Config::load`] reads.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
    }

    /// Extracts and validates configuration from `figment`.
    ///
    /// # Errors
    ///
    /// Unparsable sources or values rejected by validation.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Configured and synthesized destinations, in that order.
    ///
    /// Synthesized destinations are skipped when the file already defines
    /// one with the same name.
    ///
    /// # Errors
    ///
    /// Destinations that cannot be resolved.
    pub fn resolve_destinations(&self) -> Result<Vec<Destination>> {
        let mut destinations = self
            .destinations
            .iter()
            .map(DestinationConfig::to_destination)
            .collect::<Result<Vec<_>>>()?;

        for synthesized in self.synthesized_destinations() {
            if destinations.iter().all(|d| d.name.as_str() != synthesized.name) {
                destinations.push(synthesized.to_destination()?);
            }
        }

        Ok(destinations)
    }

    fn synthesized_destinations(&self) -> Vec<DestinationConfig> {
        let mut synthesized = Vec::new();

        if let (Some(pixel_id), Some(access_token)) =
            (non_empty(&self.fb_pixel_id), non_empty(&self.fb_access_token))
        {
            synthesized.push(DestinationConfig {
                name: "capi".to_string(),
                kind: DestinationKind::FacebookCapi {
                    pixel_id: pixel_id.to_string(),
                    access_token: access_token.to_string(),
                    api_version: self.fb_api_version.clone(),
                    test_event_code: non_empty(&self.fb_test_event_code).map(str::to_string),
                    action_source: self.fb_action_source.clone(),
                    event_id_salt: self.event_id_salt.clone(),
                },
                endpoint: None,
                rate_limit_tokens: default_rate_limit_tokens(),
                rate_limit_interval_ms: default_rate_limit_interval_ms(),
                timeout_ms: default_destination_timeout_ms(),
                bulk: true,
                events: Vec::new(),
                enabled: true,
            });
        }

        if let (Some(measurement_id), Some(api_secret)) =
            (non_empty(&self.ga4_measurement_id), non_empty(&self.ga4_api_secret))
        {
            synthesized.push(DestinationConfig {
                name: "ga4".to_string(),
                kind: DestinationKind::Ga4 {
                    measurement_id: measurement_id.to_string(),
                    api_secret: api_secret.to_string(),
                    client_id_prefix: self.ga4_client_id_prefix.clone(),
                },
                endpoint: None,
                rate_limit_tokens: default_rate_limit_tokens(),
                rate_limit_interval_ms: default_rate_limit_interval_ms(),
                timeout_ms: default_destination_timeout_ms(),
                bulk: false,
                events: Vec::new(),
                enabled: true,
            });
        }

        synthesized
    }

    /// Admin token, if one is set and non-empty.
    pub fn admin_token(&self) -> Option<&str> {
        non_empty(&self.admin_token)
    }

    /// Cipher for personal data at rest, when `crypto_key` is set.
    ///
    /// # Errors
    ///
    /// If the key cannot be turned into a cipher.
    pub fn payload_cipher(&self) -> Result<Option<PayloadCipher>> {
        non_empty(&self.crypto_key)
            .map(PayloadCipher::from_secret)
            .transpose()
            .context("Invalid crypto_key")
    }

    /// Convert to the pipeline's configuration.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            partitions: self.partitions,
            consumer: self.to_consumer_config(),
            senders_per_destination: self.senders_per_destination,
            batch: self.to_batch_config(),
            retry: self.to_retry_policy(),
            client: self.to_client_config(),
            scheduler: self.to_scheduler_config(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Convert to consumer configuration.
    pub fn to_consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            consumer_name: self.consumer_name.clone(),
            read_batch_size: self.read_batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..ConsumerConfig::default()
        }
    }

    /// Convert to batcher configuration.
    pub fn to_batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            max_batch_age: Duration::from_millis(self.max_batch_age_ms),
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            capacity: self.batcher_capacity,
        }
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
        }
    }

    /// Convert to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.http_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Convert to scheduler configuration.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(self.tick_interval_seconds),
            auto_reprocess: self.auto_reprocess,
            auto_reprocess_min_age: Duration::from_secs(self.auto_reprocess_min_age_seconds),
            auto_reprocess_max: self.auto_reprocess_max,
            stale_in_flight_after: Duration::from_secs(self.stale_in_flight_seconds),
            reclaim_idle: Duration::from_secs(self.reclaim_idle_seconds),
            ..SchedulerConfig::default()
        }
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Host and port that do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// The first invalid value found.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.store_backend == StoreBackend::Postgres {
            if self.database_url.trim().is_empty() {
                anyhow::bail!("database_url is required for the postgres backend");
            }
            if self.database_max_connections == 0 {
                anyhow::bail!("database max_connections must be greater than 0");
            }
            if self.database_min_connections > self.database_max_connections {
                anyhow::bail!("database min_connections cannot exceed max_connections");
            }
        }

        if self.partitions == 0 {
            anyhow::bail!("partitions must be greater than 0");
        }

        if self.senders_per_destination == 0 {
            anyhow::bail!("senders_per_destination must be greater than 0");
        }

        if self.read_batch_size == 0 {
            anyhow::bail!("read_batch_size must be greater than 0");
        }

        if self.max_batch_size == 0 {
            anyhow::bail!("max_batch_size must be greater than 0");
        }

        if self.batcher_capacity == 0 {
            anyhow::bail!("batcher_capacity must be greater than 0");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            anyhow::bail!("retry_max_delay_ms cannot be lower than retry_base_delay_ms");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.tick_interval_seconds == 0 {
            anyhow::bail!("tick_interval_seconds must be greater than 0");
        }

        let destinations = self.resolve_destinations()?;
        if destinations.iter().all(|d| !d.enabled) {
            anyhow::bail!(
                "no enabled destination: add [[destinations]] to {CONFIG_FILE} or set \
                 FB_PIXEL_ID/FB_ACCESS_TOKEN or GA4_MEASUREMENT_ID/GA4_API_SECRET"
            );
        }

        let mut names = BTreeSet::new();
        for destination in &destinations {
            if destination.name.as_str().trim().is_empty() {
                anyhow::bail!("destination names cannot be empty");
            }
            if !names.insert(destination.name.as_str()) {
                anyhow::bail!("duplicate destination name {}", destination.name);
            }
            if destination.rate_limit.tokens == 0 {
                anyhow::bail!("destination {} needs a rate limit above 0", destination.name);
            }
            if destination.rate_limit.interval.is_zero() {
                anyhow::bail!("destination {} needs a non-zero rate interval", destination.name);
            }
            if destination.timeout.is_zero() {
                anyhow::bail!("destination {} needs a non-zero timeout", destination.name);
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_backend: default_store_backend(),
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            database_idle_timeout: default_idle_timeout(),
            database_max_lifetime: default_max_lifetime(),
            database_connect_retries: default_connect_retries(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            admin_token: None,
            crypto_key: None,
            partitions: default_partitions(),
            consumer_name: default_consumer_name(),
            read_batch_size: default_read_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            senders_per_destination: default_senders(),
            max_batch_size: default_max_batch_size(),
            max_batch_age_ms: default_max_batch_age_ms(),
            batch_timeout_ms: default_batch_timeout_ms(),
            batcher_capacity: default_batcher_capacity(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter_factor: default_jitter_factor(),
            http_timeout_seconds: default_http_timeout(),
            tick_interval_seconds: default_tick_interval(),
            auto_reprocess: true,
            auto_reprocess_min_age_seconds: default_auto_reprocess_min_age(),
            auto_reprocess_max: default_auto_reprocess_max(),
            stale_in_flight_seconds: default_stale_in_flight(),
            reclaim_idle_seconds: default_reclaim_idle(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            destinations: Vec::new(),
            fb_pixel_id: None,
            fb_access_token: None,
            fb_api_version: default_fb_api_version(),
            fb_test_event_code: None,
            fb_action_source: default_fb_action_source(),
            event_id_salt: default_event_id_salt(),
            ga4_measurement_id: None,
            ga4_api_secret: None,
            ga4_client_id_prefix: default_ga4_client_id_prefix(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn default_true() -> bool {
    true
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Postgres
}

fn default_database_url() -> String {
    "postgresql://localhost/leadrelay".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_lifetime() -> u64 {
    1800
}

fn default_connect_retries() -> u32 {
    5
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_partitions() -> u32 {
    leadrelay_delivery::DEFAULT_PARTITIONS
}

fn default_consumer_name() -> String {
    "leadrelay".to_string()
}

fn default_read_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_senders() -> usize {
    leadrelay_delivery::DEFAULT_SENDERS_PER_DESTINATION
}

fn default_max_batch_size() -> usize {
    50
}

fn default_max_batch_age_ms() -> u64 {
    2000
}

fn default_batch_timeout_ms() -> u64 {
    30_000
}

fn default_batcher_capacity() -> usize {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_http_timeout() -> u64 {
    30
}

fn default_tick_interval() -> u64 {
    30
}

fn default_auto_reprocess_min_age() -> u64 {
    900
}

fn default_auto_reprocess_max() -> u32 {
    3
}

fn default_stale_in_flight() -> u64 {
    300
}

fn default_reclaim_idle() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    leadrelay_delivery::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS
}

fn default_rate_limit_tokens() -> u32 {
    50
}

fn default_rate_limit_interval_ms() -> u64 {
    1000
}

fn default_destination_timeout_ms() -> u64 {
    20_000
}

fn default_fb_api_version() -> String {
    "v20.0".to_string()
}

fn default_fb_action_source() -> String {
    "website".to_string()
}

fn default_event_id_salt() -> String {
    "change_me".to_string()
}

fn default_ga4_client_id_prefix() -> String {
    "tlgrm-".to_string()
}
