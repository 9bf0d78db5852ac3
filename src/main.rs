//! leadrelay lead conversion relay.
//!
//! Main entry point. Initializes all subsystems, runs the delivery pipeline
//! and the admin server, and coordinates graceful startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use leadrelay_api::{create_router, shutdown_signal, start_server, AppState, Config, StoreBackend};
use leadrelay_core::{storage::schema::ensure_schema, Clock, RealClock, Storage};
use leadrelay_delivery::{metrics::describe_metrics, Pipeline};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::watch;
use tracing::{error, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting leadrelay");

    let config = Config::load()?;
    let destinations = config.resolve_destinations()?;
    info!(
        store_backend = ?config.store_backend,
        database_url = %config.database_url_masked(),
        admin_addr = %format!("{}:{}", config.host, config.port),
        admin_token = config.admin_token().is_some(),
        partitions = config.partitions,
        destinations = ?destinations.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        "Configuration loaded"
    );

    let metrics_handle = install_metrics_recorder()?;

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = create_database_pool(&config).await?;
            info!("Database connection pool established");

            ensure_schema(&pool).await.context("Failed to create database schema")?;
            info!("Database schema ready");

            let cipher = config.payload_cipher()?;
            if cipher.is_none() {
                warn!("CRYPTO_KEY not set; lead personal data is stored in plaintext");
            }
            Storage::postgres(pool, cipher)
        },
        StoreBackend::Memory => {
            warn!("Using in-memory storage; events are lost on restart");
            Storage::in_memory(clock.clone())
        },
    };

    let pipeline = Pipeline::with_http_client(
        config.to_pipeline_config(),
        destinations,
        storage.clone(),
        clock.clone(),
    )
    .context("Failed to build delivery pipeline")?;
    let pipeline = pipeline.start().await;
    info!("Delivery pipeline running");

    let state = AppState::new(pipeline.admin(), clock)
        .with_metrics(metrics_handle)
        .with_admin_token(config.admin_token());
    let router = create_router(state, Duration::from_secs(config.request_timeout));
    let addr = config.parse_server_addr()?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server_handle = tokio::spawn(async move {
        let stopped = async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        };
        if let Err(e) = start_server(router, addr, stopped).await {
            error!(error = %e, "Admin server failed");
        }
    });

    info!(%addr, "leadrelay is ready");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    let _ = stop_tx.send(true);

    let mut exit = Ok(());
    if let Err(e) = pipeline.shutdown().await {
        error!(error = %e, "Pipeline did not stop cleanly");
        exit = Err(e).context("Pipeline shutdown failed");
    }

    if tokio::time::timeout(Duration::from_secs(config.request_timeout), server_handle)
        .await
        .is_err()
    {
        warn!("Admin server did not stop within the request timeout");
    }

    storage.close().await;
    info!("Storage closed");

    info!("leadrelay shutdown complete");
    exit
}

/// Initializes tracing from `RUST_LOG`, with JSON output when
/// `LOG_FORMAT=json`.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,leadrelay=debug,tower_http=debug"))
        .context("Invalid RUST_LOG environment variable")?;

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true).with_thread_ids(true)).try_init()
    };
    installed.context("Failed to install tracing subscriber")
}

/// Installs the global Prometheus recorder and registers metric
/// descriptions.
fn install_metrics_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    describe_metrics();
    Ok(handle)
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<PgPool> {
    let max_retries = config.database_connect_retries;
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < max_retries => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
