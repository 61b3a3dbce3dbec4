use anyhow::Context;
use axum::{routing::get, Router};
use gateway::broker::{Broker, MqttBroker, QoS};
use gateway::config::{Config, StoreBackend};
use gateway::correlator::CommandCorrelator;
use gateway::db::{self, PgRepository};
use gateway::ingest::TelemetryIngestor;
use gateway::memory::MemoryRepository;
use gateway::metrics;
use gateway::query::QueryEngine;
use gateway::rest::{self, AppState};
use gateway::store::Repository;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // Initialize logging
    let level = config.as_ref().map(|c| c.log_level.as_str()).unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        error!("Gateway failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting sensor gateway");
    info!("MQTT broker: {}:{}", config.mqtt.host, config.mqtt.port);
    info!("HTTP server: {}", config.http_addr);

    metrics::init_metrics().context("failed to register metrics")?;

    let repo: Arc<dyn Repository> = match config.database.backend {
        StoreBackend::Postgres => {
            info!(
                "Database: {}",
                config.database.url.split('@').last().unwrap_or("***")
            );
            let pool = db::make_pool(&config.database).await?;
            Arc::new(PgRepository::new(pool))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; data is lost on restart");
            Arc::new(MemoryRepository::new())
        }
    };

    let broker = Arc::new(MqttBroker::connect(&config.mqtt).await?);
    let broker_handle: Arc<dyn Broker> = broker.clone();

    let ingestor = Arc::new(TelemetryIngestor::new(repo.clone()));
    let correlator = Arc::new(CommandCorrelator::new(
        &config.mqtt,
        broker_handle.clone(),
        repo.clone(),
    ));

    broker
        .subscribe(&config.mqtt.telemetry_topic, QoS::AtLeastOnce, ingestor)
        .await
        .context("failed to subscribe to telemetry topic")?;
    broker
        .subscribe(
            &config.mqtt.response_topic_pattern,
            QoS::AtLeastOnce,
            correlator.clone(),
        )
        .await
        .context("failed to subscribe to command responses")?;

    let state = AppState::new(
        QueryEngine::new(repo.clone()),
        correlator,
        broker_handle,
        repo.backend(),
    );

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    if let Err(e) = broker.disconnect().await {
        warn!("MQTT disconnect failed: {}", e);
    }

    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
