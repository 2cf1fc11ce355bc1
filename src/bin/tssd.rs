//! tssd daemon entrypoint.
//!
//! Loads configuration, initializes tracing and metrics, connects and
//! migrates the database, then spawns the background sweeps and waits for
//! shutdown. Event ingestion and directive application are owned by the
//! platform gateway integration; a bare daemon logs outbound directives so
//! the sweep pipeline stays observable without one.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tssd::{Config, Database, Dispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("failed to load config from {config_path}: {e}");
        e
    })?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!(config = %config_path, "Starting tssd");

    tssd::metrics::init();

    // Initialize database (runs migrations)
    let db = Database::connect(&config.database.url, config.database.max_connections)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to initialize database");
            e
        })?;

    let dispatcher = Arc::new(Dispatcher::new(db, &config));

    // Metrics/health endpoint
    if let Some(addr) = config.http.metrics_addr {
        tokio::spawn(tssd::http::run_http_server(addr));
    }

    // Outbound directives. The applier integration consumes this channel; a
    // bare daemon drains it to the log so expiry directives are never lost
    // silently.
    let (directive_tx, mut directive_rx) = mpsc::channel(256);
    tokio::spawn(async move {
        while let Some(directive) = directive_rx.recv().await {
            match serde_json::to_string(&directive) {
                Ok(json) => info!(directive = %json, "directive emitted"),
                Err(e) => error!(error = %e, "failed to encode directive"),
            }
        }
    });

    // Background sweeps
    tssd::sweep::spawn_mute_sweep(
        dispatcher.clone(),
        Duration::from_secs(config.sweep.mute_interval_secs),
        directive_tx,
    );
    tssd::sweep::spawn_incident_sweep(
        dispatcher.clone(),
        Duration::from_secs(config.sweep.incident_interval_secs),
    );

    info!("tssd running");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}
