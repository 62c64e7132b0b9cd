//! CADENCE: crash-resumable BUY-BUY-SELL-SELL DEX session engine.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the store, seeds operator configs, resumes sessions left active
//! by a previous run, serves the control API and shuts down gracefully.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use cadence::api::{self, ApiState};
use cadence::config::{self, GatewayMode};
use cadence::engine::notify::Notification;
use cadence::engine::SessionEngine;
use cadence::gateway::http::HttpGateway;
use cadence::gateway::paper::PaperGateway;
use cadence::gateway::ExchangeGateway;
use cadence::storage::{SqliteStore, StateStore};

const BANNER: &str = r#"
  ____    _    ____  _____ _   _  ____ _____
 / ___|  / \  |  _ \| ____| \ | |/ ___| ____|
| |     / _ \ | | | |  _| |  \| | |   |  _|
| |___ / ___ \| |_| | |___| |\  | |___| |___
 \____/_/   \_\____/|_____|_| \_|\____|_____|

  BUY / BUY / SELL / SELL session engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("CADENCE_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        config = %config_path,
        gateway = ?cfg.gateway.mode,
        database = %cfg.storage.database_url,
        "CADENCE starting up"
    );

    // -- Store -----------------------------------------------------------

    let store = Arc::new(
        SqliteStore::connect(&cfg.storage.database_url)
            .await
            .context("Failed to open session store")?,
    );
    for (operator, session) in &cfg.operators {
        store
            .save_config(operator, session)
            .await
            .with_context(|| format!("Failed to seed config for operator {operator}"))?;
        info!(operator = %operator, config = %session, "Seeded operator config");
    }

    // -- Gateway ---------------------------------------------------------

    let gateway: Arc<dyn ExchangeGateway> = match cfg.gateway.mode {
        GatewayMode::Paper => {
            warn!("Paper gateway: swaps are simulated, no chain is touched");
            Arc::new(PaperGateway::new(cfg.paper_book()))
        }
        GatewayMode::Http => {
            let base_url = cfg
                .gateway
                .base_url
                .as_deref()
                .context("gateway.base_url is required in http mode")?;
            info!(base_url, "Using relayer gateway");
            Arc::new(HttpGateway::new(
                base_url,
                cfg.gateway_api_key()?,
                cfg.engine_settings().gateway_timeout,
            )?)
        }
    };

    // -- Engine ----------------------------------------------------------

    let engine = Arc::new(SessionEngine::new(store, gateway, cfg.engine_settings()));
    let notifications = tokio::spawn(log_notifications(engine.subscribe()));

    let resumed = engine.recover().await?;
    info!(resumed = resumed.len(), "Recovery complete");

    if cfg.api.enabled {
        let state = Arc::new(ApiState {
            engine: engine.clone(),
            allowed_operators: cfg.allowed_operators(),
        });
        api::spawn_api(state, cfg.api.port).await?;
    } else {
        warn!("Control API disabled; only recovered sessions will run");
    }

    info!("Ready. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received, finishing in-flight trades");
    engine.shutdown().await;
    notifications.abort();

    info!("CADENCE shut down cleanly.");
    Ok(())
}

/// Log every session notification until the channel closes.
async fn log_notifications(mut rx: tokio::sync::broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(event @ Notification::Halted { .. }) => {
                warn!(operator = event.operator(), "{event}");
            }
            Ok(event @ Notification::HaltNotPersisted { .. }) => {
                error!(operator = event.operator(), "{event}");
            }
            Ok(event) => info!(operator = event.operator(), "{event}"),
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "Notification log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cadence=info"));

    let json_logging = std::env::var("CADENCE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
