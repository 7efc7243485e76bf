// =============================================================================
// apex-follower — Main Entry Point
// =============================================================================
//
// Wires the trade execution engine: loads configuration, builds the venue
// client and in-process stores, starts the user-data stream consumer and
// the REST seam, and runs the periodic listenKey-keepalive / stale-trade
// cleanup task until shutdown.
// =============================================================================

mod api;
mod binance;
mod clock;
mod config;
mod dedup;
mod engine;
mod error;
mod executor;
mod lock_registry;
mod notify;
mod risk;
mod signal_parser;
mod store;
mod stream;
mod types;
mod venue;
#[cfg(test)]
mod venue_fake;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::client::BinanceFuturesClient;
use crate::clock::SystemClock;
use crate::config::GlobalConfig;
use crate::engine::{Engine, SingleAccountDirectory};
use crate::executor::Executor;
use crate::lock_registry::SymbolLockRegistry;
use crate::notify::LoggingNotifier;
use crate::risk::CircuitBreaker;
use crate::store::TradeStore;
use crate::stream::StreamConsumer;
use crate::venue::VenueClient;

const CONFIG_PATH: &str = "config.json";
const SNAPSHOT_PATH: &str = "trades.snapshot.json";
const DEFAULT_USER_ID: &str = "default";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("apex-follower starting up");

    let global_config = GlobalConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "no usable config file, starting from defaults");
        let cfg = GlobalConfig::default();
        if let Err(e) = cfg.save(CONFIG_PATH) {
            warn!(error = %e, "failed to persist default config");
        }
        cfg
    });

    let clock = Arc::new(SystemClock);
    let notifier = Arc::new(LoggingNotifier);
    let locks = Arc::new(SymbolLockRegistry::new());
    let circuit_breaker = Arc::new(CircuitBreaker::new(clock.clone()));
    let store = Arc::new(TradeStore::new(clock));

    if let Err(e) = store.load_snapshot(SNAPSHOT_PATH) {
        warn!(error = %e, "no usable trade snapshot found, starting with an empty store");
    }

    let api_key = std::env::var("VENUE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("VENUE_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("VENUE_API_KEY / VENUE_API_SECRET not set — signed venue calls will be rejected by the venue");
    }

    let venue = Arc::new(BinanceFuturesClient::new(
        api_key,
        api_secret,
        global_config.rest_base_url.clone(),
        notifier.clone(),
    ));

    let executor = Arc::new(Executor::new(
        global_config.clone(),
        locks,
        circuit_breaker.clone(),
        venue.clone() as Arc<dyn VenueClient>,
        store.clone(),
        notifier.clone(),
    ));

    let directory = Arc::new(SingleAccountDirectory::new(DEFAULT_USER_ID, None));
    let engine = Arc::new(Engine::new(
        executor,
        store.clone(),
        circuit_breaker,
        directory,
        global_config.clone(),
    ));

    let stream_consumer = Arc::new(StreamConsumer::new(
        venue.clone(),
        store.clone(),
        notifier,
        global_config.ws_base_url.clone(),
        global_config.reconnect_base_ms,
        global_config.reconnect_max_ms,
        global_config.max_reconnect_attempts,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let stream_task = {
        let consumer = stream_consumer.clone();
        tokio::spawn(async move { consumer.run(shutdown_rx).await })
    };

    let maintenance_task = {
        let consumer = stream_consumer.clone();
        let store = store.clone();
        let venue = venue.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        consumer.keepalive().await;
                        let cancelled = store
                            .cleanup_stale_trades(|symbol| {
                                let venue = venue.clone();
                                async move { venue.get_current_position_amount(&symbol).await.map_err(Into::into) }
                            })
                            .await;
                        if !cancelled.is_empty() {
                            info!(count = cancelled.len(), "stale trades cancelled during maintenance sweep");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let rest_router = api::rest::router(engine);
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!(addr = "0.0.0.0:8080", "REST seam listening");

    tokio::select! {
        result = axum::serve(listener, rest_router) => {
            if let Err(e) = result {
                error!(error = %e, "REST server exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = stream_task.await;
    let _ = maintenance_task.await;

    if let Err(e) = store.save_snapshot(SNAPSHOT_PATH) {
        error!(error = %e, "failed to save trade snapshot on shutdown");
    }

    info!("apex-follower shut down cleanly");
    Ok(())
}
