// =============================================================================
// Spot Exit Engine — Main Entry Point
// =============================================================================
//
// Follows every held spot balance, keeps a FIFO cost basis per asset and
// sells through a rate-limited Binance client when the adaptive take-profit
// ladder (or the optional stop-loss) says so.  Buying is someone else's job.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod config;
mod cost_basis;
mod error;
mod events;
mod exchange;
mod execution;
mod exit;
mod health;
mod indicators;
mod lifecycle;
mod market_data;
mod notify;
mod position;
mod recent_sells;
mod reconcile;
mod types;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::rate_limit::DEFAULT_WINDOW;
use crate::binance::{BinanceClient, HttpTransport, RateLimiter, ThrottledTransport};
use crate::config::{Credentials, EngineConfig};
use crate::events::{EngineEvent, EventBus};
use crate::exchange::Exchange;
use crate::exit::decision::ExitEngine;
use crate::health::ClockSync;
use crate::indicators::TrendFilter;
use crate::lifecycle::{LifecycleSettings, PositionLifecycle};
use crate::notify::Notifier;
use crate::recent_sells::RecentSells;

const DEFAULT_CONFIG_PATH: &str = "exit_engine.json";
const FILL_CHANNEL_CAPACITY: usize = 256;
/// Recent-sell entries older than this are pruned at startup.
const RECENT_SELLS_RETENTION_DAYS: i64 = 7;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Spot Exit Engine — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("EXIT_ENGINE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let config_exists = std::path::Path::new(&config_path).exists();
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    if !config_exists {
        // First run: leave an editable file with every default spelled out.
        if let Err(e) = config.save(&config_path) {
            warn!(error = %e, "Failed to write default config");
        }
    }
    config.apply_env();
    config.validate().context("invalid engine configuration")?;

    let network = config.network();
    info!(
        network = %network,
        quote = %config.quote_asset,
        check_interval_secs = config.check_interval_secs,
        min_profit_pct = %config.min_profit_pct,
        target_steps = config.target_steps,
        stop_loss = config.stop_loss_enabled,
        "Engine configuration"
    );

    // ── 2. Exchange access layer ─────────────────────────────────────────
    let credentials = Credentials::from_env(network)?;
    let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute, DEFAULT_WINDOW));
    info!(
        weight_limit = limiter.limit(),
        window_secs = limiter.window().as_secs(),
        "Request weight budget ready"
    );
    let http = HttpTransport::new(credentials.api_key, credentials.api_secret, network.rest_base())
        .context("failed to build HTTP transport")?;
    let transport = Arc::new(ThrottledTransport::new(http, Arc::clone(&limiter)));
    let client = BinanceClient::new(transport.clone());
    let exchange: Arc<dyn Exchange> = Arc::new(client.clone());
    let clock = Arc::new(ClockSync::new(client.clone(), Arc::clone(&transport)));

    // ── 3. Events & notifications ────────────────────────────────────────
    let events = EventBus::new();
    tokio::spawn(notify::run_notifier(
        Notifier::from_env(network),
        events.subscribe(),
    ));

    // ── 4. Lifecycle manager ─────────────────────────────────────────────
    let recent_sells = Arc::new(RecentSells::open(&config.recent_sells_path));
    match recent_sells.cleanup(
        chrono::Duration::days(RECENT_SELLS_RETENTION_DAYS),
        chrono::Utc::now(),
    ) {
        Ok(0) => {}
        Ok(removed) => info!(removed, "Pruned old recent-sell entries"),
        Err(e) => warn!(error = %e, "Failed to prune recent sells"),
    }

    let trend = Arc::new(TrendFilter::new());
    let lifecycle = Arc::new(PositionLifecycle::new(
        Arc::clone(&exchange),
        ExitEngine::new(config.exit_params()),
        LifecycleSettings::from_config(&config),
        Arc::clone(&trend),
        events.clone(),
        recent_sells,
    ));

    // ── 5. Startup sync & balance load ───────────────────────────────────
    if let Err(e) = clock.sync().await {
        warn!(error = %e, "Initial server time sync failed");
    }
    health::check_api_health(&lifecycle, exchange.as_ref()).await;
    trend.refresh(exchange.as_ref()).await;
    match lifecycle.scan_balances().await {
        Ok(opened) => info!(opened, "Startup balance scan complete"),
        Err(e) => warn!(error = %e, "Startup balance scan failed — retrying on schedule"),
    }
    events.publish(EngineEvent::Started {
        network,
        tracked: lifecycle.tracked_symbols(),
    });

    // ── 6. Background loops ──────────────────────────────────────────────
    tokio::spawn(exit::monitor::run_price_stream(
        Arc::clone(&lifecycle),
        network.ws_base().to_string(),
    ));
    tokio::spawn(exit::monitor::run_polling_loop(
        Arc::clone(&lifecycle),
        Some(Arc::clone(&clock)),
    ));
    tokio::spawn(exit::monitor::run_balance_scan_loop(
        Arc::clone(&lifecycle),
        std::time::Duration::from_secs(config.balance_scan_interval_secs),
    ));
    tokio::spawn(health::run_health_monitor(
        Arc::clone(&lifecycle),
        Arc::clone(&exchange),
    ));
    tokio::spawn(indicators::trend::run_trend_monitor(
        Arc::clone(&trend),
        Arc::clone(&exchange),
    ));

    // ── 7. Fill confirmations ────────────────────────────────────────────
    let (fill_tx, mut fill_rx) = mpsc::channel(FILL_CHANNEL_CAPACITY);
    tokio::spawn(binance::user_stream::run_user_stream(
        client.clone(),
        network.ws_base().to_string(),
        fill_tx,
    ));
    let fill_lifecycle = Arc::clone(&lifecycle);
    tokio::spawn(async move {
        while let Some(fill) = fill_rx.recv().await {
            let symbol = fill.symbol.clone();
            if let Err(e) = fill_lifecycle.on_fill(fill).await {
                warn!(symbol = %symbol, error = %e, "Failed to apply fill");
            }
        }
    });

    // ── 8. Status API ────────────────────────────────────────────────────
    let api_state = Arc::new(AppState::new(
        Arc::clone(&lifecycle),
        Arc::clone(&limiter),
        Arc::clone(&trend),
        config.clone(),
    ));
    let bind_addr = config.api_bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server to {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::rest::router(api_state)).await {
            error!(error = %e, "API server failed");
        }
    });

    info!(
        tracked = lifecycle.tracked_symbols().len(),
        "Exit engine running — press Ctrl+C to stop"
    );

    // ── 9. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}
