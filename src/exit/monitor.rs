// =============================================================================
// Exit Monitor Loops — streamed ticks, polling re-checks, balance scans
// =============================================================================
//
// Three background tasks feed the lifecycle manager:
//
//   run_price_stream       one multiplexed ticker socket for the tracked set;
//                          torn down and rebuilt whenever the set changes
//   run_polling_loop       every check interval, re-check one rotating group
//                          of positions (syncing the clock first)
//   run_balance_scan_loop  periodically adopt newly held assets
//
// Each is spawned once at startup and runs until the process exits.
// =============================================================================

use std::sync::Arc;

use tokio::time::{interval, interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::health::ClockSync;
use crate::lifecycle::PositionLifecycle;
use crate::market_data::ticker_stream::run_ticker_stream;

/// Pause before reconnecting a ticker socket that dropped.
const STREAM_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Keep one ticker subscription alive for the current tracked set.
pub async fn run_price_stream(lifecycle: Arc<PositionLifecycle>, ws_base: String) {
    let mut symbols_rx = lifecycle.subscribe_symbols();
    info!("price stream supervisor started");

    loop {
        let symbols = symbols_rx.borrow_and_update().clone();
        if symbols.is_empty() {
            debug!("no tracked symbols — price stream idle");
            if symbols_rx.changed().await.is_err() {
                return;
            }
            continue;
        }

        let lc = Arc::clone(&lifecycle);
        let stream = run_ticker_stream(&ws_base, &symbols, move |symbol, price| {
            let _ = lc.on_price(symbol, price);
        });

        tokio::select! {
            result = stream => {
                match result {
                    Ok(()) => warn!(count = symbols.len(), "ticker stream ended — reconnecting in 5s"),
                    Err(e) => error!(error = %e, "ticker stream failed — reconnecting in 5s"),
                }
                tokio::time::sleep(STREAM_RECONNECT_DELAY).await;
            }
            changed = symbols_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                info!(
                    previous = symbols.len(),
                    current = symbols_rx.borrow().len(),
                    "tracked symbols changed — resubscribing"
                );
            }
        }
    }
}

/// Re-check one group of positions per interval.
pub async fn run_polling_loop(lifecycle: Arc<PositionLifecycle>, clock: Option<Arc<ClockSync>>) {
    let period = lifecycle.settings().check_interval;
    info!(interval_secs = period.as_secs(), "polling loop started");

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if lifecycle.is_api_down() {
            debug!("exchange unreachable — polling cycle skipped");
            continue;
        }
        if let Some(clock) = &clock {
            if let Err(e) = clock.sync().await {
                warn!(error = %e, "server time sync failed");
            }
        }
        let checked = lifecycle.check_group().await;
        debug!(checked, "polling cycle complete");
    }
}

/// Scan balances every `every`; the first scan runs at startup, not here.
pub async fn run_balance_scan_loop(lifecycle: Arc<PositionLifecycle>, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if lifecycle.is_api_down() {
            continue;
        }
        match lifecycle.scan_balances().await {
            Ok(0) => debug!("balance scan found nothing new"),
            Ok(opened) => info!(opened, "balance scan opened positions"),
            Err(e) => warn!(error = %e, "balance scan failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::EventBus;
    use crate::exit::decision::ExitEngine;
    use crate::indicators::TrendFilter;
    use crate::lifecycle::LifecycleSettings;
    use crate::recent_sells::RecentSells;
    use crate::testing::{buy_trade, FakeExchange};
    use rust_decimal_macros::dec;

    fn lifecycle(ex: Arc<FakeExchange>, settings: LifecycleSettings) -> Arc<PositionLifecycle> {
        let path = std::env::temp_dir().join(format!("monitor_sells_{}.json", uuid::Uuid::new_v4()));
        Arc::new(PositionLifecycle::new(
            ex,
            ExitEngine::new(EngineConfig::default().exit_params()),
            settings,
            Arc::new(TrendFilter::new()),
            EventBus::new(),
            Arc::new(RecentSells::open(path)),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn balance_scan_loop_adopts_new_holdings() {
        let ex = Arc::new(FakeExchange::new());
        ex.list("CAKEUSDT", "CAKE", dec!(0.01), dec!(0.01), dec!(1));
        ex.set_price("CAKEUSDT", dec!(100));
        let lc = lifecycle(ex.clone(), LifecycleSettings::default());

        let task = tokio::spawn(run_balance_scan_loop(Arc::clone(&lc), Duration::from_secs(300)));
        ex.set_wallet("CAKE", dec!(2));
        ex.push_history("CAKEUSDT", buy_trade(1, dec!(2), dec!(95)));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(!lc.is_tracked("CAKEUSDT"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(lc.is_tracked("CAKEUSDT"));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn polling_loop_rechecks_positions() {
        let ex = Arc::new(FakeExchange::new());
        ex.list("CAKEUSDT", "CAKE", dec!(0.01), dec!(0.01), dec!(1));
        ex.set_price("CAKEUSDT", dec!(100));
        ex.set_wallet("CAKE", dec!(2));
        ex.push_history("CAKEUSDT", buy_trade(1, dec!(2), dec!(100)));
        let lc = lifecycle(ex.clone(), LifecycleSettings::default());
        assert_eq!(lc.scan_balances().await.unwrap(), 1);

        // Price jumps far enough for the extreme-profit escape.
        ex.set_price("CAKEUSDT", dec!(110));
        let task = tokio::spawn(run_polling_loop(Arc::clone(&lc), None));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!lc.is_tracked("CAKEUSDT"));
        assert_eq!(ex.sell_count(), 1);
        task.abort();
    }
}
