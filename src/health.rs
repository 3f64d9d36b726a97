// =============================================================================
// API Health & Clock Sync
// =============================================================================
//
// The health monitor pings the exchange once a minute and flips the
// lifecycle's `api_down` flag on every transition (which pauses polling and
// balance scans and emits an `ApiStatus` event).
//
// Clock sync measures exchange time minus local time around a round trip and
// feeds it to the HTTP transport so signed timestamps stay inside recvWindow.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use crate::binance::transport::local_time_ms;
use crate::binance::{BinanceClient, HttpTransport, ThrottledTransport};
use crate::exchange::Exchange;
use crate::lifecycle::PositionLifecycle;

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Ping once and record the outcome; returns whether the API is up.
pub async fn check_api_health(lifecycle: &PositionLifecycle, exchange: &dyn Exchange) -> bool {
    match exchange.ping().await {
        Ok(()) => {
            lifecycle.set_api_status(true, None);
            true
        }
        Err(e) => {
            lifecycle.set_api_status(false, Some(e.to_string()));
            false
        }
    }
}

pub async fn run_health_monitor(lifecycle: Arc<PositionLifecycle>, exchange: Arc<dyn Exchange>) {
    let mut ticker = interval(HEALTH_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = HEALTH_CHECK_INTERVAL.as_secs(), "API health monitor started");

    loop {
        ticker.tick().await;
        let up = check_api_health(&lifecycle, exchange.as_ref()).await;
        debug!(up, "API health checked");
    }
}

/// Offset to add to the local clock, estimated against the midpoint of the
/// round trip.
pub fn clock_offset(server_ms: i64, sent_ms: i64, received_ms: i64) -> i64 {
    server_ms - (sent_ms + received_ms) / 2
}

/// Keeps the signing transport's clock aligned with the exchange.
pub struct ClockSync {
    client: BinanceClient,
    transport: Arc<ThrottledTransport<HttpTransport>>,
}

impl ClockSync {
    pub fn new(client: BinanceClient, transport: Arc<ThrottledTransport<HttpTransport>>) -> Self {
        Self { client, transport }
    }

    /// Measure and apply the offset; returns it in milliseconds.
    pub async fn sync(&self) -> Result<i64> {
        let sent = local_time_ms();
        let server = self
            .client
            .server_time()
            .await
            .context("failed to fetch server time")?;
        let offset = clock_offset(server, sent, local_time_ms());
        self.transport.inner().set_time_offset(offset);
        debug!(offset_ms = offset, "server time synced");
        Ok(offset)
    }
}

impl std::fmt::Debug for ClockSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSync").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::{EngineEvent, EventBus};
    use crate::exit::decision::ExitEngine;
    use crate::indicators::TrendFilter;
    use crate::lifecycle::LifecycleSettings;
    use crate::recent_sells::RecentSells;
    use crate::testing::FakeExchange;
    use std::sync::atomic::Ordering;

    #[test]
    fn offset_uses_round_trip_midpoint() {
        assert_eq!(clock_offset(10_500, 10_000, 10_200), 400);
        assert_eq!(clock_offset(9_000, 10_000, 10_000), -1_000);
    }

    #[tokio::test]
    async fn ping_failures_toggle_api_status() {
        let ex = Arc::new(FakeExchange::new());
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let path = std::env::temp_dir().join(format!("health_sells_{}.json", uuid::Uuid::new_v4()));
        let lc = PositionLifecycle::new(
            ex.clone(),
            ExitEngine::new(EngineConfig::default().exit_params()),
            LifecycleSettings::default(),
            Arc::new(TrendFilter::new()),
            bus,
            Arc::new(RecentSells::open(path)),
        );

        assert!(check_api_health(&lc, ex.as_ref()).await);
        assert!(rx.try_recv().is_err());

        ex.fail_ping.store(true, Ordering::SeqCst);
        assert!(!check_api_health(&lc, ex.as_ref()).await);
        assert!(!check_api_health(&lc, ex.as_ref()).await);
        assert!(lc.is_api_down());
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::ApiStatus { up: false, .. }));
        assert!(rx.try_recv().is_err());

        ex.fail_ping.store(false, Ordering::SeqCst);
        assert!(check_api_health(&lc, ex.as_ref()).await);
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::ApiStatus { up: true, .. }));
    }
}
