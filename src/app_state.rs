// =============================================================================
// Application State — shared handles for the status API
// =============================================================================
//
// The lifecycle manager, the rate limiter and the trend filter manage their
// own interior mutability; AppState only bundles the Arcs together with the
// effective configuration and the start time.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::binance::RateLimiter;
use crate::config::EngineConfig;
use crate::indicators::TrendFilter;
use crate::lifecycle::PositionLifecycle;
use crate::types::Network;

pub struct AppState {
    pub lifecycle: Arc<PositionLifecycle>,
    pub limiter: Arc<RateLimiter>,
    pub trend: Arc<TrendFilter>,
    pub config: EngineConfig,
    pub started_at: DateTime<Utc>,
}

/// Answer to "was this symbol sold within the last N hours?".
#[derive(Debug, Clone, Serialize)]
pub struct RecentSellStatus {
    pub symbol: String,
    pub last_sell: Option<DateTime<Utc>>,
    pub window_hours: i64,
    pub sold_within: bool,
}

/// Engine-level summary served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub network: Network,
    pub tracked: usize,
    pub api_up: bool,
    pub trend_active: bool,
    pub uptime_secs: i64,
}

impl AppState {
    pub fn new(
        lifecycle: Arc<PositionLifecycle>,
        limiter: Arc<RateLimiter>,
        trend: Arc<TrendFilter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            lifecycle,
            limiter,
            trend,
            config,
            started_at: Utc::now(),
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            network: self.config.network(),
            tracked: self.lifecycle.tracked_symbols().len(),
            api_up: !self.lifecycle.is_api_down(),
            trend_active: self.trend.is_active(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0),
        }
    }
}

impl AppState {
    pub fn recent_sell(&self, symbol: &str, window_hours: i64, now: DateTime<Utc>) -> RecentSellStatus {
        let store = self.lifecycle.recent_sells();
        let symbol = symbol.to_uppercase();
        RecentSellStatus {
            last_sell: store.last_sell(&symbol),
            sold_within: store.sold_within(&symbol, chrono::Duration::hours(window_hours), now),
            symbol,
            window_hours,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("lifecycle", &self.lifecycle)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}
