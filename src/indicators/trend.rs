// =============================================================================
// Trend Filter & Volatility Hint — inputs that widen the take-profit ladder
// =============================================================================
//
// The trend filter is "BTC trades above its 7-day simple moving average".
// It is refreshed on every 15-minute boundary by a background task and read
// lock-free by every evaluation.
//
// The volatility hint is the body of the last closed candle relative to its
// open; when the trend filter is on and the hint exceeds the base margin it
// stretches the ladder up to that level.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::exchange::Exchange;
use crate::market_data::candle::{last_closed, Candle};

/// Symbol whose daily trend gates the adaptive ladder.
pub const BENCHMARK_SYMBOL: &str = "BTCUSDT";
/// Daily candles in the benchmark moving average.
pub const SMA_DAYS: usize = 7;

/// Shared on/off flag for the benchmark trend.
#[derive(Debug, Default)]
pub struct TrendFilter {
    active: AtomicBool,
}

impl TrendFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set(&self, active: bool) {
        let prev = self.active.swap(active, Ordering::Relaxed);
        if prev != active {
            info!(active, "benchmark trend filter changed");
        }
    }

    /// Re-read the benchmark; any exchange failure turns the filter off.
    pub async fn refresh(&self, exchange: &dyn Exchange) {
        let active = match benchmark_above_sma(exchange).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "trend filter refresh failed — treating as inactive");
                false
            }
        };
        self.set(active);
    }
}

async fn benchmark_above_sma(exchange: &dyn Exchange) -> anyhow::Result<bool> {
    let candles = exchange
        .klines(BENCHMARK_SYMBOL, "1d", SMA_DAYS as u32)
        .await?;
    let Some(sma) = simple_moving_average(&candles, SMA_DAYS) else {
        debug!(count = candles.len(), "not enough daily candles for benchmark SMA");
        return Ok(false);
    };
    let price = exchange.ticker_price(BENCHMARK_SYMBOL).await?;
    debug!(price = %price, sma = %sma, "benchmark trend sampled");
    Ok(price > sma)
}

/// Mean close of the last `period` candles.
pub fn simple_moving_average(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let sum: Decimal = candles[candles.len() - period..].iter().map(|c| c.close).sum();
    Some(sum / Decimal::from(period as u64))
}

/// Body ratio of the last closed candle, `0` when unavailable.
pub fn volatility_hint(candles: &[Candle]) -> Decimal {
    last_closed(candles).map(Candle::body_ratio).unwrap_or(Decimal::ZERO)
}

/// Time left until the next quarter-hour boundary.
pub fn until_next_quarter_hour(now: DateTime<Utc>) -> Duration {
    let secs_into_quarter = u64::from(now.minute() % 15) * 60 + u64::from(now.second());
    Duration::from_secs(15 * 60 - secs_into_quarter)
}

/// Refresh the filter now and then on every quarter-hour boundary.
pub async fn run_trend_monitor(filter: Arc<TrendFilter>, exchange: Arc<dyn Exchange>) {
    loop {
        filter.refresh(exchange.as_ref()).await;
        tokio::time::sleep(until_next_quarter_hour(Utc::now())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn close(c: Decimal) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: c,
            high: c,
            low: c,
            close: c,
            volume: Decimal::ZERO,
        }
    }

    #[test]
    fn sma_over_last_period() {
        let candles: Vec<Candle> = (1..=8).map(|i| close(Decimal::from(i))).collect();
        // Last 7 closes: 2..=8 → mean 5.
        assert_eq!(simple_moving_average(&candles, 7), Some(dec!(5)));
        assert_eq!(simple_moving_average(&candles[..3], 7), None);
    }

    #[test]
    fn volatility_hint_uses_closed_candle() {
        let mut closed = close(dec!(100));
        closed.close = dec!(103);
        let live = close(dec!(50));
        assert_eq!(volatility_hint(&[closed, live]), dec!(0.03));
        assert_eq!(volatility_hint(&[]), Decimal::ZERO);
    }

    #[test]
    fn quarter_hour_wait() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 10, 7, 30).unwrap();
        assert_eq!(until_next_quarter_hour(t), Duration::from_secs(7 * 60 + 30));
        let on_boundary = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap();
        assert_eq!(until_next_quarter_hour(on_boundary), Duration::from_secs(900));
    }

    #[test]
    fn filter_flag_toggles() {
        let f = TrendFilter::new();
        assert!(!f.is_active());
        f.set(true);
        assert!(f.is_active());
    }
}
