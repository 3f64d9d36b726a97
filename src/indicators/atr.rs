// =============================================================================
// Average True Range (ATR) — simple mean of True Range
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// The stop-loss floor uses the plain arithmetic mean of the last `period` TR
// values, computed from `period + 1` candles.
// =============================================================================

use rust_decimal::Decimal;

use crate::market_data::Candle;

/// Compute ATR over the last `period` True Range values.
///
/// # Returns
/// `None` when `period` is zero or fewer than `period + 1` candles are given.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let window = &candles[candles.len() - (period + 1)..];
    let mut sum = Decimal::ZERO;
    for pair in window.windows(2) {
        let prev_close = pair[0].close;
        let bar = &pair[1];

        let hl = bar.high - bar.low;
        let hc = (bar.high - prev_close).abs();
        let lc = (bar.low - prev_close).abs();

        sum += hl.max(hc).max(lc);
    }

    Some(sum / Decimal::from(period as u64))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    /// Build a test candle with the given OHLC values.
    fn candle(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open,
            high,
            low,
            close,
            volume: dec!(100),
        }
    }

    #[test]
    fn atr_period_zero() {
        let candles = vec![candle(dec!(100), dec!(105), dec!(95), dec!(102)); 20];
        assert!(calculate_atr(&candles, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        // Need period + 1 = 15 candles for period=14, only have 10.
        let candles = vec![candle(dec!(100), dec!(105), dec!(95), dec!(102)); 10];
        assert!(calculate_atr(&candles, 14).is_none());
    }

    #[test]
    fn atr_constant_range() {
        let candles = vec![candle(dec!(100), dec!(105), dec!(95), dec!(100)); 15];
        assert_eq!(calculate_atr(&candles, 14), Some(dec!(10)));
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        // Gap scenario: |H - prevClose| > H - L
        let candles = vec![
            candle(dec!(100), dec!(105), dec!(95), dec!(95)),  // close at low
            candle(dec!(110), dec!(115), dec!(108), dec!(112)), // |115-95|=20
            candle(dec!(112), dec!(118), dec!(110), dec!(115)), // H-L=8
            candle(dec!(115), dec!(120), dec!(113), dec!(118)), // max(7,5,2)=7
        ];
        assert_eq!(calculate_atr(&candles, 3), Some(dec!(35) / dec!(3)));
    }

    #[test]
    fn atr_uses_most_recent_window() {
        let mut candles = vec![candle(dec!(100), dec!(200), dec!(0), dec!(100)); 5];
        candles.extend(vec![candle(dec!(100), dec!(101), dec!(99), dec!(100)); 3]);
        // Only the last 3 candles (2 TR values) count for period=2.
        assert_eq!(calculate_atr(&candles, 2), Some(dec!(2)));
    }
}
