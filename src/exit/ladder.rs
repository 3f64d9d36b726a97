// =============================================================================
// Take-Profit Ladder — rung margins, reference price, price targets
// =============================================================================
//
// The base rung covers both fees plus the minimum profit margin.  When the
// benchmark trend is up and the last closed candle moved more than the base
// margin, `N` extra rungs are spread evenly between the base margin and that
// move:
//
//   rung_i = base + (vol - base) * i / N        for i = 1..=N
//
// Targets are `reference * (1 + rung)`, where the reference is the average
// cost, lifted to the last closed candle's open when the trend is up and the
// market already trades above cost.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Profit required at the top rung, as a multiple of that rung, before the
/// engine sells without waiting for tape confirmation.
pub const EXTREME_PROFIT_MULTIPLE: u32 = 5;

/// Exit thresholds, all expressed as fractions (`0.001` = 0.1 %).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitParams {
    pub buy_fee: Decimal,
    pub sell_fee: Decimal,
    pub min_profit: Decimal,
    /// Extra rungs added when the trend filter allows it.
    pub target_steps: u32,
    pub stop_loss: Option<StopLossParams>,
    pub extreme_multiple: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossParams {
    pub atr_period: usize,
    pub multiplier: Decimal,
}

impl ExitParams {
    pub fn base_margin(&self) -> Decimal {
        self.buy_fee + self.sell_fee + self.min_profit
    }

    /// Sorted, de-duplicated rung margins.
    pub fn rungs(&self, trend_active: bool, volatility_hint: Decimal) -> Vec<Decimal> {
        build_rungs(
            self.base_margin(),
            trend_active,
            volatility_hint,
            self.target_steps,
        )
    }
}

impl Default for ExitParams {
    fn default() -> Self {
        Self {
            buy_fee: Decimal::new(1, 3),
            sell_fee: Decimal::new(1, 3),
            min_profit: Decimal::new(5, 3),
            target_steps: 3,
            stop_loss: None,
            extreme_multiple: Decimal::from(EXTREME_PROFIT_MULTIPLE),
        }
    }
}

pub fn build_rungs(
    base: Decimal,
    trend_active: bool,
    volatility_hint: Decimal,
    steps: u32,
) -> Vec<Decimal> {
    let mut rungs = vec![base];
    if trend_active && volatility_hint > base && steps > 0 {
        let n = Decimal::from(steps);
        for i in 1..=steps {
            rungs.push(base + (volatility_hint - base) * Decimal::from(i) / n);
        }
    }
    rungs.sort();
    rungs.dedup();
    rungs
}

pub fn reference_price(
    average_price: Decimal,
    last_closed_open: Option<Decimal>,
    trend_active: bool,
) -> Decimal {
    match last_closed_open {
        Some(open) if trend_active && open > average_price => open,
        _ => average_price,
    }
}

pub fn targets(reference: Decimal, rungs: &[Decimal]) -> Vec<Decimal> {
    rungs
        .iter()
        .map(|r| reference * (Decimal::ONE + r))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn base_only_without_trend() {
        assert_eq!(build_rungs(dec!(0.007), false, dec!(0.05), 3), vec![dec!(0.007)]);
    }

    #[test]
    fn base_only_when_move_is_small() {
        assert_eq!(build_rungs(dec!(0.007), true, dec!(0.005), 3), vec![dec!(0.007)]);
    }

    #[test]
    fn rungs_spread_up_to_volatility() {
        let rungs = build_rungs(dec!(0.01), true, dec!(0.04), 3);
        assert_eq!(rungs, vec![dec!(0.01), dec!(0.02), dec!(0.03), dec!(0.04)]);
    }

    #[test]
    fn zero_steps_keeps_base() {
        assert_eq!(build_rungs(dec!(0.01), true, dec!(0.04), 0), vec![dec!(0.01)]);
    }

    #[test]
    fn reference_lifts_only_with_trend() {
        assert_eq!(reference_price(dec!(100), Some(dec!(105)), true), dec!(105));
        assert_eq!(reference_price(dec!(100), Some(dec!(105)), false), dec!(100));
        assert_eq!(reference_price(dec!(100), Some(dec!(95)), true), dec!(100));
        assert_eq!(reference_price(dec!(100), None, true), dec!(100));
    }

    #[test]
    fn targets_scale_reference() {
        assert_eq!(
            targets(dec!(100), &[dec!(0.005), dec!(0.01)]),
            vec![dec!(100.5), dec!(101)]
        );
    }

    #[test]
    fn default_base_margin() {
        assert_eq!(ExitParams::default().base_margin(), dec!(0.007));
    }
}
