// =============================================================================
// Exit Decision Engine — per-tick sell / hold verdicts
// =============================================================================
//
// Evaluation order (first match wins):
//   1. Degenerate cost basis (average price 0)        -> sell
//   2. Stop-loss (avg - ATR * k), when enabled        -> sell
//   3. Extreme profit (>= top rung * 5 over reference)-> sell
//   4. Intermediate rung reached then given back      -> sell
//   5. Top rung reached                               -> confirm on the tape
//   6. Top rung reached earlier, price back below it  -> sell
//   7. Otherwise                                      -> hold
//
// Step 5 needs a fresh trade-tape sample, so the engine hands back
// `ConfirmBreakout` and the caller finishes with `confirm_breakout` once the
// sample is in.  Everything here is synchronous and exchange-free.
// =============================================================================

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::exit::ladder::{self, ExitParams};
use crate::market_data::TapeSample;
use crate::position::Position;

/// Market inputs for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitInputs {
    pub price: Decimal,
    pub trend_active: bool,
    pub volatility_hint: Decimal,
    /// Open of the most recent closed candle.
    pub last_closed_open: Option<Decimal>,
    /// Only consulted when the stop-loss is enabled.
    pub atr: Option<Decimal>,
}

/// Why a position is being liquidated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum ExitReason {
    DegenerateCostBasis,
    StopLoss { floor: Decimal },
    ExtremeProfit { profit_ratio: Decimal },
    RungGiveBack { rung: Decimal, target: Decimal },
    VolumeReversal { buy_volume: Decimal, sell_volume: Decimal },
    BreakoutPullback { top_target: Decimal },
}

impl ExitReason {
    /// Rung a partial liquidation should mark as passed.
    pub fn rung(&self) -> Option<Decimal> {
        match self {
            Self::RungGiveBack { rung, .. } => Some(*rung),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DegenerateCostBasis => write!(f, "average price is zero"),
            Self::StopLoss { floor } => write!(f, "stop-loss at {floor}"),
            Self::ExtremeProfit { profit_ratio } => {
                write!(f, "extreme profit {}%", (profit_ratio * Decimal::ONE_HUNDRED).round_dp(2))
            }
            Self::RungGiveBack { target, .. } => write!(f, "fell back below {target}"),
            Self::VolumeReversal {
                buy_volume,
                sell_volume,
            } => write!(f, "sell volume {sell_volume} > buy volume {buy_volume} at top target"),
            Self::BreakoutPullback { top_target } => write!(f, "fell back below top target {top_target}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Hold,
    Sell(ExitReason),
    /// Price is at or above the top target; sample the tape and call
    /// [`ExitEngine::confirm_breakout`].
    ConfirmBreakout { top_target: Decimal },
}

#[derive(Debug, Clone, Default)]
pub struct ExitEngine {
    params: ExitParams,
}

impl ExitEngine {
    pub fn new(params: ExitParams) -> Self {
        Self { params }
    }

    /// Whether evaluations need an ATR value.
    pub fn atr_period(&self) -> Option<usize> {
        self.params.stop_loss.as_ref().map(|s| s.atr_period)
    }

    /// Run one evaluation, updating the position's peak, ladder and flags.
    pub fn evaluate(&self, position: &mut Position, inputs: &ExitInputs) -> Verdict {
        let price = inputs.price;
        let avg = position.average_price();

        if avg.is_zero() {
            info!(symbol = %position.symbol, "average price is zero — selling first");
            return Verdict::Sell(ExitReason::DegenerateCostBasis);
        }

        if let (Some(stop), Some(atr)) = (&self.params.stop_loss, inputs.atr) {
            let floor = avg - atr * stop.multiplier;
            if atr > Decimal::ZERO && price <= floor {
                info!(
                    symbol = %position.symbol,
                    price = %price,
                    floor = %floor,
                    "price at or below stop-loss floor"
                );
                return Verdict::Sell(ExitReason::StopLoss { floor });
            }
        }

        let rungs = self.params.rungs(inputs.trend_active, inputs.volatility_hint);
        let reference = ladder::reference_price(avg, inputs.last_closed_open, inputs.trend_active);
        let targets = ladder::targets(reference, &rungs);
        if position.rebase(reference, price) {
            debug!(symbol = %position.symbol, reference = %reference, "ladder rebased — peak restarted");
        }
        position.set_targets(targets.clone());
        position.record_peak(price);

        let (Some(&top_rung), Some(&top_target)) = (rungs.last(), targets.last()) else {
            return Verdict::Hold;
        };

        let profit_ratio = if reference.is_zero() {
            Decimal::ZERO
        } else {
            (price - reference) / reference
        };
        if profit_ratio >= top_rung * self.params.extreme_multiple {
            if !position.extreme_logged {
                info!(
                    symbol = %position.symbol,
                    profit_pct = %(profit_ratio * Decimal::ONE_HUNDRED).round_dp(2),
                    "profit beyond extreme multiple of top target — selling without volume check"
                );
                position.extreme_logged = true;
            }
            return Verdict::Sell(ExitReason::ExtremeProfit { profit_ratio });
        }

        let intermediate = rungs.len() - 1;
        for (&rung, &target) in rungs[..intermediate].iter().zip(&targets[..intermediate]) {
            if position.peak >= target && target > price && !position.passed_steps.contains(&rung) {
                info!(
                    symbol = %position.symbol,
                    target = %target,
                    peak = %position.peak,
                    price = %price,
                    "price gave back an intermediate target"
                );
                return Verdict::Sell(ExitReason::RungGiveBack { rung, target });
            }
            if position.peak < target {
                break;
            }
        }

        if price >= top_target {
            return Verdict::ConfirmBreakout { top_target };
        }
        if position.hit_top_target {
            info!(
                symbol = %position.symbol,
                price = %price,
                top_target = %top_target,
                "price fell back below the top target"
            );
            return Verdict::Sell(ExitReason::BreakoutPullback { top_target });
        }

        debug!(
            symbol = %position.symbol,
            price = %price,
            reference = %reference,
            top_target = %top_target,
            "hold"
        );
        Verdict::Hold
    }

    /// Second half of a top-rung evaluation: the position has reached its top
    /// target, sell only if aggressive sellers dominate the tape.
    pub fn confirm_breakout(&self, position: &mut Position, tape: &TapeSample) -> Verdict {
        position.hit_top_target = true;
        let sell = tape.is_reversal();
        info!(
            symbol = %position.symbol,
            sell_volume = %tape.sell_volume,
            buy_volume = %tape.buy_volume,
            trades = tape.trades,
            sell,
            "top target volume check"
        );
        if sell {
            Verdict::Sell(ExitReason::VolumeReversal {
                buy_volume: tape.buy_volume,
                sell_volume: tape.sell_volume,
            })
        } else {
            Verdict::Hold
        }
    }
}
