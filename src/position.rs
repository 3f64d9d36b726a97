// =============================================================================
// Position — cost basis plus exit-ladder state for one held asset
// =============================================================================
//
// Life-cycle:
//   Tracking  ->  TopTargetReached  ->  Closed
//   Tracking  ->  Closed (stop-loss / extreme profit / rung give-back / dust)
//
// A position is owned by the lifecycle manager behind its own async lock;
// nothing in here is shared or synchronised.
// =============================================================================

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::cost_basis::CostBasisTracker;

/// Where a position sits in the exit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PositionPhase {
    Tracking,
    TopTargetReached,
    Closed,
}

impl std::fmt::Display for PositionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tracking => write!(f, "Tracking"),
            Self::TopTargetReached => write!(f, "TopTargetReached"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub tracker: CostBasisTracker,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
    /// Highest price observed since the ladder was last rebased.
    pub peak: Decimal,
    /// Price the current ladder was built from.
    pub reference: Option<Decimal>,
    /// Current take-profit ladder, ascending.
    pub targets: Vec<Decimal>,
    /// Rung margins already partially liquidated; they do not fire again.
    pub passed_steps: BTreeSet<Decimal>,
    pub last_observed_price: Option<Decimal>,
    pub hit_top_target: bool,
    pub extreme_logged: bool,
    /// Set once the position has left the book; late work must discard itself.
    pub retired: bool,
    pub opened_at: DateTime<Utc>,
    /// Last time lots were added; wallet reads older than this are stale.
    pub ledger_changed_at: Instant,
}

impl Position {
    pub fn new(symbol: impl Into<String>, min_qty: Decimal, min_notional: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            tracker: CostBasisTracker::new(),
            min_qty,
            min_notional,
            peak: Decimal::ZERO,
            reference: None,
            targets: Vec::new(),
            passed_steps: BTreeSet::new(),
            last_observed_price: None,
            hit_top_target: false,
            extreme_logged: false,
            retired: false,
            opened_at: Utc::now(),
            ledger_changed_at: Instant::now(),
        }
    }

    /// Build a position from an existing ledger.
    pub fn with_tracker(
        symbol: impl Into<String>,
        tracker: CostBasisTracker,
        min_qty: Decimal,
        min_notional: Decimal,
    ) -> Self {
        Self {
            tracker,
            ..Self::new(symbol, min_qty, min_notional)
        }
    }

    pub fn quantity(&self) -> Decimal {
        self.tracker.total_quantity()
    }

    pub fn average_price(&self) -> Decimal {
        self.tracker.average_price()
    }

    pub fn below_min_qty(&self) -> bool {
        self.quantity() < self.min_qty
    }

    /// Worth following at `price`: enough quantity and enough notional.
    pub fn is_tradeable(&self, price: Decimal) -> bool {
        let qty = self.quantity();
        qty > Decimal::ZERO && qty >= self.min_qty && qty * price >= self.min_notional
    }

    pub fn phase(&self) -> PositionPhase {
        if self.retired {
            PositionPhase::Closed
        } else if self.hit_top_target {
            PositionPhase::TopTargetReached
        } else {
            PositionPhase::Tracking
        }
    }

    /// Remember `price`; returns whether it differs from the last one seen.
    pub fn observe_price(&mut self, price: Decimal) -> bool {
        let changed = self.last_observed_price != Some(price);
        self.last_observed_price = Some(price);
        changed
    }

    /// Build the ladder on `reference`.  A moved reference (new lots, a
    /// higher candle open) restarts the peak at `price`; returns whether it
    /// moved.
    pub fn rebase(&mut self, reference: Decimal, price: Decimal) -> bool {
        if self.reference == Some(reference) {
            return false;
        }
        self.reference = Some(reference);
        self.peak = price;
        true
    }

    pub fn record_peak(&mut self, price: Decimal) {
        if price > self.peak {
            self.peak = price;
        }
    }

    /// Install a new ladder, logging only when it actually moved.
    pub fn set_targets(&mut self, targets: Vec<Decimal>) {
        if targets != self.targets {
            info!(
                symbol = %self.symbol,
                targets = ?targets.iter().map(|t| t.round_dp(8).to_string()).collect::<Vec<_>>(),
                "take-profit targets updated"
            );
            self.targets = targets;
        }
    }

    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        let quantity = self.quantity();
        let average_price = self.average_price();
        let unrealized_pnl_pct = match self.last_observed_price {
            Some(p) if !average_price.is_zero() => {
                Some(((p - average_price) / average_price * Decimal::ONE_HUNDRED).round_dp(4))
            }
            _ => None,
        };
        PositionSnapshot {
            symbol: self.symbol.clone(),
            phase: self.phase(),
            quantity,
            average_price,
            lots: self.tracker.lots().count(),
            peak: self.peak,
            reference: self.reference,
            targets: self.targets.clone(),
            passed_steps: self.passed_steps.iter().copied().collect(),
            last_price: self.last_observed_price,
            unrealized_pnl_pct,
            hit_top_target: self.hit_top_target,
            opened_at: self.opened_at.to_rfc3339(),
        }
    }
}

/// Read-only view served by the status API.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub phase: PositionPhase,
    pub quantity: Decimal,
    pub average_price: Decimal,
    pub lots: usize,
    pub peak: Decimal,
    pub reference: Option<Decimal>,
    pub targets: Vec<Decimal>,
    pub passed_steps: Vec<Decimal>,
    pub last_price: Option<Decimal>,
    pub unrealized_pnl_pct: Option<Decimal>,
    pub hit_top_target: bool,
    pub opened_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(qty: Decimal, price: Decimal) -> Position {
        let mut p = Position::new("CAKEUSDT", dec!(0.01), dec!(5));
        p.tracker.add_lot(qty, price);
        p
    }

    #[test]
    fn tradeable_needs_quantity_and_notional() {
        let p = position(dec!(2), dec!(3));
        assert!(p.is_tradeable(dec!(3)));
        // 2 × 2 = 4 < 5 notional.
        assert!(!p.is_tradeable(dec!(2)));

        let dust = position(dec!(0.005), dec!(3000));
        assert!(dust.below_min_qty());
        assert!(!dust.is_tradeable(dec!(3000)));
    }

    #[test]
    fn phase_follows_flags() {
        let mut p = position(dec!(1), dec!(10));
        assert_eq!(p.phase(), PositionPhase::Tracking);
        p.hit_top_target = true;
        assert_eq!(p.phase(), PositionPhase::TopTargetReached);
        p.retire();
        assert_eq!(p.phase(), PositionPhase::Closed);
    }

    #[test]
    fn peak_only_rises() {
        let mut p = position(dec!(1), dec!(10));
        p.record_peak(dec!(11));
        p.record_peak(dec!(10.5));
        assert_eq!(p.peak, dec!(11));
    }

    #[test]
    fn moved_reference_restarts_peak() {
        let mut p = position(dec!(1), dec!(3));
        p.peak = dec!(3.3);
        assert!(p.rebase(dec!(3.25), dec!(3.18)));
        assert_eq!(p.peak, dec!(3.18));

        p.record_peak(dec!(3.2));
        assert!(!p.rebase(dec!(3.25), dec!(3.1)));
        assert_eq!(p.peak, dec!(3.2));
    }

    #[test]
    fn observe_price_reports_changes() {
        let mut p = position(dec!(1), dec!(10));
        assert!(p.observe_price(dec!(10)));
        assert!(!p.observe_price(dec!(10)));
        assert!(p.observe_price(dec!(10.1)));
    }

    #[test]
    fn snapshot_reports_pnl() {
        let mut p = position(dec!(1), dec!(100));
        p.observe_price(dec!(101));
        let snap = p.snapshot();
        assert_eq!(snap.average_price, dec!(100));
        assert_eq!(snap.unrealized_pnl_pct, Some(dec!(1)));
        assert_eq!(snap.lots, 1);
    }
}
