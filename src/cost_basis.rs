// =============================================================================
// Cost Basis Tracker — FIFO lot ledger for a single asset
// =============================================================================
//
// Acquisitions append lots, disposals consume from the oldest lot first.
// All arithmetic is `rust_decimal::Decimal`: the ledger sees thousands of
// micro-fills over its lifetime and binary floating point drifts.
//
// A fill reported at a price of exactly zero is recorded at ZERO_PRICE_FLOOR
// so that the average price stays computable.
// =============================================================================

use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde::Serialize;

/// Substitute unit price for fills the exchange reports at `0` (1e-7).
pub const ZERO_PRICE_FLOOR: Decimal = Decimal::from_parts(1, 0, 0, false, 7);

/// One acquisition batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lot {
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

/// FIFO ledger of lots, oldest first.
#[derive(Debug, Clone, Default)]
pub struct CostBasisTracker {
    lots: VecDeque<Lot>,
}

impl CostBasisTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acquisition.  Non-positive quantities carry nothing and are
    /// ignored so that every retained lot stays strictly positive.
    pub fn add_lot(&mut self, quantity: Decimal, price: Decimal) {
        if quantity <= Decimal::ZERO {
            return;
        }
        let unit_price = if price.is_zero() {
            ZERO_PRICE_FLOOR
        } else {
            price
        };
        self.lots.push_back(Lot {
            quantity,
            unit_price,
        });
    }

    /// Remove `quantity` units oldest-first.  Asking for more than is held
    /// empties the ledger and stops there.
    pub fn consume(&mut self, quantity: Decimal) {
        let mut remaining = quantity;
        while remaining > Decimal::ZERO {
            let Some(front) = self.lots.front_mut() else {
                break;
            };
            if front.quantity > remaining {
                front.quantity -= remaining;
                remaining = Decimal::ZERO;
            } else {
                remaining -= front.quantity;
                self.lots.pop_front();
            }
        }
    }

    pub fn total_quantity(&self) -> Decimal {
        self.lots.iter().map(|l| l.quantity).sum()
    }

    /// Quantity-weighted average unit price, `0` for an empty ledger.
    pub fn average_price(&self) -> Decimal {
        let total = self.total_quantity();
        if total.is_zero() {
            return Decimal::ZERO;
        }
        let cost: Decimal = self.lots.iter().map(|l| l.quantity * l.unit_price).sum();
        cost / total
    }

    pub fn lots(&self) -> impl Iterator<Item = &Lot> {
        self.lots.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }
}
