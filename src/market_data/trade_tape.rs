// =============================================================================
// Trade Tape Sample — aggressor-side volume over the most recent prints
// =============================================================================

use rust_decimal::Decimal;
use serde::Serialize;

use crate::exchange::TapeTrade;

/// Number of recent prints pulled when a breakout needs confirming.
pub const TAPE_SAMPLE_SIZE: u32 = 60;

/// Base-asset volume split by aggressor side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TapeSample {
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub trades: usize,
}

impl TapeSample {
    pub fn from_trades(trades: &[TapeTrade]) -> Self {
        let mut sample = Self {
            trades: trades.len(),
            ..Self::default()
        };
        for t in trades {
            if t.is_buyer_maker {
                // Buyer is maker => taker is selling.
                sample.sell_volume += t.quantity;
            } else {
                sample.buy_volume += t.quantity;
            }
        }
        sample
    }

    /// Sellers are hitting bids harder than buyers lift offers.
    pub fn is_reversal(&self) -> bool {
        self.sell_volume > self.buy_volume
    }
}
