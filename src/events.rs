// =============================================================================
// Engine Events — state transitions broadcast to observers
// =============================================================================
//
// Every event is published after the state change it describes has been
// applied.  Publishing never blocks and never fails: with no subscriber the
// event is simply dropped.
// =============================================================================

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::exit::decision::ExitReason;
use crate::types::Network;

const EVENT_CAPACITY: usize = 256;

/// How a position came to be tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpenSource {
    Fill,
    BalanceScan,
}

/// Why a position stopped being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// Liquidated by the engine.
    Sold,
    /// Too small to sell under the symbol's lot rules.
    Dust,
    /// Sold or withdrawn outside the engine.
    ExternalDisposal,
    /// A fill left it below the follow thresholds.
    BelowThreshold,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sold => write!(f, "sold"),
            Self::Dust => write!(f, "dust balance"),
            Self::ExternalDisposal => write!(f, "sold or withdrawn externally"),
            Self::BelowThreshold => write!(f, "below follow threshold"),
        }
    }
}

/// Outcome of one completed liquidation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SellReport {
    pub symbol: String,
    pub order_id: u64,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub profit: Decimal,
    pub profit_pct: Decimal,
    pub reason: ExitReason,
}

impl SellReport {
    pub fn new(
        symbol: impl Into<String>,
        order_id: u64,
        quantity: Decimal,
        entry_price: Decimal,
        exit_price: Decimal,
        reason: ExitReason,
    ) -> Self {
        let profit = (exit_price - entry_price) * quantity;
        let profit_pct = if entry_price.is_zero() {
            Decimal::ZERO
        } else {
            (exit_price - entry_price) / entry_price * Decimal::ONE_HUNDRED
        };
        Self {
            symbol: symbol.into(),
            order_id,
            quantity,
            entry_price,
            exit_price,
            profit,
            profit_pct,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    Started {
        network: Network,
        tracked: Vec<String>,
    },
    BuyRecorded {
        symbol: String,
        quantity: Decimal,
        price: Decimal,
        average_price: Decimal,
    },
    PositionOpened {
        symbol: String,
        quantity: Decimal,
        average_price: Decimal,
        last_price: Decimal,
        source: OpenSource,
    },
    PositionClosed {
        symbol: String,
        reason: CloseReason,
    },
    SellCompleted(SellReport),
    SellFailed {
        symbol: String,
        error: String,
    },
    ApiStatus {
        up: bool,
        detail: Option<String>,
    },
}

/// Fan-out channel for engine events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn sell_report_profit() {
        let r = SellReport::new("CAKEUSDT", 1, dec!(2), dec!(10), dec!(11), ExitReason::DegenerateCostBasis);
        assert_eq!(r.profit, dec!(2));
        assert_eq!(r.profit_pct, dec!(10));

        let free = SellReport::new("XUSDT", 2, dec!(1), Decimal::ZERO, dec!(3), ExitReason::DegenerateCostBasis);
        assert_eq!(free.profit_pct, Decimal::ZERO);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::PositionClosed {
            symbol: "CAKEUSDT".into(),
            reason: CloseReason::Dust,
        });
        match rx.recv().await.unwrap() {
            EngineEvent::PositionClosed { reason, .. } => assert_eq!(reason, CloseReason::Dust),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        EventBus::new().publish(EngineEvent::ApiStatus { up: true, detail: None });
    }
}
