// =============================================================================
// Sell Execution — sizes and places the market sell for an approved exit
// =============================================================================
//
// Sizing:
//   quantity = floor_to_step(min(tracked, wallet), step)
//   capped to MARKET_LOT_SIZE.maxQty when the filter limits order size
//   below one step, below min_qty        -> dust, nothing is sent
//
// Every order carries a client order id registered before it is sent, so the
// user data stream can recognise the echo of our own sell and skip it; the
// ledger is updated here from the order response.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::binance::filters::{floor_to_step, SymbolRules};
use crate::error::ExchangeError;
use crate::events::SellReport;
use crate::exchange::Exchange;
use crate::exit::decision::ExitReason;
use crate::position::Position;

/// Own order ids older than this are forgotten even if no echo arrived.
const OWN_ORDER_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellSizing {
    Order {
        quantity: Decimal,
        /// The order was cut to the venue's per-order maximum.
        capped: bool,
    },
    Dust {
        quantity: Decimal,
    },
}

pub fn size_sell(tracked: Decimal, wallet: Decimal, rules: &SymbolRules, min_qty: Decimal) -> SellSizing {
    let available = tracked.min(wallet);
    let mut quantity = floor_to_step(available, rules.step_size);

    let capped = rules.max_qty > Decimal::ZERO && quantity > rules.max_qty;
    if capped {
        quantity = floor_to_step(rules.max_qty, rules.step_size);
    }

    if quantity <= Decimal::ZERO || quantity < rules.step_size || quantity < min_qty.max(rules.min_qty) {
        return SellSizing::Dust { quantity: available };
    }
    SellSizing::Order { quantity, capped }
}

/// Outcome of one liquidation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Nothing sellable; the position should be retired.
    Dust { quantity: Decimal },
    Filled {
        report: SellReport,
        /// The position is finished (no sellable remainder).
        closed: bool,
    },
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dust { quantity } => write!(f, "Dust({quantity})"),
            Self::Filled { report, closed } => write!(
                f,
                "Filled({} @ {}, closed={closed})",
                report.quantity, report.exit_price
            ),
        }
    }
}

pub struct SellExecutor {
    exchange: Arc<dyn Exchange>,
    own_orders: Mutex<HashMap<String, Instant>>,
}

impl SellExecutor {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self {
            exchange,
            own_orders: Mutex::new(HashMap::new()),
        }
    }

    /// Consume the registration of one of our own orders; `true` when the
    /// id was ours.
    pub fn take_own_order(&self, client_order_id: &str) -> bool {
        self.own_orders.lock().remove(client_order_id).is_some()
    }

    fn register(&self) -> String {
        let id = format!("xs-{}", Uuid::new_v4().simple());
        let mut orders = self.own_orders.lock();
        orders.retain(|_, at| at.elapsed() < OWN_ORDER_TTL);
        orders.insert(id.clone(), Instant::now());
        id
    }

    /// Sell `position` for `reason`.  On success the ledger already reflects
    /// the executed quantity; on failure the position is untouched.
    pub async fn liquidate(
        &self,
        position: &mut Position,
        rules: &SymbolRules,
        wallet: Decimal,
        reason: ExitReason,
    ) -> Result<ExecutionResult, ExchangeError> {
        let symbol = position.symbol.clone();
        let (quantity, capped) = match size_sell(position.quantity(), wallet, rules, position.min_qty) {
            SellSizing::Dust { quantity } => {
                info!(symbol = %symbol, quantity = %quantity, "balance too small to sell");
                return Ok(ExecutionResult::Dust { quantity });
            }
            SellSizing::Order { quantity, capped } => (quantity, capped),
        };

        let entry_price = position.average_price();
        let client_order_id = self.register();
        debug!(symbol = %symbol, quantity = %quantity, capped, client_order_id = %client_order_id, reason = %reason, "placing market sell");

        let fill = match self.exchange.market_sell(&symbol, quantity, &client_order_id).await {
            Ok(fill) => fill,
            Err(e) => {
                self.take_own_order(&client_order_id);
                warn!(symbol = %symbol, quantity = %quantity, error = %e, "market sell failed — position kept");
                return Err(e);
            }
        };

        let executed = if fill.executed_quantity.is_zero() {
            quantity
        } else {
            fill.executed_quantity
        };
        position.tracker.consume(executed);

        let closed = !capped || position.below_min_qty();
        if !closed {
            if let Some(rung) = reason.rung() {
                position.passed_steps.insert(rung);
            }
        }

        let report = SellReport::new(&symbol, fill.order_id, executed, entry_price, fill.average_price, reason);
        info!(
            symbol = %symbol,
            quantity = %executed,
            entry = %entry_price.round_dp(8),
            exit = %fill.average_price.round_dp(8),
            profit = %report.profit.round_dp(4),
            profit_pct = %report.profit_pct.round_dp(2),
            closed,
            "position sold"
        );
        Ok(ExecutionResult::Filled { report, closed })
    }
}

impl std::fmt::Debug for SellExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SellExecutor")
            .field("own_orders", &self.own_orders.lock().len())
            .finish()
    }
}
