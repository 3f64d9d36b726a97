// =============================================================================
// Ledger Reconciliation — rebuild cost basis from history, align with wallet
// =============================================================================
//
// A held asset is turned into a ledger by replaying the full account trade
// history oldest-first:
//   buy  -> add (qty - commission when paid in the base asset)
//   sell -> consume (qty + commission when paid in the base asset)
//
// The wallet is the source of truth for quantity.  When history and wallet
// disagree:
//   history > wallet -> consume the excess (sold or withdrawn off-book)
//   history < wallet -> add the missing amount at the current average price,
//                       or at the zero-price floor for an empty ledger
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::binance::filters::SymbolRules;
use crate::cost_basis::{CostBasisTracker, ZERO_PRICE_FLOOR};
use crate::error::ExchangeError;
use crate::exchange::{AccountTrade, Exchange};
use crate::types::BalanceInfo;

/// Largest page the account trade endpoint returns.
pub const TRADE_PAGE_SIZE: u32 = 1000;
const PAGE_PAUSE: Duration = Duration::from_millis(200);

/// Wallet and ledger quantities closer than this are considered equal.
pub const WALLET_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 8);

/// Quote assets never tracked as positions.
const STABLE_QUOTES: [&str; 2] = ["USDT", "BUSD"];

pub fn apply_account_trade(tracker: &mut CostBasisTracker, trade: &AccountTrade, base_asset: &str) {
    let commission_in_base = trade.commission_asset == base_asset;
    if trade.is_buyer {
        let mut qty = trade.quantity;
        if commission_in_base {
            qty -= trade.commission;
        }
        tracker.add_lot(qty, trade.price);
    } else {
        let mut qty = trade.quantity;
        if commission_in_base {
            qty += trade.commission;
        }
        tracker.consume(qty);
    }
}

pub fn rebuild_ledger(trades: &[AccountTrade], base_asset: &str) -> CostBasisTracker {
    let mut ordered: Vec<&AccountTrade> = trades.iter().collect();
    ordered.sort_by_key(|t| (t.time, t.id));

    let mut tracker = CostBasisTracker::new();
    for trade in ordered {
        apply_account_trade(&mut tracker, trade, base_asset);
    }
    tracker
}

/// What `align_with_wallet` had to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Alignment {
    Matched,
    Consumed(Decimal),
    Added { quantity: Decimal, price: Decimal },
}

pub fn align_with_wallet(tracker: &mut CostBasisTracker, wallet: Decimal) -> Alignment {
    let ledger = tracker.total_quantity();
    if (ledger - wallet).abs() <= WALLET_TOLERANCE {
        return Alignment::Matched;
    }
    if ledger > wallet {
        let excess = ledger - wallet;
        tracker.consume(excess);
        Alignment::Consumed(excess)
    } else {
        let missing = wallet - ledger;
        let price = if tracker.is_empty() {
            ZERO_PRICE_FLOOR
        } else {
            tracker.average_price()
        };
        tracker.add_lot(missing, price);
        Alignment::Added {
            quantity: missing,
            price,
        }
    }
}

/// Page through the complete account trade history of `symbol`, starting
/// from trade id 0.
pub async fn fetch_all_trades(
    exchange: &dyn Exchange,
    symbol: &str,
) -> Result<Vec<AccountTrade>, ExchangeError> {
    let mut all = Vec::new();
    let mut from_id = 0;
    loop {
        let page = exchange
            .account_trades(symbol, from_id, TRADE_PAGE_SIZE)
            .await?;
        let full = page.len() as u32 >= TRADE_PAGE_SIZE;
        let last_id = page.last().map(|t| t.id);
        all.extend(page);
        match last_id {
            Some(id) if full => {
                from_id = id + 1;
                tokio::time::sleep(PAGE_PAUSE).await;
            }
            _ => break,
        }
    }
    debug!(symbol, trades = all.len(), "account history fetched");
    Ok(all)
}

/// A wallet balance that qualifies for tracking.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub symbol: String,
    pub rules: SymbolRules,
    pub tracker: CostBasisTracker,
    pub min_notional: Decimal,
    pub last_price: Decimal,
}

/// Turn one wallet balance into a tracked ledger, or `None` when the asset
/// is a quote currency, unlisted, or below the follow thresholds.
pub async fn discover_position(
    exchange: &dyn Exchange,
    balance: &BalanceInfo,
    quote_asset: &str,
    min_follow_notional: Decimal,
) -> Result<Option<Discovery>> {
    let wallet = balance.total();
    if wallet <= Decimal::ZERO
        || balance.asset == quote_asset
        || STABLE_QUOTES.contains(&balance.asset.as_str())
    {
        return Ok(None);
    }
    let symbol = format!("{}{}", balance.asset, quote_asset);

    let Some(rules) = exchange
        .symbol_rules(&symbol)
        .await
        .with_context(|| format!("failed to load rules for {symbol}"))?
    else {
        return Ok(None);
    };
    if wallet < rules.min_qty {
        debug!(symbol = %symbol, wallet = %wallet, min_qty = %rules.min_qty, "balance below minQty");
        return Ok(None);
    }

    let trades = fetch_all_trades(exchange, &symbol)
        .await
        .with_context(|| format!("failed to fetch trade history for {symbol}"))?;
    let mut tracker = rebuild_ledger(&trades, &balance.asset);

    let last_price = match exchange.ticker_price(&symbol).await {
        Ok(p) => p,
        Err(_) => tracker.average_price(),
    };

    let alignment = align_with_wallet(&mut tracker, wallet);
    if alignment != Alignment::Matched {
        info!(symbol = %symbol, ?alignment, "ledger aligned with wallet");
    }

    let min_notional = rules.min_notional.max(min_follow_notional);
    let qty = tracker.total_quantity();
    if qty < rules.min_qty || qty * last_price < min_notional {
        debug!(
            symbol = %symbol,
            quantity = %qty,
            notional = %(qty * last_price),
            "balance below follow threshold"
        );
        return Ok(None);
    }

    Ok(Some(Discovery {
        symbol,
        rules,
        tracker,
        min_notional,
        last_price,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{buy_trade, sell_trade, FakeExchange};
    use rust_decimal_macros::dec;

    #[test]
    fn ledger_replays_with_base_commission() {
        let mut buy = buy_trade(1, dec!(10), dec!(2));
        buy.commission = dec!(0.01);
        buy.commission_asset = "CAKE".into();
        let mut sell = sell_trade(2, dec!(4), dec!(3));
        sell.commission = dec!(0.01);
        sell.commission_asset = "CAKE".into();

        let tracker = rebuild_ledger(&[sell, buy], "CAKE");
        // 9.99 bought, 4.01 sold.
        assert_eq!(tracker.total_quantity(), dec!(5.98));
        assert_eq!(tracker.average_price(), dec!(2));
    }

    #[test]
    fn quote_commission_does_not_touch_quantity() {
        let mut buy = buy_trade(1, dec!(10), dec!(2));
        buy.commission = dec!(0.02);
        buy.commission_asset = "USDT".into();
        assert_eq!(rebuild_ledger(&[buy], "CAKE").total_quantity(), dec!(10));
    }

    #[test]
    fn wallet_shortfall_is_consumed_fifo() {
        let mut t = CostBasisTracker::new();
        t.add_lot(dec!(1), dec!(10));
        t.add_lot(dec!(1), dec!(20));
        assert_eq!(align_with_wallet(&mut t, dec!(1.5)), Alignment::Consumed(dec!(0.5)));
        assert_eq!(t.total_quantity(), dec!(1.5));
    }

    #[test]
    fn wallet_surplus_added_at_average_or_floor() {
        let mut t = CostBasisTracker::new();
        t.add_lot(dec!(1), dec!(10));
        assert_eq!(
            align_with_wallet(&mut t, dec!(3)),
            Alignment::Added { quantity: dec!(2), price: dec!(10) }
        );

        let mut empty = CostBasisTracker::new();
        assert_eq!(
            align_with_wallet(&mut empty, dec!(5)),
            Alignment::Added { quantity: dec!(5), price: ZERO_PRICE_FLOOR }
        );
        assert_eq!(empty.average_price(), ZERO_PRICE_FLOOR);
    }

    #[test]
    fn tiny_drift_is_ignored() {
        let mut t = CostBasisTracker::new();
        t.add_lot(dec!(1), dec!(10));
        assert_eq!(align_with_wallet(&mut t, dec!(1.000000001)), Alignment::Matched);
    }

    #[tokio::test]
    async fn history_pages_from_zero() {
        let ex = FakeExchange::new();
        for id in 0..(TRADE_PAGE_SIZE as u64 + 5) {
            ex.push_history("CAKEUSDT", buy_trade(id, dec!(1), dec!(2)));
        }
        let trades = fetch_all_trades(&ex, "CAKEUSDT").await.unwrap();
        assert_eq!(trades.len(), TRADE_PAGE_SIZE as usize + 5);
        assert_eq!(trades[0].id, 0);
    }

    fn balance(asset: &str, free: Decimal) -> BalanceInfo {
        BalanceInfo {
            asset: asset.into(),
            free,
            locked: Decimal::ZERO,
        }
    }

    fn venue() -> FakeExchange {
        let ex = FakeExchange::new();
        ex.list("CAKEUSDT", "CAKE", dec!(0.01), dec!(0.01), dec!(1));
        ex.set_price("CAKEUSDT", dec!(3));
        ex.push_history("CAKEUSDT", buy_trade(1, dec!(4), dec!(2)));
        ex
    }

    #[tokio::test]
    async fn discovers_tracked_balance() {
        let ex = venue();
        let found = discover_position(&ex, &balance("CAKE", dec!(5)), "USDT", dec!(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.symbol, "CAKEUSDT");
        // 4 from history, 1 missing added at the average.
        assert_eq!(found.tracker.total_quantity(), dec!(5));
        assert_eq!(found.tracker.average_price(), dec!(2));
        // Follow floor beats the exchange minimum.
        assert_eq!(found.min_notional, dec!(5));
    }

    #[tokio::test]
    async fn skips_quote_unlisted_and_small() {
        let ex = venue();
        assert!(discover_position(&ex, &balance("USDT", dec!(100)), "USDT", dec!(5)).await.unwrap().is_none());
        assert!(discover_position(&ex, &balance("NOPE", dec!(100)), "USDT", dec!(5)).await.unwrap().is_none());
        assert!(discover_position(&ex, &balance("CAKE", dec!(0.005)), "USDT", dec!(5)).await.unwrap().is_none());
        // 1 × 3 = 3 < 5 notional.
        assert!(discover_position(&ex, &balance("CAKE", dec!(1)), "USDT", dec!(5)).await.unwrap().is_none());
    }
}
