// =============================================================================
// In-memory venue for unit tests
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::binance::filters::SymbolRules;
use crate::error::ExchangeError;
use crate::exchange::{AccountTrade, Exchange, MarketFill, TapeTrade};
use crate::market_data::Candle;
use crate::types::BalanceInfo;

#[derive(Default)]
pub struct FakeExchange {
    pub rules: Mutex<HashMap<String, SymbolRules>>,
    pub prices: Mutex<HashMap<String, Decimal>>,
    pub wallet: Mutex<HashMap<String, Decimal>>,
    pub candles: Mutex<HashMap<String, Vec<Candle>>>,
    pub tape: Mutex<HashMap<String, Vec<TapeTrade>>>,
    pub history: Mutex<HashMap<String, Vec<AccountTrade>>>,
    /// `(symbol, quantity, client order id)` of every market sell placed.
    pub sells: Mutex<Vec<(String, Decimal, String)>>,
    pub fail_sells: AtomicBool,
    pub fail_prices: AtomicBool,
    pub fail_ping: AtomicBool,
    pub tape_requests: AtomicUsize,
    /// Account reads (`balances` and `asset_balance`).
    pub account_requests: AtomicUsize,
    next_order_id: AtomicU64,
}

impl FakeExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self, symbol: &str, base: &str, min_qty: Decimal, step: Decimal, min_notional: Decimal) {
        self.rules.lock().insert(
            symbol.to_string(),
            SymbolRules {
                symbol: symbol.to_string(),
                base_asset: base.to_string(),
                quote_asset: "USDT".to_string(),
                min_qty,
                step_size: step,
                max_qty: Decimal::ZERO,
                min_notional,
            },
        );
    }

    pub fn set_max_qty(&self, symbol: &str, max_qty: Decimal) {
        if let Some(r) = self.rules.lock().get_mut(symbol) {
            r.max_qty = max_qty;
        }
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.lock().insert(symbol.to_string(), price);
    }

    pub fn set_wallet(&self, asset: &str, qty: Decimal) {
        self.wallet.lock().insert(asset.to_string(), qty);
    }

    pub fn wallet_of(&self, asset: &str) -> Decimal {
        self.wallet.lock().get(asset).copied().unwrap_or_default()
    }

    pub fn set_tape(&self, symbol: &str, buy: Decimal, sell: Decimal) {
        self.tape.lock().insert(
            symbol.to_string(),
            vec![
                TapeTrade {
                    price: Decimal::ONE,
                    quantity: buy,
                    is_buyer_maker: false,
                },
                TapeTrade {
                    price: Decimal::ONE,
                    quantity: sell,
                    is_buyer_maker: true,
                },
            ],
        );
    }

    pub fn push_history(&self, symbol: &str, trade: AccountTrade) {
        self.history
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .push(trade);
    }

    pub fn sell_count(&self) -> usize {
        self.sells.lock().len()
    }

    fn api_error(code: i64, message: &str) -> ExchangeError {
        ExchangeError::Api {
            status: 400,
            code,
            message: message.to_string(),
        }
    }
}

pub fn buy_trade(id: u64, qty: Decimal, price: Decimal) -> AccountTrade {
    AccountTrade {
        id,
        time: id as i64,
        price,
        quantity: qty,
        commission: Decimal::ZERO,
        commission_asset: "BNB".to_string(),
        is_buyer: true,
    }
}

pub fn sell_trade(id: u64, qty: Decimal, price: Decimal) -> AccountTrade {
    AccountTrade {
        is_buyer: false,
        ..buy_trade(id, qty, price)
    }
}

/// Candle with the given open and close; high/low span both.
pub fn candle(open: Decimal, close: Decimal) -> Candle {
    Candle {
        open_time: 0,
        close_time: 0,
        open,
        high: open.max(close),
        low: open.min(close),
        close,
        volume: Decimal::ONE,
    }
}

#[async_trait]
impl Exchange for FakeExchange {
    async fn symbol_rules(&self, symbol: &str) -> Result<Option<SymbolRules>, ExchangeError> {
        Ok(self.rules.lock().get(symbol).cloned())
    }

    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        if self.fail_prices.load(Ordering::SeqCst) {
            return Err(Self::api_error(-1001, "internal error"));
        }
        self.prices
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(|| Self::api_error(-1121, "Invalid symbol."))
    }

    async fn balances(&self) -> Result<Vec<BalanceInfo>, ExchangeError> {
        self.account_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .wallet
            .lock()
            .iter()
            .filter(|(_, q)| !q.is_zero())
            .map(|(asset, qty)| BalanceInfo {
                asset: asset.clone(),
                free: *qty,
                locked: Decimal::ZERO,
            })
            .collect())
    }

    async fn asset_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        self.account_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.wallet_of(asset))
    }

    async fn klines(&self, symbol: &str, _interval: &str, limit: u32) -> Result<Vec<Candle>, ExchangeError> {
        let all = self.candles.lock().get(symbol).cloned().unwrap_or_default();
        let skip = all.len().saturating_sub(limit as usize);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn recent_trades(&self, symbol: &str, _limit: u32) -> Result<Vec<TapeTrade>, ExchangeError> {
        self.tape_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.tape.lock().get(symbol).cloned().unwrap_or_default())
    }

    async fn account_trades(&self, symbol: &str, from_id: u64, limit: u32) -> Result<Vec<AccountTrade>, ExchangeError> {
        Ok(self
            .history
            .lock()
            .get(symbol)
            .map(|trades| {
                trades
                    .iter()
                    .filter(|t| t.id >= from_id)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn market_sell(&self, symbol: &str, quantity: Decimal, client_order_id: &str) -> Result<MarketFill, ExchangeError> {
        if self.fail_sells.load(Ordering::SeqCst) {
            return Err(Self::api_error(-2010, "Account has insufficient balance for requested action."));
        }
        let price = self.prices.lock().get(symbol).copied().unwrap_or_default();
        let base = self
            .rules
            .lock()
            .get(symbol)
            .map(|r| r.base_asset.clone())
            .unwrap_or_default();
        {
            let mut wallet = self.wallet.lock();
            let held = wallet.entry(base).or_default();
            *held = (*held - quantity).max(Decimal::ZERO);
        }
        self.sells
            .lock()
            .push((symbol.to_string(), quantity, client_order_id.to_string()));
        Ok(MarketFill {
            order_id: self.next_order_id.fetch_add(1, Ordering::SeqCst) + 1,
            executed_quantity: quantity,
            average_price: price,
        })
    }

    async fn ping(&self) -> Result<(), ExchangeError> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(Self::api_error(-1001, "Internal error; unable to process your request."));
        }
        Ok(())
    }
}
