// =============================================================================
// Exchange seam — everything the lifecycle manager needs from the venue
// =============================================================================
//
// `BinanceClient` is the production implementation; tests substitute an
// in-memory venue.  Every call made through the production client passes the
// throttling transport, so callers never touch the rate budget directly.
// =============================================================================

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::binance::filters::SymbolRules;
use crate::error::ExchangeError;
use crate::market_data::Candle;
use crate::types::BalanceInfo;

/// One print from the public trade tape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeTrade {
    pub price: Decimal,
    pub quantity: Decimal,
    /// Buyer was the resting order, so the aggressor sold.
    pub is_buyer_maker: bool,
}

/// One of our own historical fills (`/api/v3/myTrades`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountTrade {
    pub id: u64,
    pub time: i64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
    pub is_buyer: bool,
}

/// Result of a filled market order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketFill {
    pub order_id: u64,
    pub executed_quantity: Decimal,
    /// Quantity-weighted fill price.
    pub average_price: Decimal,
}

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Trading rules for `symbol`, `None` when the venue does not list it.
    async fn symbol_rules(&self, symbol: &str) -> Result<Option<SymbolRules>, ExchangeError>;

    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Every asset with a non-zero free or locked balance.
    async fn balances(&self) -> Result<Vec<BalanceInfo>, ExchangeError>;

    /// Free + locked balance of one asset (zero when absent).
    async fn asset_balance(&self, asset: &str) -> Result<Decimal, ExchangeError>;

    /// Candles oldest-first; the last entry is the still-open candle.
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Most recent `limit` public trades.
    async fn recent_trades(&self, symbol: &str, limit: u32)
        -> Result<Vec<TapeTrade>, ExchangeError>;

    /// One page of account trades starting at trade id `from_id`.
    async fn account_trades(
        &self,
        symbol: &str,
        from_id: u64,
        limit: u32,
    ) -> Result<Vec<AccountTrade>, ExchangeError>;

    async fn market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<MarketFill, ExchangeError>;

    async fn ping(&self) -> Result<(), ExchangeError>;
}
