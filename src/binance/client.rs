// =============================================================================
// Binance REST API Client — typed endpoints over a pluggable transport
// =============================================================================
//
// Each method describes one endpoint (path, weight, parameters) and decodes
// its JSON.  Signing, timeouts and the rate budget live in the transport
// stack underneath, so every call made here is throttled.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::binance::filters::{json_decimal, SymbolRules};
use crate::binance::transport::{ApiRequest, Transport};
use crate::error::ExchangeError;
use crate::exchange::{AccountTrade, Exchange, MarketFill, TapeTrade};
use crate::market_data::Candle;
use crate::types::BalanceInfo;

/// Request weights charged by Binance spot endpoints.
mod weight {
    pub const ACCOUNT: u32 = 20;
    pub const EXCHANGE_INFO: u32 = 20;
    pub const TICKER_PRICE: u32 = 2;
    pub const KLINES: u32 = 2;
    pub const RECENT_TRADES: u32 = 25;
    pub const MY_TRADES: u32 = 20;
    pub const ORDER: u32 = 1;
    pub const PING: u32 = 1;
    pub const TIME: u32 = 1;
    pub const LISTEN_KEY: u32 = 2;
}

/// Binance error code for an unknown symbol.
const INVALID_SYMBOL_CODE: i64 = -1121;

/// Binance REST API client.
#[derive(Clone)]
pub struct BinanceClient {
    transport: Arc<dyn Transport>,
}

impl BinanceClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn call(&self, request: ApiRequest) -> Result<serde_json::Value, ExchangeError> {
        Ok(self.transport.send(&request).await?.body)
    }

    // -------------------------------------------------------------------------
    // Connectivity
    // -------------------------------------------------------------------------

    /// GET /api/v3/time — exchange clock in epoch milliseconds.
    #[instrument(skip(self), name = "binance::server_time")]
    pub async fn server_time(&self) -> Result<i64, ExchangeError> {
        let body = self
            .call(ApiRequest::get("/api/v3/time", weight::TIME))
            .await?;
        body["serverTime"]
            .as_i64()
            .ok_or_else(|| ExchangeError::decode("time response missing 'serverTime'"))
    }

    // -------------------------------------------------------------------------
    // User data stream
    // -------------------------------------------------------------------------

    /// POST /api/v3/userDataStream — open a listen key for fill pushes.
    #[instrument(skip(self), name = "binance::create_listen_key")]
    pub async fn create_listen_key(&self) -> Result<String, ExchangeError> {
        let body = self
            .call(ApiRequest::post("/api/v3/userDataStream", weight::LISTEN_KEY))
            .await?;
        body["listenKey"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::decode("userDataStream response missing 'listenKey'"))
    }

    /// PUT /api/v3/userDataStream — extend a listen key by 60 minutes.
    #[instrument(skip(self, listen_key), name = "binance::keepalive_listen_key")]
    pub async fn keepalive_listen_key(&self, listen_key: &str) -> Result<(), ExchangeError> {
        self.call(
            ApiRequest::put("/api/v3/userDataStream", weight::LISTEN_KEY)
                .param("listenKey", listen_key),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    /// GET /api/v3/exchangeInfo filtered by symbol.
    #[instrument(skip(self), name = "binance::symbol_rules")]
    async fn symbol_rules(&self, symbol: &str) -> Result<Option<SymbolRules>, ExchangeError> {
        let request =
            ApiRequest::get("/api/v3/exchangeInfo", weight::EXCHANGE_INFO).param("symbol", symbol);
        let body = match self.call(request).await {
            Ok(body) => body,
            Err(ExchangeError::Api { code, .. }) if code == INVALID_SYMBOL_CODE => {
                debug!(symbol, "symbol not listed");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        Ok(body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)))
            .and_then(SymbolRules::from_exchange_info))
    }

    /// GET /api/v3/ticker/price.
    #[instrument(skip(self), name = "binance::ticker_price")]
    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let body = self
            .call(ApiRequest::get("/api/v3/ticker/price", weight::TICKER_PRICE).param("symbol", symbol))
            .await?;
        json_decimal(&body["price"])
            .ok_or_else(|| ExchangeError::decode(format!("ticker for {symbol} missing 'price'")))
    }

    /// GET /api/v3/account (signed), non-zero balances only.
    #[instrument(skip(self), name = "binance::balances")]
    async fn balances(&self) -> Result<Vec<BalanceInfo>, ExchangeError> {
        let body = self
            .call(ApiRequest::get("/api/v3/account", weight::ACCOUNT).signed())
            .await?;
        let raw = body["balances"]
            .as_array()
            .ok_or_else(|| ExchangeError::decode("account response missing 'balances' array"))?;

        let balances: Vec<BalanceInfo> = raw
            .iter()
            .filter_map(|b| {
                Some(BalanceInfo {
                    asset: b["asset"].as_str()?.to_string(),
                    free: json_decimal(&b["free"]).unwrap_or_default(),
                    locked: json_decimal(&b["locked"]).unwrap_or_default(),
                })
            })
            .filter(|b| !b.total().is_zero())
            .collect();

        debug!(count = balances.len(), "balances retrieved");
        Ok(balances)
    }

    async fn asset_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        Ok(self
            .balances()
            .await?
            .iter()
            .find(|b| b.asset == asset)
            .map(BalanceInfo::total)
            .unwrap_or_default())
    }

    /// GET /api/v3/klines (public).
    #[instrument(skip(self), name = "binance::klines")]
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let body = self
            .call(
                ApiRequest::get("/api/v3/klines", weight::KLINES)
                    .param("symbol", symbol)
                    .param("interval", interval)
                    .param("limit", limit),
            )
            .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::decode("klines response is not an array"))?;

        let mut candles = Vec::with_capacity(raw.len());
        for row in raw {
            match Candle::from_kline_row(row) {
                Some(c) => candles.push(c),
                None => warn!(symbol, "skipping malformed kline entry"),
            }
        }
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/trades (public).
    #[instrument(skip(self), name = "binance::recent_trades")]
    async fn recent_trades(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<TapeTrade>, ExchangeError> {
        let body = self
            .call(
                ApiRequest::get("/api/v3/trades", weight::RECENT_TRADES)
                    .param("symbol", symbol)
                    .param("limit", limit),
            )
            .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::decode("trades response is not an array"))?;

        Ok(raw
            .iter()
            .filter_map(|t| {
                Some(TapeTrade {
                    price: json_decimal(&t["price"])?,
                    quantity: json_decimal(&t["qty"])?,
                    is_buyer_maker: t["isBuyerMaker"].as_bool()?,
                })
            })
            .collect())
    }

    /// GET /api/v3/myTrades (signed).
    #[instrument(skip(self), name = "binance::account_trades")]
    async fn account_trades(
        &self,
        symbol: &str,
        from_id: u64,
        limit: u32,
    ) -> Result<Vec<AccountTrade>, ExchangeError> {
        let body = self
            .call(
                ApiRequest::get("/api/v3/myTrades", weight::MY_TRADES)
                    .param("symbol", symbol)
                    .param("fromId", from_id)
                    .param("limit", limit)
                    .signed(),
            )
            .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::decode("myTrades response is not an array"))?;

        let mut trades = Vec::with_capacity(raw.len());
        for t in raw {
            let parsed = (|| {
                Some(AccountTrade {
                    id: t["id"].as_u64()?,
                    time: t["time"].as_i64().unwrap_or_default(),
                    price: json_decimal(&t["price"])?,
                    quantity: json_decimal(&t["qty"])?,
                    commission: json_decimal(&t["commission"]).unwrap_or_default(),
                    commission_asset: t["commissionAsset"].as_str().unwrap_or_default().to_string(),
                    is_buyer: t["isBuyer"].as_bool()?,
                })
            })();
            match parsed {
                Some(trade) => trades.push(trade),
                None => warn!(symbol, "skipping malformed account trade"),
            }
        }
        Ok(trades)
    }

    /// POST /api/v3/order (signed) — MARKET SELL with a full fill report.
    #[instrument(skip(self), name = "binance::market_sell")]
    async fn market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<MarketFill, ExchangeError> {
        let body = self
            .call(
                ApiRequest::post("/api/v3/order", weight::ORDER)
                    .param("symbol", symbol)
                    .param("side", "SELL")
                    .param("type", "MARKET")
                    .param("quantity", quantity.normalize())
                    .param("newClientOrderId", client_order_id)
                    .param("newOrderRespType", "FULL")
                    .signed(),
            )
            .await?;

        let fill = parse_market_fill(&body)?;
        debug!(
            symbol,
            order_id = fill.order_id,
            executed = %fill.executed_quantity,
            avg_price = %fill.average_price,
            "market sell filled"
        );
        Ok(fill)
    }

    async fn ping(&self) -> Result<(), ExchangeError> {
        self.call(ApiRequest::get("/api/v3/ping", weight::PING))
            .await?;
        Ok(())
    }
}

/// Decode an order response into executed quantity and a quantity-weighted
/// average price.
fn parse_market_fill(body: &serde_json::Value) -> Result<MarketFill, ExchangeError> {
    let order_id = body["orderId"]
        .as_u64()
        .ok_or_else(|| ExchangeError::decode("order response missing 'orderId'"))?;
    let executed_quantity = json_decimal(&body["executedQty"]).unwrap_or_default();
    let quote = json_decimal(&body["cummulativeQuoteQty"]).unwrap_or_default();

    let average_price = if !executed_quantity.is_zero() && !quote.is_zero() {
        quote / executed_quantity
    } else {
        weighted_fill_price(body["fills"].as_array().map(Vec::as_slice).unwrap_or_default())
    };

    Ok(MarketFill {
        order_id,
        executed_quantity,
        average_price,
    })
}

fn weighted_fill_price(fills: &[serde_json::Value]) -> Decimal {
    let mut qty = Decimal::ZERO;
    let mut notional = Decimal::ZERO;
    for f in fills {
        if let (Some(p), Some(q)) = (json_decimal(&f["price"]), json_decimal(&f["qty"])) {
            qty += q;
            notional += p * q;
        }
    }
    if qty.is_zero() {
        Decimal::ZERO
    } else {
        notional / qty
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::transport::ApiResponse;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use serde_json::json;

    /// Answers each path with a canned body and remembers what was asked.
    #[derive(Default)]
    struct CannedTransport {
        routes: Vec<(&'static str, Result<serde_json::Value, (u16, i64)>)>,
        seen: Mutex<Vec<ApiRequest>>,
    }

    impl CannedTransport {
        fn with(mut self, path: &'static str, body: serde_json::Value) -> Self {
            self.routes.push((path, Ok(body)));
            self
        }

        fn failing(mut self, path: &'static str, status: u16, code: i64) -> Self {
            self.routes.push((path, Err((status, code))));
            self
        }
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ExchangeError> {
            self.seen.lock().push(request.clone());
            match self.routes.iter().find(|(p, _)| *p == request.path) {
                Some((_, Ok(body))) => Ok(ApiResponse {
                    used_weight: None,
                    body: body.clone(),
                }),
                Some((_, Err((status, code)))) => Err(ExchangeError::Api {
                    status: *status,
                    code: *code,
                    message: "canned failure".into(),
                }),
                None => Err(ExchangeError::decode(format!("no route for {}", request.path))),
            }
        }
    }

    fn client(t: CannedTransport) -> (BinanceClient, Arc<CannedTransport>) {
        let t = Arc::new(t);
        (BinanceClient::new(t.clone()), t)
    }

    #[tokio::test]
    async fn market_sell_uses_weighted_average() {
        let (c, t) = client(CannedTransport::default().with(
            "/api/v3/order",
            json!({
                "orderId": 42,
                "executedQty": "3.00000000",
                "cummulativeQuoteQty": "31.50000000",
                "fills": [
                    { "price": "10.00", "qty": "1.5" },
                    { "price": "11.00", "qty": "1.5" }
                ]
            }),
        ));
        let fill = c.market_sell("CAKEUSDT", dec!(3.00), "xs-1").await.unwrap();
        assert_eq!(fill.order_id, 42);
        assert_eq!(fill.executed_quantity, dec!(3));
        assert_eq!(fill.average_price, dec!(10.5));

        let seen = t.seen.lock();
        let req = &seen[0];
        assert!(req.signed);
        assert_eq!(req.weight, 1);
        assert!(req.query_string().contains("side=SELL&type=MARKET&quantity=3&"));
        assert!(req.query_string().contains("newClientOrderId=xs-1"));
    }

    #[test]
    fn fill_price_falls_back_to_fills() {
        let fill = parse_market_fill(&json!({
            "orderId": 7,
            "executedQty": "2",
            "fills": [
                { "price": "1.0", "qty": "1" },
                { "price": "2.0", "qty": "3" }
            ]
        }))
        .unwrap();
        assert_eq!(fill.average_price, dec!(1.75));
        assert!(parse_market_fill(&json!({})).is_err());
    }

    #[tokio::test]
    async fn balances_skip_empty_assets() {
        let (c, _) = client(CannedTransport::default().with(
            "/api/v3/account",
            json!({ "balances": [
                { "asset": "BTC", "free": "0.5", "locked": "0.1" },
                { "asset": "ETH", "free": "0.0", "locked": "0.0" },
                { "asset": "USDT", "free": "12.0", "locked": "0" }
            ]}),
        ));
        let balances = c.balances().await.unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(c.asset_balance("BTC").await.unwrap(), dec!(0.6));
        assert_eq!(c.asset_balance("ETH").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn unknown_symbol_has_no_rules() {
        let (c, _) = client(CannedTransport::default().failing(
            "/api/v3/exchangeInfo",
            400,
            INVALID_SYMBOL_CODE,
        ));
        assert_eq!(c.symbol_rules("NOPEUSDT").await.unwrap(), None);
    }

    #[tokio::test]
    async fn other_errors_propagate() {
        let (c, _) = client(CannedTransport::default().failing("/api/v3/ticker/price", 503, 0));
        assert!(c.ticker_price("BTCUSDT").await.is_err());
    }

    #[tokio::test]
    async fn parses_tape_and_account_trades() {
        let (c, t) = client(
            CannedTransport::default()
                .with(
                    "/api/v3/trades",
                    json!([
                        { "id": 1, "price": "1.0", "qty": "2.0", "isBuyerMaker": true },
                        { "id": 2, "price": "1.1", "qty": "0.5", "isBuyerMaker": false }
                    ]),
                )
                .with(
                    "/api/v3/myTrades",
                    json!([{
                        "id": 99, "time": 1700000000000_i64, "price": "3.5", "qty": "10",
                        "commission": "0.01", "commissionAsset": "CAKE", "isBuyer": true
                    }]),
                ),
        );
        let tape = c.recent_trades("CAKEUSDT", 60).await.unwrap();
        assert_eq!(tape.len(), 2);
        assert!(tape[0].is_buyer_maker);

        let mine = c.account_trades("CAKEUSDT", 0, 1000).await.unwrap();
        assert_eq!(mine[0].id, 99);
        assert_eq!(mine[0].commission, dec!(0.01));
        assert!(t.seen.lock()[1].signed);
    }

    #[tokio::test]
    async fn listen_key_round_trip() {
        let (c, t) = client(
            CannedTransport::default()
                .with("/api/v3/userDataStream", json!({ "listenKey": "abc123" })),
        );
        let key = c.create_listen_key().await.unwrap();
        assert_eq!(key, "abc123");
        c.keepalive_listen_key(&key).await.unwrap();
        let seen = t.seen.lock();
        assert_eq!(seen[1].method, reqwest::Method::PUT);
        assert_eq!(seen[1].query_string(), "listenKey=abc123");
    }
}
