// =============================================================================
// User Data Stream — fill confirmations pushed by the exchange
// =============================================================================
//
// A listen key opens `wss://.../ws/<listenKey>`; the key must be refreshed
// at least once an hour or the exchange closes the socket.  Only
// `executionReport` events matter here: a FILLED report becomes one
// `FillReport` carrying the order's cumulative quantity, its quantity-weighted
// price and the commission summed over every partial execution.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::binance::client::BinanceClient;
use crate::binance::filters::json_decimal;
use crate::types::{FillReport, Side};

/// Listen keys expire after 60 minutes without a keepalive.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// The fields of an `executionReport` the engine consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUpdate {
    pub symbol: String,
    pub side: Side,
    /// Order status (`NEW`, `PARTIALLY_FILLED`, `FILLED`, ...).
    pub status: String,
    /// Execution type (`TRADE` when this report carries a fill).
    pub execution_type: String,
    pub cumulative_quantity: Decimal,
    pub cumulative_quote: Decimal,
    pub last_price: Decimal,
    pub commission: Decimal,
    pub commission_asset: Option<String>,
    pub client_order_id: String,
}

pub fn parse_execution_report(msg: &serde_json::Value) -> Option<ExecutionUpdate> {
    if msg["e"].as_str() != Some("executionReport") {
        return None;
    }
    let side = match msg["S"].as_str()? {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        _ => return None,
    };
    Some(ExecutionUpdate {
        symbol: msg["s"].as_str()?.to_string(),
        side,
        status: msg["X"].as_str().unwrap_or_default().to_string(),
        execution_type: msg["x"].as_str().unwrap_or_default().to_string(),
        cumulative_quantity: json_decimal(&msg["z"])
            .or_else(|| json_decimal(&msg["l"]))
            .unwrap_or_default(),
        cumulative_quote: json_decimal(&msg["Z"]).unwrap_or_default(),
        last_price: json_decimal(&msg["L"]).unwrap_or_default(),
        commission: json_decimal(&msg["n"]).unwrap_or_default(),
        commission_asset: msg["N"].as_str().map(str::to_string),
        client_order_id: msg["c"].as_str().unwrap_or_default().to_string(),
    })
}

/// Folds partial executions of one order into a single fill report.
#[derive(Debug, Default)]
pub struct FillAssembler {
    /// Commission accumulated per client order id until the order fills.
    pending: HashMap<String, (Decimal, Option<String>)>,
}

impl FillAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, update: ExecutionUpdate) -> Option<FillReport> {
        let is_trade = update.execution_type.is_empty() || update.execution_type == "TRADE";
        if is_trade && !update.commission.is_zero() {
            let entry = self
                .pending
                .entry(update.client_order_id.clone())
                .or_insert((Decimal::ZERO, None));
            entry.0 += update.commission;
            if entry.1.is_none() {
                entry.1 = update.commission_asset.clone();
            }
        }

        match update.status.as_str() {
            "FILLED" => {}
            "CANCELED" | "REJECTED" | "EXPIRED" | "EXPIRED_IN_MATCH" => {
                self.pending.remove(&update.client_order_id);
                return None;
            }
            _ => return None,
        }

        let (commission, commission_asset) = self
            .pending
            .remove(&update.client_order_id)
            .unwrap_or((Decimal::ZERO, update.commission_asset.clone()));

        let price = if !update.cumulative_quantity.is_zero() && !update.cumulative_quote.is_zero() {
            update.cumulative_quote / update.cumulative_quantity
        } else {
            update.last_price
        };

        Some(FillReport {
            symbol: update.symbol,
            side: update.side,
            quantity: update.cumulative_quantity,
            price,
            commission,
            commission_asset,
            client_order_id: Some(update.client_order_id).filter(|id| !id.is_empty()),
        })
    }
}

/// Keep a user data stream open forever, forwarding completed fills.
///
/// Returns only when the receiving side of `fills` is gone.
pub async fn run_user_stream(client: BinanceClient, ws_base: String, fills: mpsc::Sender<FillReport>) {
    loop {
        match stream_once(&client, &ws_base, &fills).await {
            Ok(()) => warn!("user data stream ended — reconnecting"),
            Err(e) => error!(error = %e, "user data stream failed — reconnecting"),
        }
        if fills.is_closed() {
            info!("fill consumer gone — stopping user data stream");
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn stream_once(
    client: &BinanceClient,
    ws_base: &str,
    fills: &mpsc::Sender<FillReport>,
) -> Result<()> {
    let listen_key = client
        .create_listen_key()
        .await
        .context("failed to open listen key")?;
    let url = format!("{ws_base}/ws/{listen_key}");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to user data WebSocket")?;
    info!("user data WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;
    let mut assembler = FillAssembler::new();

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if let Err(e) = client.keepalive_listen_key(&listen_key).await {
                    warn!(error = %e, "listen key keepalive failed");
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let value: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "failed to parse user data message");
                            continue;
                        }
                    };
                    if value["e"].as_str() == Some("listenKeyExpired") {
                        warn!("listen key expired");
                        return Ok(());
                    }
                    let Some(update) = parse_execution_report(&value) else { continue };
                    debug!(
                        symbol = %update.symbol,
                        side = %update.side,
                        status = %update.status,
                        qty = %update.cumulative_quantity,
                        "execution report"
                    );
                    if let Some(fill) = assembler.ingest(update) {
                        if fills.send(fill).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!(?frame, "user data WebSocket closed by server");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }
}
