// =============================================================================
// Ticker Stream — one multiplexed socket for every tracked symbol
// =============================================================================
//
// Subscribes to `<symbol>@miniTicker` for the whole tracked set on a single
// combined-stream connection and hands each `(symbol, last price)` pair to
// the caller, which demultiplexes onto per-position evaluation.
//
// The function returns when the socket closes or errors; the supervisor in
// `exit::monitor` decides when to reconnect and with which symbol set.
// =============================================================================

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Build the combined-stream URL for all tracked symbols.
pub fn build_ticker_url(ws_base: &str, symbols: &BTreeSet<String>) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@miniTicker", s.to_lowercase()))
        .collect();
    format!("{ws_base}/stream?streams={}", streams.join("/"))
}

/// Connect and forward every ticker update to `on_tick` until the stream
/// ends.
pub async fn run_ticker_stream<F>(ws_base: &str, symbols: &BTreeSet<String>, on_tick: F) -> Result<()>
where
    F: Fn(&str, Decimal),
{
    let url = build_ticker_url(ws_base, symbols);
    info!(count = symbols.len(), "connecting to ticker WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to ticker WebSocket")?;

    info!(count = symbols.len(), "ticker WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_ticker_message(&text) {
                Ok(ticks) => {
                    for (symbol, price) in ticks {
                        on_tick(&symbol, price);
                    }
                }
                Err(e) => warn!(error = %e, "failed to parse ticker message"),
            },
            Some(Ok(Message::Close(frame))) => {
                warn!(?frame, "ticker WebSocket closed by server");
                return Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "ticker WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("ticker WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a ticker payload into `(symbol, last price)` pairs.
///
/// Accepts the combined-stream envelope `{ "stream": ..., "data": {...} }`,
/// a bare ticker object, or an array of ticker objects.
pub fn parse_ticker_message(text: &str) -> Result<Vec<(String, Decimal)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse ticker JSON")?;

    let payload = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let items: Vec<&serde_json::Value> = match payload.as_array() {
        Some(arr) => arr.iter().collect(),
        None => vec![payload],
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(symbol) = item["s"].as_str() else {
            debug!("ticker item without symbol — skipped");
            continue;
        };
        let price = item["c"]
            .as_str()
            .context("missing field c")
            .and_then(|s| Decimal::from_str(s).context("failed to parse last price"))?;
        out.push((symbol.to_uppercase(), price));
    }
    Ok(out)
}
