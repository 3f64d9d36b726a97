// =============================================================================
// Notifier — engine events to the log and, when configured, to Telegram
// =============================================================================
//
// Every event is logged.  With TELEGRAM_TOKEN and TELEGRAM_CHAT_ID set, a
// Markdown summary is also posted via the Bot API.  On testnet messages get a
// "TESTNET " prefix and are only logged, except completed sells of positions
// with a real cost basis.
// =============================================================================

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::cost_basis::ZERO_PRICE_FLOOR;
use crate::events::{EngineEvent, OpenSource};
use crate::types::Network;

const TELEGRAM_API: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct TelegramTarget {
    token: String,
    chat_id: String,
}

pub struct Notifier {
    network: Network,
    telegram: Option<TelegramTarget>,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(network: Network, token: Option<String>, chat_id: Option<String>) -> Self {
        let telegram = match (token, chat_id) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                Some(TelegramTarget { token, chat_id })
            }
            _ => None,
        };
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            network,
            telegram,
            http,
        }
    }

    /// Read `TELEGRAM_TOKEN` / `TELEGRAM_CHAT_ID` from the environment.
    pub fn from_env(network: Network) -> Self {
        Self::new(
            network,
            std::env::var("TELEGRAM_TOKEN").ok(),
            std::env::var("TELEGRAM_CHAT_ID").ok(),
        )
    }

    pub fn telegram_enabled(&self) -> bool {
        self.telegram.is_some()
    }

    /// Final message text and whether it should go out over Telegram.
    pub fn prepare(&self, event: &EngineEvent) -> (String, bool) {
        let text = format_event(event);
        match self.network {
            Network::Testnet => (format!("TESTNET {text}"), is_forced(event)),
            Network::Live => (text, true),
        }
    }

    pub async fn notify(&self, event: &EngineEvent) {
        let (text, deliver) = self.prepare(event);
        info!(event = %text, "notification");
        if !deliver {
            return;
        }
        if let Some(target) = &self.telegram {
            if let Err(e) = self.send_telegram(target, &text).await {
                warn!(error = %e, "Telegram delivery failed");
            }
        }
    }

    async fn send_telegram(&self, target: &TelegramTarget, text: &str) -> Result<()> {
        let url = format!("{TELEGRAM_API}/bot{}/sendMessage", target.token);
        let payload = serde_json::json!({
            "chat_id": target.chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Telegram request failed")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("Telegram responded with HTTP {status}");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("network", &self.network)
            .field("telegram", &self.telegram.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Testnet exceptions that are still delivered.
fn is_forced(event: &EngineEvent) -> bool {
    matches!(event, EngineEvent::SellCompleted(report) if report.entry_price > ZERO_PRICE_FLOOR)
}

fn fmt_price(v: Decimal) -> String {
    v.round_dp(8).normalize().to_string()
}

pub fn format_event(event: &EngineEvent) -> String {
    match event {
        EngineEvent::Started { network, tracked } => format!(
            "🟢 *Exit engine started* (MODE: `{network}`)\n*Tracked symbols:* `{}`",
            tracked.len()
        ),
        EngineEvent::BuyRecorded {
            symbol,
            quantity,
            price,
            average_price,
        } => format!(
            "🛒 *{symbol}* buy recorded\nQty: `{}` @ `{}`\nAvg: `{}`",
            fmt_price(*quantity),
            fmt_price(*price),
            fmt_price(*average_price)
        ),
        EngineEvent::PositionOpened {
            symbol,
            quantity,
            average_price,
            last_price,
            source,
        } => {
            let origin = match source {
                OpenSource::Fill => "fill",
                OpenSource::BalanceScan => "balance scan",
            };
            format!(
                "📌 *{symbol}* now tracked ({origin})\nQty: `{}`\nAvg: `{}`\nLast: `{}`",
                fmt_price(*quantity),
                fmt_price(*average_price),
                fmt_price(*last_price)
            )
        }
        EngineEvent::PositionClosed { symbol, reason } => {
            format!("📕 *{symbol}* no longer tracked: {reason}")
        }
        EngineEvent::SellCompleted(report) => format!(
            "✅ *{}* sold\nQty: `{}`\nEntry: `{}`\nExit: `{}`\nProfit: `{}` ({}%)\nReason: {}",
            report.symbol,
            fmt_price(report.quantity),
            fmt_price(report.entry_price),
            fmt_price(report.exit_price),
            report.profit.round_dp(4),
            report.profit_pct.round_dp(2),
            report.reason
        ),
        EngineEvent::SellFailed { symbol, error } => {
            format!("⚠️ *{symbol}* sell failed: `{error}`")
        }
        EngineEvent::ApiStatus { up: true, .. } => "✅ Exchange API reachable again".to_string(),
        EngineEvent::ApiStatus { up: false, detail } => format!(
            "🚨 Exchange API unreachable: `{}`",
            detail.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Deliver every event published on `rx` until the bus closes.
pub async fn run_notifier(notifier: Notifier, mut rx: broadcast::Receiver<EngineEvent>) {
    info!(telegram = notifier.telegram_enabled(), "notifier started");
    loop {
        match rx.recv().await {
            Ok(event) => notifier.notify(&event).await,
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "notifier lagged — events dropped"),
            Err(RecvError::Closed) => return,
        }
    }
}
