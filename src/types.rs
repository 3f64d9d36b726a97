// =============================================================================
// Shared types used across the exit engine
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: Decimal,
    #[serde(default)]
    pub locked: Decimal,
}

impl BalanceInfo {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Which Binance deployment the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Live,
    Testnet,
}

impl Default for Network {
    fn default() -> Self {
        Self::Live
    }
}

impl Network {
    pub fn rest_base(&self) -> &'static str {
        match self {
            Self::Live => "https://api.binance.com",
            Self::Testnet => "https://testnet.binance.vision",
        }
    }

    pub fn ws_base(&self) -> &'static str {
        match self {
            Self::Live => "wss://stream.binance.com:9443",
            Self::Testnet => "wss://testnet.binance.vision",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Testnet => write!(f, "TESTNET"),
        }
    }
}

/// Order side as reported by the user data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// A confirmed fill delivered by the user data stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillReport {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub commission_asset: Option<String>,
    pub client_order_id: Option<String>,
}
