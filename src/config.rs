// =============================================================================
// Engine Configuration — JSON file with environment overlay and atomic save
// =============================================================================
//
// Resolution order: built-in defaults, then the JSON file (every field is
// optional so older files keep loading), then environment variables (loaded
// from `.env` by `dotenv` at startup).
//
// Percentages are stored the way operators write them (0.1 = 0.1 %) and
// converted to fractions in `exit_params()`.
// =============================================================================

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::exit::ladder::{ExitParams, StopLossParams, EXTREME_PROFIT_MULTIPLE};
use crate::types::Network;

/// Polling interval forced on testnet, where the REST budget is far smaller.
const TESTNET_CHECK_INTERVAL_SECS: u64 = 60;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_fee_pct() -> Decimal {
    Decimal::new(1, 1)
}

fn default_min_profit_pct() -> Decimal {
    Decimal::new(5, 1)
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_rate_limit_per_minute() -> u32 {
    6000
}

fn default_min_follow_notional() -> Decimal {
    Decimal::from(5)
}

fn default_candle_interval() -> String {
    "1m".to_string()
}

fn default_target_steps() -> u32 {
    3
}

fn default_group_size() -> i64 {
    10
}

fn default_concurrency_limit() -> usize {
    5
}

fn default_atr_period() -> usize {
    14
}

fn default_stop_loss_multiplier() -> Decimal {
    Decimal::ONE
}

fn default_recent_sells_path() -> String {
    "recent_sells.json".to_string()
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_api_bind_addr() -> String {
    "127.0.0.1:3002".to_string()
}

fn default_balance_scan_interval_secs() -> u64 {
    300
}

// =============================================================================
// EngineConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub testnet: bool,

    #[serde(default = "default_fee_pct")]
    pub fee_buy_pct: Decimal,

    #[serde(default = "default_fee_pct")]
    pub fee_sell_pct: Decimal,

    #[serde(default = "default_min_profit_pct")]
    pub min_profit_pct: Decimal,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Request weight per minute the access layer allows.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// Positions worth less than this (quote asset) are not followed.
    #[serde(default = "default_min_follow_notional")]
    pub min_follow_notional: Decimal,

    #[serde(default = "default_candle_interval")]
    pub candle_interval: String,

    #[serde(default = "default_target_steps")]
    pub target_steps: u32,

    /// Positions re-checked per polling cycle; `<= 0` derives it from the
    /// rate budget.
    #[serde(default = "default_group_size")]
    pub group_size: i64,

    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    #[serde(default)]
    pub stop_loss_enabled: bool,

    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    #[serde(default = "default_stop_loss_multiplier")]
    pub stop_loss_multiplier: Decimal,

    #[serde(default = "default_recent_sells_path")]
    pub recent_sells_path: String,

    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,

    #[serde(default = "default_balance_scan_interval_secs")]
    pub balance_scan_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            testnet: false,
            fee_buy_pct: default_fee_pct(),
            fee_sell_pct: default_fee_pct(),
            min_profit_pct: default_min_profit_pct(),
            check_interval_secs: default_check_interval_secs(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            min_follow_notional: default_min_follow_notional(),
            candle_interval: default_candle_interval(),
            target_steps: default_target_steps(),
            group_size: default_group_size(),
            concurrency_limit: default_concurrency_limit(),
            stop_loss_enabled: false,
            atr_period: default_atr_period(),
            stop_loss_multiplier: default_stop_loss_multiplier(),
            recent_sells_path: default_recent_sells_path(),
            quote_asset: default_quote_asset(),
            api_bind_addr: default_api_bind_addr(),
            balance_scan_interval_secs: default_balance_scan_interval_secs(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Persist the configuration atomically (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) {
        let parsed = |name: &str| get(name).map(|raw| (name.to_string(), raw));

        overlay(&mut self.testnet, parsed("BINANCE_TESTNET"));
        overlay(&mut self.fee_buy_pct, parsed("FEE_BUY_PERCENT"));
        overlay(&mut self.fee_sell_pct, parsed("FEE_SELL_PERCENT"));
        overlay(&mut self.min_profit_pct, parsed("MIN_PROFIT_PERCENT"));
        overlay(&mut self.check_interval_secs, parsed("CHECK_INTERVAL"));
        overlay(&mut self.rate_limit_per_minute, parsed("RATE_LIMIT_PER_MINUTE"));
        overlay(&mut self.min_follow_notional, parsed("MIN_FOLLOW_NOTIONAL"));
        overlay(&mut self.candle_interval, parsed("CANDLE_INTERVAL"));
        overlay(&mut self.target_steps, parsed("TARGET_STEPS"));
        overlay(&mut self.group_size, parsed("GROUP_SIZE"));
        overlay(&mut self.concurrency_limit, parsed("CONCURRENCY_LIMIT"));
        overlay(&mut self.stop_loss_enabled, parsed("STOP_LOSS_ENABLED"));
        overlay(&mut self.atr_period, parsed("ATR_PERIOD"));
        overlay(&mut self.stop_loss_multiplier, parsed("STOP_LOSS_MULTIPLIER"));
        overlay(&mut self.recent_sells_path, parsed("RECENT_SELLS_PATH"));
        overlay(&mut self.quote_asset, parsed("QUOTE_ASSET"));
        overlay(&mut self.api_bind_addr, parsed("EXIT_ENGINE_BIND_ADDR"));
        overlay(&mut self.balance_scan_interval_secs, parsed("BALANCE_SCAN_INTERVAL"));

        if self.testnet {
            self.check_interval_secs = TESTNET_CHECK_INTERVAL_SECS;
        }
        self.quote_asset = self.quote_asset.to_uppercase();
    }

    pub fn network(&self) -> Network {
        if self.testnet {
            Network::Testnet
        } else {
            Network::Live
        }
    }

    /// Exit-ladder parameters with percentages converted to fractions.
    pub fn exit_params(&self) -> ExitParams {
        let pct = |v: Decimal| v / Decimal::ONE_HUNDRED;
        ExitParams {
            buy_fee: pct(self.fee_buy_pct),
            sell_fee: pct(self.fee_sell_pct),
            min_profit: pct(self.min_profit_pct),
            target_steps: self.target_steps,
            stop_loss: self.stop_loss_enabled.then_some(StopLossParams {
                atr_period: self.atr_period,
                multiplier: self.stop_loss_multiplier,
            }),
            extreme_multiple: Decimal::from(EXTREME_PROFIT_MULTIPLE),
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 {
            bail!("check_interval_secs must be positive");
        }
        if self.concurrency_limit == 0 {
            bail!("concurrency_limit must be positive");
        }
        if self.rate_limit_per_minute == 0 {
            bail!("rate_limit_per_minute must be positive");
        }
        if self.stop_loss_enabled && self.atr_period == 0 {
            bail!("atr_period must be positive when the stop-loss is enabled");
        }
        if self.quote_asset.is_empty() {
            bail!("quote_asset must not be empty");
        }
        Ok(())
    }
}

/// Replace `slot` with the parsed value; unparseable values are logged and
/// ignored.
fn overlay<T>(slot: &mut T, raw: Option<(String, String)>)
where
    T: FromEnv,
{
    let Some((name, raw)) = raw else { return };
    match T::from_env(raw.trim()) {
        Some(v) => *slot = v,
        None => warn!(var = %name, value = %raw, "ignoring unparseable environment value"),
    }
}

trait FromEnv: Sized {
    fn from_env(raw: &str) -> Option<Self>;
}

impl FromEnv for bool {
    fn from_env(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

impl FromEnv for String {
    fn from_env(raw: &str) -> Option<Self> {
        (!raw.is_empty()).then(|| raw.to_string())
    }
}

macro_rules! from_env_via_from_str {
    ($($t:ty),*) => {
        $(impl FromEnv for $t {
            fn from_env(raw: &str) -> Option<Self> {
                <$t>::from_str(raw).ok()
            }
        })*
    };
}

from_env_via_from_str!(u32, u64, i64, usize, Decimal);

// =============================================================================
// Credentials
// =============================================================================

/// API key pair for the selected network.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    /// Read `BINANCE_API_KEY`/`BINANCE_API_SECRET`, or the `BINANCE_TESTNET_*`
    /// pair on testnet.
    pub fn from_env(network: Network) -> Result<Self> {
        let (key_var, secret_var) = match network {
            Network::Live => ("BINANCE_API_KEY", "BINANCE_API_SECRET"),
            Network::Testnet => ("BINANCE_TESTNET_API_KEY", "BINANCE_TESTNET_API_SECRET"),
        };
        let api_key = std::env::var(key_var).with_context(|| format!("{key_var} not set"))?;
        let api_secret =
            std::env::var(secret_var).with_context(|| format!("{secret_var} not set"))?;
        Ok(Self {
            api_key,
            api_secret,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let c = EngineConfig::default();
        assert!(!c.testnet);
        assert_eq!(c.fee_buy_pct, dec!(0.1));
        assert_eq!(c.min_profit_pct, dec!(0.5));
        assert_eq!(c.check_interval_secs, 30);
        assert_eq!(c.rate_limit_per_minute, 6000);
        assert_eq!(c.group_size, 10);
        assert_eq!(c.concurrency_limit, 5);
        assert_eq!(c.api_bind_addr, "127.0.0.1:3002");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let c: EngineConfig = serde_json::from_str(r#"{"target_steps": 5, "min_profit_pct": 1.5}"#).unwrap();
        assert_eq!(c.target_steps, 5);
        assert_eq!(c.min_profit_pct, dec!(1.5));
        assert_eq!(c.quote_asset, "USDT");
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = std::env::temp_dir().join(format!("engine_config_{}.json", uuid::Uuid::new_v4()));
        let mut c = EngineConfig::default();
        c.group_size = -1;
        c.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), c);
        let _ = std::fs::remove_file(path);
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut c = EngineConfig::default();
        c.apply_vars(env(&[
            ("MIN_PROFIT_PERCENT", "0.8"),
            ("GROUP_SIZE", "0"),
            ("STOP_LOSS_ENABLED", "true"),
            ("QUOTE_ASSET", "fdusd"),
            ("TARGET_STEPS", "not-a-number"),
        ]));
        assert_eq!(c.min_profit_pct, dec!(0.8));
        assert_eq!(c.group_size, 0);
        assert!(c.stop_loss_enabled);
        assert_eq!(c.quote_asset, "FDUSD");
        assert_eq!(c.target_steps, 3);
    }

    #[test]
    fn testnet_forces_slow_polling() {
        let mut c = EngineConfig::default();
        c.apply_vars(env(&[("BINANCE_TESTNET", "1"), ("CHECK_INTERVAL", "5")]));
        assert_eq!(c.network(), Network::Testnet);
        assert_eq!(c.check_interval_secs, 60);
    }

    #[test]
    fn exit_params_are_fractions() {
        let mut c = EngineConfig::default();
        let p = c.exit_params();
        assert_eq!(p.base_margin(), dec!(0.007));
        assert!(p.stop_loss.is_none());

        c.stop_loss_enabled = true;
        c.stop_loss_multiplier = dec!(2);
        let stop = c.exit_params().stop_loss.unwrap();
        assert_eq!(stop.atr_period, 14);
        assert_eq!(stop.multiplier, dec!(2));
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let c = EngineConfig {
            check_interval_secs: 0,
            ..EngineConfig::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
        };
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("secret\""));
        assert!(dbg.contains("REDACTED"));
    }
}
