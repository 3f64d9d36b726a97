// =============================================================================
// Symbol filters — LOT_SIZE / MIN_NOTIONAL extraction and step flooring
// =============================================================================

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;

/// Trading rules the exit engine cares about for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolRules {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub min_qty: Decimal,
    pub step_size: Decimal,
    /// Largest quantity a single market order may carry (`0` = unlimited).
    pub max_qty: Decimal,
    pub min_notional: Decimal,
}

impl SymbolRules {
    /// Build rules from one `exchangeInfo.symbols[]` entry.
    pub fn from_exchange_info(info: &serde_json::Value) -> Option<Self> {
        let symbol = info["symbol"].as_str()?.to_string();
        let filters = info["filters"].as_array().cloned().unwrap_or_default();

        let step_size = filter_value(&filters, "LOT_SIZE", "stepSize").unwrap_or(Decimal::ONE);
        let min_qty = filter_value(&filters, "LOT_SIZE", "minQty").unwrap_or(Decimal::ZERO);
        // Market orders obey MARKET_LOT_SIZE when present, which is usually
        // tighter than LOT_SIZE.maxQty.
        let max_qty = filter_value_strict(&filters, "MARKET_LOT_SIZE", "maxQty")
            .filter(|q| !q.is_zero())
            .or_else(|| filter_value_strict(&filters, "LOT_SIZE", "maxQty"))
            .unwrap_or(Decimal::ZERO);
        let min_notional = filter_value_strict(&filters, "MIN_NOTIONAL", "minNotional")
            .or_else(|| filter_value_strict(&filters, "NOTIONAL", "minNotional"))
            .or_else(|| any_filter_value(&filters, "minNotional"))
            .unwrap_or(Decimal::ZERO);

        Some(Self {
            symbol,
            base_asset: info["baseAsset"].as_str().unwrap_or_default().to_string(),
            quote_asset: info["quoteAsset"].as_str().unwrap_or_default().to_string(),
            min_qty,
            step_size,
            max_qty,
            min_notional,
        })
    }
}

/// Look up `key` in the filter of type `filter_type`, falling back to the
/// first filter of any type that carries `key`.
fn filter_value(filters: &[serde_json::Value], filter_type: &str, key: &str) -> Option<Decimal> {
    filter_value_strict(filters, filter_type, key).or_else(|| any_filter_value(filters, key))
}

fn filter_value_strict(
    filters: &[serde_json::Value],
    filter_type: &str,
    key: &str,
) -> Option<Decimal> {
    filters
        .iter()
        .find(|f| f["filterType"].as_str() == Some(filter_type) && !f[key].is_null())
        .and_then(|f| json_decimal(&f[key]))
}

fn any_filter_value(filters: &[serde_json::Value], key: &str) -> Option<Decimal> {
    filters
        .iter()
        .find(|f| !f[key].is_null())
        .and_then(|f| json_decimal(&f[key]))
}

/// Parse a JSON string or number into a `Decimal`.
pub fn json_decimal(val: &serde_json::Value) -> Option<Decimal> {
    if let Some(s) = val.as_str() {
        Decimal::from_str(s).ok()
    } else if let Some(i) = val.as_i64() {
        Some(Decimal::from(i))
    } else {
        val.as_f64().and_then(|f| Decimal::try_from(f).ok())
    }
}

/// Round `value` down to a whole multiple of `step` (`step == 0` leaves it
/// untouched).
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    ((value / step).floor() * step).normalize()
}
