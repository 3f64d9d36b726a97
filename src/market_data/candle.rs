use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::binance::filters::json_decimal;

/// A single OHLCV candle from the Binance klines endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Parse one row of Binance's array-of-arrays kline response.
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    pub fn from_kline_row(row: &serde_json::Value) -> Option<Self> {
        let arr = row.as_array()?;
        if arr.len() < 7 {
            return None;
        }
        Some(Self {
            open_time: arr[0].as_i64()?,
            open: json_decimal(&arr[1])?,
            high: json_decimal(&arr[2])?,
            low: json_decimal(&arr[3])?,
            close: json_decimal(&arr[4])?,
            volume: json_decimal(&arr[5])?,
            close_time: arr[6].as_i64()?,
        })
    }

    /// Absolute body size relative to the open (`|close - open| / open`).
    pub fn body_ratio(&self) -> Decimal {
        if self.open.is_zero() {
            return Decimal::ZERO;
        }
        (self.close - self.open).abs() / self.open
    }
}

/// The most recent fully closed candle of a klines response.
///
/// Binance always returns the in-progress candle last, so the closed one is
/// second from the end.
pub fn last_closed(candles: &[Candle]) -> Option<&Candle> {
    if candles.len() < 2 {
        return None;
    }
    candles.get(candles.len() - 2)
}
