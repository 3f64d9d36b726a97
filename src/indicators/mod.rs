// =============================================================================
// Indicators Module
// =============================================================================
//
// Pure Decimal computations over candles, plus the shared benchmark trend
// flag that gates the adaptive ladder.

pub mod atr;
pub mod trend;

pub use trend::TrendFilter;
