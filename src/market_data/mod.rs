pub mod candle;
pub mod ticker_stream;
pub mod trade_tape;

pub use candle::Candle;
pub use trade_tape::TapeSample;
