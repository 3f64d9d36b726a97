// =============================================================================
// Binance Access Layer
// =============================================================================
//
// HttpTransport (signing) → ThrottledTransport (weight budget, bans) →
// BinanceClient (typed endpoints).  The user data stream reuses the client
// for its listen key.

pub mod client;
pub mod filters;
pub mod rate_limit;
pub mod transport;
pub mod user_stream;

pub use client::BinanceClient;
pub use rate_limit::{RateLimiter, ThrottledTransport};
pub use transport::HttpTransport;
