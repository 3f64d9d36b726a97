// =============================================================================
// Exchange Errors — typed failures at the Binance boundary
// =============================================================================
//
// Everything above the exchange boundary works with `anyhow`.  The boundary
// itself keeps a typed error so the throttling layer can recognise the
// exchange's rate-limit signal and pull the ban expiry out of it.
// =============================================================================

use thiserror::Error;

/// Binance error code for "too many requests / IP banned".
pub const RATE_LIMIT_CODE: i64 = -1003;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The exchange answered with a non-success status and an error body.
    #[error("binance returned {status} (code {code}): {message}")]
    Api {
        status: u16,
        code: i64,
        message: String,
    },

    /// The request never produced a response (connect, TLS, timeout).
    #[error("http transport failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The response arrived but did not have the expected shape.
    #[error("malformed exchange response: {0}")]
    Decode(String),
}

impl ExchangeError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Whether this error is the exchange telling us to back off.
    ///
    /// HTTP 418 (auto-ban) and 429 (limit breached) carry the same meaning as
    /// the `-1003` code even when the body is missing.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Api { status, code, .. } => {
                *code == RATE_LIMIT_CODE || *status == 418 || *status == 429
            }
            _ => false,
        }
    }

    /// Ban expiry (epoch milliseconds) embedded in a rate-limit message such
    /// as `"Way too much request weight used; IP banned until 1507179450123."`
    pub fn ban_expiry_ms(&self) -> Option<i64> {
        match self {
            Self::Api { message, .. } => parse_ban_expiry(message),
            _ => None,
        }
    }
}

/// Extract the digits following `until ` in a Binance ban message.
pub fn parse_ban_expiry(message: &str) -> Option<i64> {
    let idx = message.find("until ")?;
    let digits: String = message[idx + "until ".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_expiry_parsed_from_message() {
        let msg = "Way too much request weight used; IP banned until 1507179450123. Please use WebSocket Streams for live updates to avoid bans.";
        assert_eq!(parse_ban_expiry(msg), Some(1_507_179_450_123));
    }

    #[test]
    fn ban_expiry_missing() {
        assert_eq!(parse_ban_expiry("Too much request weight used"), None);
        assert_eq!(parse_ban_expiry("banned until soon"), None);
    }

    #[test]
    fn rate_limit_detection() {
        let by_code = ExchangeError::Api {
            status: 400,
            code: RATE_LIMIT_CODE,
            message: "Too many requests".into(),
        };
        let by_status = ExchangeError::Api {
            status: 418,
            code: 0,
            message: String::new(),
        };
        let other = ExchangeError::Api {
            status: 400,
            code: -2010,
            message: "Account has insufficient balance".into(),
        };
        assert!(by_code.is_rate_limited());
        assert!(by_status.is_rate_limited());
        assert!(!other.is_rate_limited());
        assert!(!ExchangeError::decode("bad json").is_rate_limited());
    }
}
