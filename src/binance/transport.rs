// =============================================================================
// Binance Transport — HMAC-SHA256 signed HTTP requests
// =============================================================================
//
// `Transport` is the seam every REST call crosses.  `HttpTransport` talks to
// Binance over reqwest; `ThrottledTransport` (rate_limit.rs) wraps any
// transport with the shared weight budget.
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::error::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Bounded wait for every outbound call.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Header carrying the exchange's view of our 1-minute weight usage.
pub const USED_WEIGHT_HEADER: &str = "X-MBX-USED-WEIGHT-1M";

/// One REST call, described independently of the HTTP client.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: &'static str,
    pub params: Vec<(&'static str, String)>,
    pub signed: bool,
    /// Request weight charged against the rolling budget.
    pub weight: u32,
}

impl ApiRequest {
    pub fn get(path: &'static str, weight: u32) -> Self {
        Self {
            method: Method::GET,
            path,
            params: Vec::new(),
            signed: false,
            weight,
        }
    }

    pub fn post(path: &'static str, weight: u32) -> Self {
        Self {
            method: Method::POST,
            ..Self::get(path, weight)
        }
    }

    pub fn put(path: &'static str, weight: u32) -> Self {
        Self {
            method: Method::PUT,
            ..Self::get(path, weight)
        }
    }

    pub fn param(mut self, key: &'static str, value: impl ToString) -> Self {
        self.params.push((key, value.to_string()));
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn query_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Successful response body plus the weight header, if present.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub used_weight: Option<u32>,
    pub body: serde_json::Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ExchangeError>;
}

/// Binance REST transport with HMAC-SHA256 request signing.
pub struct HttpTransport {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    /// Exchange clock minus local clock, applied to signed timestamps.
    time_offset_ms: AtomicI64,
}

impl HttpTransport {
    /// Create a new transport.
    ///
    /// # Arguments
    /// * `api_key`  — Binance API key (sent as a header, never in query params).
    /// * `secret`   — Binance secret key used exclusively for HMAC signing.
    /// * `base_url` — REST root, e.g. `https://api.binance.com`.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ExchangeError> {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        let base_url = base_url.into();
        debug!(base_url = %base_url, "HttpTransport initialised");

        Ok(Self {
            secret: secret.into(),
            base_url,
            client,
            time_offset_ms: AtomicI64::new(0),
        })
    }

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        sign_with(&self.secret, query)
    }

    pub fn set_time_offset(&self, offset_ms: i64) {
        self.time_offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Current UNIX timestamp in milliseconds, corrected by the server offset.
    fn timestamp_ms(&self) -> i64 {
        local_time_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(path = request.path, weight = request.weight), name = "binance::send")]
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ExchangeError> {
        let params = request.query_string();
        let qs = if request.signed {
            self.signed_query(&params)
        } else {
            params
        };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, request.path)
        } else {
            format!("{}{}?{}", self.base_url, request.path, qs)
        };

        let resp = self
            .client
            .request(request.method.clone(), &url)
            .send()
            .await?;

        let status = resp.status();
        let used_weight = resp
            .headers()
            .get(USED_WEIGHT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok());

        let text = resp.text().await?;
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &text));
        }

        let body: serde_json::Value = if text.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| ExchangeError::decode(format!("{}: {e}", request.path)))?
        };

        debug!(path = request.path, status = status.as_u16(), ?used_weight, "binance response");
        Ok(ApiResponse { used_weight, body })
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Error for a non-success response.  Bodies that are not Binance's JSON
/// error shape (HTML ban pages, empty 429s) keep the raw text as the message.
fn api_error(status: u16, text: &str) -> ExchangeError {
    let body: serde_json::Value = serde_json::from_str(text).unwrap_or_default();
    ExchangeError::Api {
        status,
        code: body["code"].as_i64().unwrap_or(0),
        message: body["msg"].as_str().unwrap_or(text).to_string(),
    }
}

fn sign_with(secret: &str, query: &str) -> String {
    // HMAC-SHA256 accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn local_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
