// =============================================================================
// Rate Limiter — rolling request-weight budget shared by every REST call
// =============================================================================
//
// Binance charges each REST call a weight against a rolling one-minute
// budget (6 000 for spot) and answers abuse with code -1003 plus a temporary
// IP ban.
//
// `RateLimiter` owns the budget.  Callers `acquire(weight)` before sending:
//   - an active ban suspends the caller until it expires;
//   - an elapsed window resets the counter;
//   - a request that would overflow the window suspends the caller until the
//     window rolls over.
//
// After each response the `X-MBX-USED-WEIGHT-1M` header overwrites the local
// estimate: concurrent callers make local-only accounting drift, the server
// count does not.
//
// `ThrottledTransport` applies all of this around any `Transport`.
// =============================================================================

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::binance::transport::{ApiRequest, ApiResponse, Transport};
use crate::error::ExchangeError;

/// Spot request-weight budget per minute.
pub const DEFAULT_WEIGHT_LIMIT: u32 = 6000;
/// Length of the rolling weight window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Mutable budget state; only ever touched while holding the limiter's lock.
#[derive(Debug)]
struct RateBudget {
    used_weight: u32,
    window_start: Instant,
    banned_until: Option<Instant>,
}

/// Serialisable view of the budget for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub used_weight: u32,
    pub limit: u32,
    pub window_secs: f64,
    pub window_elapsed_secs: f64,
    pub banned_for_secs: Option<f64>,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    /// Created on first use so the limiter can be built before a runtime
    /// exists.
    budget: OnceLock<Mutex<RateBudget>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            budget: OnceLock::new(),
        }
    }

    fn budget(&self) -> &Mutex<RateBudget> {
        self.budget.get_or_init(|| {
            Mutex::new(RateBudget {
                used_weight: 0,
                window_start: Instant::now(),
                banned_until: None,
            })
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Reserve `weight` units, suspending the caller while banned or while
    /// the current window has no room left.
    pub async fn acquire(&self, weight: u32) {
        let mut budget = self.budget().lock().await;
        let mut now = Instant::now();

        if let Some(until) = budget.banned_until {
            if now < until {
                warn!(
                    wait_ms = (until - now).as_millis() as u64,
                    "exchange ban active — holding request until it expires"
                );
                sleep_until(until).await;
                now = Instant::now();
            }
            budget.banned_until = None;
        }

        if now.duration_since(budget.window_start) >= self.window {
            budget.used_weight = 0;
            budget.window_start = now;
        }

        if budget.used_weight + weight > self.limit {
            let wait = self
                .window
                .saturating_sub(now.duration_since(budget.window_start));
            info!(
                used_weight = budget.used_weight,
                requested_weight = weight,
                limit = self.limit,
                wait_ms = wait.as_millis() as u64,
                "weight budget exhausted — waiting for window rollover"
            );
            sleep(wait).await;
            budget.used_weight = 0;
            budget.window_start = Instant::now();
        }

        budget.used_weight += weight;
        debug!(used_weight = budget.used_weight, weight, "rate budget acquired");
    }

    /// Overwrite the local estimate with the server-reported weight.
    pub async fn record_used_weight(&self, used: u32) {
        let mut budget = self.budget().lock().await;
        budget.used_weight = used;
    }

    /// Refuse to send anything before `until`.
    pub async fn ban_until(&self, until: Instant) {
        let mut budget = self.budget().lock().await;
        budget.banned_until = Some(until);
    }

    /// Record a ban signalled by `err`: until the instant embedded in the
    /// message, or one full window when none is given.
    pub async fn record_ban(&self, err: &ExchangeError) {
        let until = match err.ban_expiry_ms() {
            Some(expiry_ms) => {
                let remaining = (expiry_ms - Utc::now().timestamp_millis()).max(0) as u64;
                Instant::now() + Duration::from_millis(remaining)
            }
            None => Instant::now() + self.window,
        };
        warn!(
            ban_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
            error = %err,
            "exchange rate-limit violation — backing off"
        );
        self.ban_until(until).await;
    }

    pub async fn snapshot(&self) -> RateLimitSnapshot {
        let budget = self.budget().lock().await;
        let now = Instant::now();
        RateLimitSnapshot {
            used_weight: budget.used_weight,
            limit: self.limit,
            window_secs: self.window.as_secs_f64(),
            window_elapsed_secs: now.duration_since(budget.window_start).as_secs_f64(),
            banned_for_secs: budget
                .banned_until
                .filter(|until| *until > now)
                .map(|until| (until - now).as_secs_f64()),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WEIGHT_LIMIT, DEFAULT_WINDOW)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Throttling decorator
// -----------------------------------------------------------------------------

/// Wraps a transport so every request passes the shared budget first.
pub struct ThrottledTransport<T> {
    inner: T,
    limiter: Arc<RateLimiter>,
}

impl<T: Transport> ThrottledTransport<T> {
    pub fn new(inner: T, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for ThrottledTransport<T> {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ExchangeError> {
        self.limiter.acquire(request.weight).await;

        match self.inner.send(request).await {
            Ok(resp) => {
                if let Some(used) = resp.used_weight.filter(|u| *u > 0) {
                    self.limiter.record_used_weight(used).await;
                }
                Ok(resp)
            }
            Err(err) => {
                if err.is_rate_limited() {
                    self.limiter.record_ban(&err).await;
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RATE_LIMIT_CODE;
    use parking_lot::Mutex as SyncMutex;

    #[tokio::test]
    async fn third_call_waits_for_window() {
        let window = Duration::from_millis(300);
        let limiter = RateLimiter::new(2, window);

        let start = Instant::now();
        limiter.acquire(1).await;
        limiter.acquire(1).await;
        assert!(start.elapsed() < window);
        limiter.acquire(1).await;
        assert!(start.elapsed() >= window);
        assert_eq!(limiter.snapshot().await.used_weight, 1);
    }

    #[tokio::test]
    async fn counter_resets_only_after_window() {
        let limiter = RateLimiter::new(10, Duration::from_millis(200));
        limiter.acquire(4).await;
        limiter.acquire(4).await;
        assert_eq!(limiter.snapshot().await.used_weight, 8);

        tokio::time::sleep(Duration::from_millis(220)).await;
        limiter.acquire(3).await;
        assert_eq!(limiter.snapshot().await.used_weight, 3);
    }

    #[tokio::test]
    async fn ban_blocks_until_expiry() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60));
        let start = Instant::now();
        limiter.ban_until(start + Duration::from_millis(200)).await;

        limiter.acquire(1).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(limiter.snapshot().await.banned_for_secs.is_none());
    }

    #[tokio::test]
    async fn server_weight_overwrites_estimate() {
        let limiter = RateLimiter::new(6000, DEFAULT_WINDOW);
        limiter.acquire(5).await;
        limiter.record_used_weight(4200).await;
        assert_eq!(limiter.snapshot().await.used_weight, 4200);
    }

    #[test]
    fn limiter_constructible_outside_runtime() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.limit(), DEFAULT_WEIGHT_LIMIT);
        assert!(limiter.budget.get().is_none());
    }

    /// Transport double that replays scripted outcomes.
    struct ScriptedTransport {
        outcomes: SyncMutex<Vec<Result<ApiResponse, ExchangeError>>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _request: &ApiRequest) -> Result<ApiResponse, ExchangeError> {
            self.outcomes.lock().remove(0)
        }
    }

    fn ok(used: u32) -> Result<ApiResponse, ExchangeError> {
        Ok(ApiResponse {
            used_weight: Some(used),
            body: serde_json::Value::Null,
        })
    }

    #[tokio::test]
    async fn throttled_transport_syncs_header_weight() {
        let limiter = Arc::new(RateLimiter::new(6000, DEFAULT_WINDOW));
        let transport = ThrottledTransport::new(
            ScriptedTransport {
                outcomes: SyncMutex::new(vec![ok(37)]),
            },
            limiter.clone(),
        );
        transport
            .send(&ApiRequest::get("/api/v3/ping", 1))
            .await
            .unwrap();
        assert_eq!(limiter.snapshot().await.used_weight, 37);
    }

    #[tokio::test]
    async fn rate_limit_error_records_ban_and_is_reraised() {
        let limiter = Arc::new(RateLimiter::new(6000, DEFAULT_WINDOW));
        let expiry = Utc::now().timestamp_millis() + 250;
        let transport = ThrottledTransport::new(
            ScriptedTransport {
                outcomes: SyncMutex::new(vec![
                    Err(ExchangeError::Api {
                        status: 418,
                        code: RATE_LIMIT_CODE,
                        message: format!("Way too much request weight used; IP banned until {expiry}."),
                    }),
                    ok(1),
                ]),
            },
            limiter.clone(),
        );

        let err = transport
            .send(&ApiRequest::get("/api/v3/account", 20))
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());

        let banned = limiter.snapshot().await.banned_for_secs.unwrap();
        assert!(banned > 0.0 && banned <= 0.25);

        let start = Instant::now();
        transport
            .send(&ApiRequest::get("/api/v3/ping", 1))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn rate_limit_without_expiry_bans_full_window() {
        let limiter = Arc::new(RateLimiter::new(6000, Duration::from_secs(60)));
        let err = ExchangeError::Api {
            status: 429,
            code: RATE_LIMIT_CODE,
            message: "Too many requests".into(),
        };
        limiter.record_ban(&err).await;
        let banned = limiter.snapshot().await.banned_for_secs.unwrap();
        assert!(banned > 59.0 && banned <= 60.0);
    }

    #[tokio::test]
    async fn ordinary_errors_do_not_ban() {
        let limiter = Arc::new(RateLimiter::new(6000, DEFAULT_WINDOW));
        let transport = ThrottledTransport::new(
            ScriptedTransport {
                outcomes: SyncMutex::new(vec![Err(ExchangeError::decode("truncated body"))]),
            },
            limiter.clone(),
        );
        assert!(transport
            .send(&ApiRequest::get("/api/v3/ping", 1))
            .await
            .is_err());
        assert!(limiter.snapshot().await.banned_for_secs.is_none());
    }
}
