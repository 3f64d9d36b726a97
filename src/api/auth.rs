// =============================================================================
// Bearer Token Authentication — Axum Extractor
// =============================================================================
//
// Validates `Authorization: Bearer <token>` against EXIT_ENGINE_API_TOKEN.
// An unset token rejects every authenticated request.  Comparison is done in
// constant time.
//
//   async fn handler(_auth: AuthBearer, ...) { ... }
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

pub const API_TOKEN_VAR: &str = "EXIT_ENGINE_API_TOKEN";

/// Compare two byte slices without short-circuiting on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Proof that the request carried the configured token.
#[derive(Debug)]
pub struct AuthBearer;

#[derive(Debug)]
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

/// Check an `Authorization` header value against `expected`.
pub fn authorize(header: Option<&str>, expected: &str) -> Result<AuthBearer, AuthRejection> {
    if expected.is_empty() {
        warn!("{API_TOKEN_VAR} is not set — rejecting authenticated request");
        return Err(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "Server authentication not configured",
        });
    }

    let Some(token) = header.and_then(|v| v.strip_prefix("Bearer ")) else {
        warn!("missing or malformed Authorization header");
        return Err(AuthRejection {
            status: StatusCode::UNAUTHORIZED,
            message: "Missing or invalid authorization token",
        });
    };

    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        warn!("invalid API token presented");
        return Err(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "Invalid authorization token",
        });
    }

    Ok(AuthBearer)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Read per request so the token can rotate without a restart.
        let expected = std::env::var(API_TOKEN_VAR).unwrap_or_default();
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        authorize(header, &expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_cases() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer_string"));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn valid_bearer_is_accepted() {
        assert!(authorize(Some("Bearer s3cret"), "s3cret").is_ok());
    }

    #[test]
    fn rejections_carry_status() {
        assert_eq!(authorize(None, "s3cret").unwrap_err().status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            authorize(Some("Basic s3cret"), "s3cret").unwrap_err().status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            authorize(Some("Bearer wrong"), "s3cret").unwrap_err().status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            authorize(Some("Bearer s3cret"), "").unwrap_err().status,
            StatusCode::FORBIDDEN
        );
    }
}
