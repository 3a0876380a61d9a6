//! API key checks for the REST API and the WebSocket upgrades.
//!
//! REST calls send `Authorization: Bearer <key>`. Browsers cannot set headers
//! on a WebSocket upgrade, so the tunnel and monitor endpoints also take the
//! key as `?token=<key>` (guacamole-common-js puts it in the tunnel URL). A
//! bearer header wins when both are present. Either way the key goes through
//! [`ApiKey::verify`].

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;

use crate::error::AuthError;

/// The relay's pre-shared key, carried as a router extension.
#[derive(Clone)]
pub struct ApiKey(Arc<str>);

impl ApiKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Check a presented key. `None` and the empty string count as missing.
    pub fn verify(&self, presented: Option<&str>) -> Result<(), AuthError> {
        let presented = presented
            .filter(|p| !p.is_empty())
            .ok_or(AuthError::Missing)?;
        if keys_match(self.0.as_bytes(), presented.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::Invalid)
        }
    }
}

/// The key from an `Authorization: Bearer` header, if any.
pub fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// The key a WebSocket upgrade presented: bearer header first, then `?token=`.
pub fn upgrade_credential<'a>(headers: &'a HeaderMap, token: Option<&'a str>) -> Option<&'a str> {
    bearer(headers).or(token)
}

/// Middleware for the REST routes.
///
/// - `401 Unauthorized` — no bearer key
/// - `403 Forbidden` — wrong key
/// - `500 Internal Server Error` — router built without the [`ApiKey`] extension
pub async fn require_api_key(
    Extension(key): Extension<ApiKey>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    key.verify(bearer(request.headers()))?;
    Ok(next.run(request).await)
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Missing => StatusCode::UNAUTHORIZED,
            Self::Invalid => StatusCode::FORBIDDEN,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Compares every byte of `expected` whatever `provided` holds, so timing
/// does not leak the key or its length.
fn keys_match(expected: &[u8], provided: &[u8]) -> bool {
    let padded = provided.iter().copied().chain(std::iter::repeat(0xff));
    let diff = expected
        .iter()
        .zip(padded)
        .fold(u8::from(expected.len() != provided.len()), |acc, (e, p)| acc | (e ^ p));
    diff == 0
}
