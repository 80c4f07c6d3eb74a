use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use constant_time_eq::constant_time_eq;
use tracing::warn;

use crate::error::{ApiError, Error};
use crate::handlers::blocking;
use crate::store::GatewayRecord;
use crate::AppState;

pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";

/// Axum middleware guarding the admin routes with `X-Admin-Key`. Without a
/// configured key the admin surface is closed.
pub async fn require_admin_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("admin request refused: VPNSYNC_ADMIN_KEY is not configured");
        return ApiError::admin(Error::Auth("admin API disabled: no admin key configured".into()))
            .into_response();
    };

    let presented = request
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match presented {
        Some(k) if constant_time_eq(k.as_bytes(), expected.as_bytes()) => next.run(request).await,
        _ => ApiError::admin(Error::Auth(format!("valid {ADMIN_KEY_HEADER} required"))).into_response(),
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// A gateway authenticated by its bearer token. Retired gateways and unknown
/// tokens are rejected with 401.
pub struct AuthedGateway(pub GatewayRecord);

impl FromRequestParts<AppState> for AuthedGateway {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::public(Error::Auth("missing gateway bearer token".into())))?;
        let hash = state.tokens.hash(token).map_err(ApiError::public)?;
        let gateway = blocking(state, move |store| store.gateway_by_token(&hash))
            .await
            .map_err(ApiError::public)?;
        Ok(AuthedGateway(gateway))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_requires_scheme_and_value() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert("Authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert("Authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
        headers.insert("Authorization", HeaderValue::from_static("Bearer vgt_123"));
        assert_eq!(bearer_token(&headers), Some("vgt_123"));
    }
}
