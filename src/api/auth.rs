// =============================================================================
// Admin token guard for the operational API
// =============================================================================
//
// Any route that exposes pipeline internals takes the `AdminToken` extractor,
// which checks `Authorization: Bearer <token>` against `HORUS_ADMIN_TOKEN`.
// The env var is re-read per request so an operator can rotate the token
// without bouncing the dispatcher. An unset token rejects everything rather
// than falling open.
// =============================================================================

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Branchless byte comparison: ORs the XOR of every byte pair so the work
/// done is independent of where the first mismatch sits.
fn token_matches(candidate: &[u8], expected: &[u8]) -> bool {
    if candidate.len() != expected.len() {
        return false;
    }
    candidate
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// 403 with a JSON error body.
pub struct Forbidden(&'static str);

impl IntoResponse for Forbidden {
    fn into_response(self) -> Response {
        let body = axum::Json(serde_json::json!({ "error": self.0 }));
        (StatusCode::FORBIDDEN, body).into_response()
    }
}

/// Extractor gating the authenticated routes. Yields the presented token on
/// success, mostly so handlers can log who acted.
pub struct AdminToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for AdminToken
where
    S: Send + Sync,
{
    type Rejection = Forbidden;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let Some(presented) = presented else {
            warn!("admin request without a bearer token");
            return Err(Forbidden("missing or malformed authorization header"));
        };

        let expected = std::env::var("HORUS_ADMIN_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            warn!("HORUS_ADMIN_TOKEN unset — refusing all admin requests");
            return Err(Forbidden("server authentication not configured"));
        }

        if !token_matches(presented.as_bytes(), expected.as_bytes()) {
            warn!("admin request with a bad token");
            return Err(Forbidden("invalid authorization token"));
        }

        Ok(AdminToken(presented.to_string()))
    }
}
