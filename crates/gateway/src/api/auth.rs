//! Bearer-token authentication middleware.
//!
//! The token is read from the env var named by `server.api_token_env`
//! once at startup; only its SHA-256 digest is kept, compared in
//! constant time. Unset/empty token = dev mode (no auth, one warning).

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::state::AppState;

/// Hash the configured token at startup. Returns `None` in dev mode.
pub fn token_hash_from_env(env_var: &str) -> Option<Vec<u8>> {
    match std::env::var(env_var) {
        Ok(token) if !token.is_empty() => Some(Sha256::digest(token.as_bytes()).to_vec()),
        _ => {
            tracing::warn!(
                env_var,
                "no API token configured — the API is open (dev mode)"
            );
            None
        }
    }
}

pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_token_hash else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    let provided_hash = Sha256::digest(provided.as_bytes());

    if !bool::from(provided_hash.ct_eq(expected.as_slice())) {
        return ApiError(hearth_domain::Error::Auth(
            "invalid or missing API token".into(),
        ))
        .into_response();
    }

    next.run(req).await
}
