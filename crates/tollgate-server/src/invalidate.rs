use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use http::{HeaderMap, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tollgate_auth::KeyVerifier;
use tollgate_core::headers::INTERNAL_SECRET;

/// Shared state for the key invalidation endpoint
#[derive(Clone)]
pub struct InvalidateState {
    pub verifier: Arc<KeyVerifier>,
    pub internal_secret: SecretString,
}

#[derive(Deserialize)]
pub struct InvalidateBody {
    /// Hex SHA-256 of the revoked key
    pub key_hash: String,
}

/// Drop a cached key record so a revocation takes effect immediately
pub async fn invalidate_key_handler(
    State(state): State<InvalidateState>,
    headers: HeaderMap,
    Json(body): Json<InvalidateBody>,
) -> StatusCode {
    let secret = headers.get(INTERNAL_SECRET).and_then(|v| v.to_str().ok());

    if secret != Some(state.internal_secret.expose_secret()) {
        tracing::warn!("rejected key invalidation with bad internal secret");
        return StatusCode::UNAUTHORIZED;
    }

    state.verifier.invalidate(&body.key_hash).await;
    tracing::info!(key_hash = %body.key_hash, "api key invalidated");
    StatusCode::NO_CONTENT
}
