use std::sync::Arc;

use axum::Json;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::HeaderMap;
use http::header::AUTHORIZATION;
use tollgate_auth::{AuthError, KeyVerifier};
use tollgate_core::headers::echo_call_headers;
use tollgate_core::{CallerIdentity, HttpError, RequestMeta, error_body};
use tollgate_telemetry::metrics;

/// Authenticate requests via bearer API key
///
/// Resolves the key through the [`KeyVerifier`] and inserts the
/// [`CallerIdentity`] extension. Public paths pass through untouched.
pub async fn auth_middleware(
    verifier: Arc<KeyVerifier>,
    public_paths: Arc<[String]>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if public_paths.iter().any(|prefix| is_under(path, prefix)) {
        return next.run(request).await;
    }

    let token = bearer_token(request.headers()).map(str::to_owned);
    let result = match token {
        Some(token) => verifier.verify(&token).await,
        None => Err(AuthError::MissingKey),
    };

    match result {
        Ok(record) => {
            tracing::debug!(api_key_id = record.id, user_id = record.user_id, "api key verified");
            request.extensions_mut().insert(CallerIdentity {
                api_key_id: record.id,
                user_id: record.user_id,
                wallet_id: record.wallet_id,
            });
            next.run(request).await
        }
        Err(e) => {
            metrics::record_auth_rejection(rejection_reason(&e));
            tracing::warn!(error = %e, "API key authentication failed");

            let meta = request.extensions().get::<RequestMeta>().cloned().unwrap_or_default();
            let mut response = (e.status_code(), Json(error_body(&e))).into_response();
            echo_call_headers(response.headers_mut(), None, &meta);
            response
        }
    }
}

/// Whether `path` is `prefix` itself or a path segment below it
///
/// Paths with `..` segments never match.
fn is_under(path: &str, prefix: &str) -> bool {
    if path.split('/').any(|segment| segment == "..") {
        return false;
    }
    let prefix = prefix.trim_end_matches('/');
    path.strip_prefix(prefix)
        .is_some_and(|rest| prefix.is_empty() || rest.is_empty() || rest.starts_with('/'))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

const fn rejection_reason(error: &AuthError) -> &'static str {
    match error {
        AuthError::MissingKey => "missing",
        AuthError::MalformedKey => "malformed",
        AuthError::FilterRejected => "filter",
        AuthError::KeyNotFound => "not_found",
        AuthError::Store(_) => "store",
    }
}
