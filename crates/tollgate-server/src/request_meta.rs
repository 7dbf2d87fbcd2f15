use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use http::{HeaderMap, HeaderName};
use http::header::USER_AGENT;
use tollgate_core::RequestMeta;
use tollgate_core::headers::{FORWARDED_FOR, TRACE_ID};

/// Capture caller provenance into a [`RequestMeta`] extension
pub async fn request_meta_middleware(mut request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let meta = extract_meta(request.headers(), peer);
    request.extensions_mut().insert(meta);

    next.run(request).await
}

fn extract_meta(headers: &HeaderMap, peer: Option<String>) -> RequestMeta {
    let header = move |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    // first hop of the proxy chain is the original client
    let client_ip = header(FORWARDED_FOR)
        .and_then(|chain| chain.split(',').next())
        .map(|ip| ip.trim().to_owned())
        .filter(|ip| !ip.is_empty())
        .or(peer);

    RequestMeta {
        client_ip,
        user_agent: header(USER_AGENT).map(str::to_owned),
        external_trace_id: header(TRACE_ID).map(str::to_owned),
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn forwarded_for_wins_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"));
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8.0"));
        headers.insert(TRACE_ID, HeaderValue::from_static("abc-123"));

        let meta = extract_meta(&headers, Some("10.0.0.2".to_owned()));

        assert_eq!(meta.client_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(meta.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(meta.external_trace_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn falls_back_to_peer_address() {
        let meta = extract_meta(&HeaderMap::new(), Some("10.0.0.2".to_owned()));
        assert_eq!(meta.client_ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(meta.external_trace_id, None);
    }
}
