use http::{HeaderMap, HeaderName, HeaderValue};

use crate::{BusinessId, RequestMeta};

/// Echoed on every proxied response
pub const BUSINESS_ID: HeaderName = HeaderName::from_static("x-business-id");

/// Caller-supplied correlation id, echoed back when present
pub const TRACE_ID: HeaderName = HeaderName::from_static("x-trace-id");

/// Shared secret on `/internal/*` routes
pub const INTERNAL_SECRET: HeaderName = HeaderName::from_static("x-internal-secret");

/// First hop address set by a fronting proxy
pub const FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Add the business id and the caller's trace id to response headers
pub fn echo_call_headers(headers: &mut HeaderMap, business_id: Option<BusinessId>, meta: &RequestMeta) {
    if let Some(business_id) = business_id
        && let Ok(value) = HeaderValue::from_str(&business_id.to_string())
    {
        headers.insert(BUSINESS_ID, value);
    }

    if let Some(trace_id) = &meta.external_trace_id
        && let Ok(value) = HeaderValue::from_str(trace_id)
    {
        headers.insert(TRACE_ID, value);
    }
}
