//! Axum route handlers for the OpenAI-compatible chat endpoints

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use chrono::Utc;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use tollgate_core::headers::echo_call_headers;
use tollgate_core::{CallerIdentity, HttpError, RequestMeta, error_body};
use tollgate_store::Service;
use tollgate_upstream::DispatchError;

use crate::pipeline::{ChatPipeline, ChatReply};
use crate::protocol::{ModelEntry, ModelList};
use crate::LlmError;

/// Build the chat router
///
/// Expects the auth middleware to have inserted [`CallerIdentity`] and
/// [`RequestMeta`] extensions.
pub fn chat_router(pipeline: Arc<ChatPipeline>) -> Router {
    Router::new()
        .route("/v1/chat/completions", routing::post(chat_completions))
        .route("/v1/models", routing::get(list_models))
        .with_state(pipeline)
}

/// Handle `POST /v1/chat/completions`
async fn chat_completions(
    State(pipeline): State<Arc<ChatPipeline>>,
    Extension(caller): Extension<CallerIdentity>,
    Extension(meta): Extension<RequestMeta>,
    body: Bytes,
) -> Response {
    match pipeline.handle(caller, meta.clone(), body).await {
        Ok(ChatReply::Complete { business_id, body }) => {
            let mut response = Response::new(Body::from(body));
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            echo_call_headers(headers, Some(business_id), &meta);
            response
        }
        Ok(ChatReply::Stream { business_id, body }) => {
            let mut response = Response::new(Body::from_stream(body));
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            echo_call_headers(headers, Some(business_id), &meta);
            response
        }
        Err(e) => error_response(&e, &meta),
    }
}

/// Handle `GET /v1/models`
async fn list_models(State(pipeline): State<Arc<ChatPipeline>>) -> Json<ModelList> {
    let created = Utc::now().timestamp();
    let data = pipeline
        .catalog()
        .models(Service::ChatCompletion)
        .into_iter()
        .map(|id| ModelEntry {
            id,
            object: "model",
            created,
            owned_by: "tollgate",
        })
        .collect();

    Json(ModelList { object: "list", data })
}

/// Render an error, passing upstream JSON error bodies through unchanged
fn error_response(error: &LlmError, meta: &RequestMeta) -> Response {
    if let LlmError::Dispatch { source, .. } = error {
        tracing::warn!(error = %error, "chat completion failed");
        if let DispatchError::UpstreamStatus { status, body } = source
            && serde_json::from_str::<serde_json::Value>(body).is_ok()
        {
            let mut response = (*status, body.clone()).into_response();
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            echo_call_headers(response.headers_mut(), error.business_id(), meta);
            return response;
        }
    }

    let status = error.status_code();
    let mut response = (status, Json(error_body(error))).into_response();
    echo_call_headers(response.headers_mut(), error.business_id(), meta);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %error, "chat completion failed");
    }
    response
}
