//! Axum route handlers for the OpenAI-compatible audio endpoints

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Extension, Multipart, State};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use tollgate_core::headers::echo_call_headers;
use tollgate_core::{CallerIdentity, HttpError, RequestMeta, error_body};
use tollgate_upstream::DispatchError;

use crate::AudioError;
use crate::pipeline::{AudioPipeline, SpeechReply, TranscriptionReply};
use crate::protocol::{TranscriptionForm, TranscriptionResponse};

/// Build the audio router
///
/// Expects the same extensions as the chat router.
pub fn audio_router(pipeline: Arc<AudioPipeline>) -> Router {
    Router::new()
        .route("/v1/audio/speech", routing::post(speech))
        .route("/v1/audio/transcriptions", routing::post(transcriptions))
        .with_state(pipeline)
}

/// Handle `POST /v1/audio/speech`
async fn speech(
    State(pipeline): State<Arc<AudioPipeline>>,
    Extension(caller): Extension<CallerIdentity>,
    Extension(meta): Extension<RequestMeta>,
    body: Bytes,
) -> Response {
    match pipeline.speech(caller, meta.clone(), body).await {
        Ok(SpeechReply {
            business_id,
            content_type,
            body,
        }) => {
            let mut response = Response::new(Body::from_stream(body));
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            echo_call_headers(headers, Some(business_id), &meta);
            response
        }
        Err(e) => error_response(&e, &meta),
    }
}

/// Handle `POST /v1/audio/transcriptions`
async fn transcriptions(
    State(pipeline): State<Arc<AudioPipeline>>,
    Extension(caller): Extension<CallerIdentity>,
    Extension(meta): Extension<RequestMeta>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let form = match multipart {
        Ok(multipart) => read_form(multipart).await,
        Err(rejection) => Err(AudioError::InvalidRequest(rejection.body_text())),
    };

    let result = match form {
        Ok(form) => pipeline.transcribe(caller, meta.clone(), form).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(TranscriptionReply {
            business_id,
            text,
            response_format,
        }) => {
            let mut response = if response_format.as_deref() == Some("text") {
                text.into_response()
            } else {
                Json(TranscriptionResponse { text: &text }).into_response()
            };
            echo_call_headers(response.headers_mut(), Some(business_id), &meta);
            response
        }
        Err(e) => error_response(&e, &meta),
    }
}

async fn read_form(mut multipart: Multipart) -> Result<TranscriptionForm, AudioError> {
    let invalid = |e: MultipartError| AudioError::InvalidRequest(format!("invalid multipart body: {e}"));

    let mut audio = None;
    let mut filename = "audio.wav".to_owned();
    let mut content_type = "audio/wav".to_owned();
    let mut model = String::new();
    let mut language = None;
    let mut prompt = None;
    let mut response_format = None;

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" => {
                if let Some(name) = field.file_name() {
                    name.clone_into(&mut filename);
                }
                if let Some(ct) = field.content_type() {
                    ct.clone_into(&mut content_type);
                }
                audio = Some(field.bytes().await.map_err(invalid)?);
            }
            "model" => model = field.text().await.map_err(invalid)?,
            "language" => language = Some(field.text().await.map_err(invalid)?),
            "prompt" => prompt = Some(field.text().await.map_err(invalid)?),
            "response_format" => response_format = Some(field.text().await.map_err(invalid)?),
            _ => {}
        }
    }

    let audio = audio.ok_or_else(|| AudioError::InvalidRequest("missing required 'file' field".to_owned()))?;

    Ok(TranscriptionForm {
        audio,
        filename,
        content_type,
        model,
        language,
        prompt,
        response_format,
    })
}

/// Render an error, passing upstream JSON error bodies through unchanged
fn error_response(error: &AudioError, meta: &RequestMeta) -> Response {
    if let AudioError::Dispatch { source, .. } = error {
        tracing::warn!(error = %error, "audio call failed");
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
        tracing::error!(error = %error, "audio call failed");
    }
    response
}
