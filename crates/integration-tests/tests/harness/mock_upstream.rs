//! Mock upstream vendor for integration tests
//!
//! Serves an OpenAI-compatible chat endpoint (JSON and SSE) and the framed
//! speech endpoints under one `/v1` base URL. Streamed bodies are paced by a
//! configurable delay per chunk.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use futures_util::StreamExt;
use tollgate_audio::frame::Frame;
use tokio_util::sync::CancellationToken;

pub const PROMPT_TOKENS: u64 = 10;
pub const COMPLETION_TOKENS: u64 = 20;
pub const STREAM_CHUNKS: usize = 10;
pub const TRANSCRIPT: &str = "hello world";
pub const TRANSCRIPT_DURATION_MS: u64 = 1500;

/// Audio payloads returned by the synthesis endpoint, in order
pub const AUDIO_CHUNKS: [&[u8]; 3] = [b"ID3-aaaa", b"bbbb", b"cc"];

pub struct MockUpstream {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockState>,
}

struct MockState {
    chat_requests: AtomicU32,
    speech_requests: AtomicU32,
    /// Chat requests to answer with 500 before succeeding
    failures_left: AtomicU32,
    chunk_delay: Duration,
}

impl MockUpstream {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_inner(0, Duration::from_millis(5)).await
    }

    /// Answer the first `n` chat requests with 500
    pub async fn start_failing(n: u32) -> anyhow::Result<Self> {
        Self::start_inner(n, Duration::from_millis(5)).await
    }

    /// Pace SSE chunks and audio frames so a caller can disconnect mid-stream
    /// or the gateway's stream deadline can pass
    pub async fn start_slow_stream(delay: Duration) -> anyhow::Result<Self> {
        Self::start_inner(0, delay).await
    }

    async fn start_inner(failures: u32, chunk_delay: Duration) -> anyhow::Result<Self> {
        let state = Arc::new(MockState {
            chat_requests: AtomicU32::new(0),
            speech_requests: AtomicU32::new(0),
            failures_left: AtomicU32::new(failures),
            chunk_delay,
        });

        let app = Router::new()
            .route("/v1/chat/completions", routing::post(chat_completions))
            .route("/v1/tts", routing::post(synthesize))
            .route("/v1/asr", routing::post(recognize))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown_clone.cancelled().await })
                .await
                .ok();
        });

        Ok(Self { addr, shutdown, state })
    }

    /// Base URL to register as an upstream endpoint
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    pub fn chat_requests(&self) -> u32 {
        self.state.chat_requests.load(Ordering::SeqCst)
    }

    pub fn speech_requests(&self) -> u32 {
        self.state.speech_requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Base URL of a port nothing listens on
pub async fn unreachable_base_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock listener");
    let addr = listener.local_addr().expect("mock address");
    drop(listener);
    format!("http://{addr}/v1")
}

fn usage() -> serde_json::Value {
    serde_json::json!({
        "prompt_tokens": PROMPT_TOKENS,
        "completion_tokens": COMPLETION_TOKENS,
        "total_tokens": PROMPT_TOKENS + COMPLETION_TOKENS,
    })
}

async fn chat_completions(State(state): State<Arc<MockState>>, Json(body): Json<serde_json::Value>) -> Response {
    state.chat_requests.fetch_add(1, Ordering::SeqCst);

    let failing = state
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok();
    if failing {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": {"message": "mock failure", "type": "server_error"}})),
        )
            .into_response();
    }

    let model = body["model"].as_str().unwrap_or("mock-model").to_owned();

    if body["stream"].as_bool().unwrap_or(false) {
        return stream_response(model, state.chunk_delay);
    }

    Json(serde_json::json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello from the mock"},
            "finish_reason": "stop"
        }],
        "usage": usage(),
    }))
    .into_response()
}

fn stream_response(model: String, delay: Duration) -> Response {
    let events = futures_util::stream::unfold(0usize, move |index| {
        let model = model.clone();
        async move {
            if index > STREAM_CHUNKS + 1 {
                return None;
            }
            tokio::time::sleep(delay).await;

            let event = if index < STREAM_CHUNKS {
                let chunk = serde_json::json!({
                    "id": "chatcmpl-mock",
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [{"index": 0, "delta": {"content": format!("tok{index} ")}, "finish_reason": null}]
                });
                format!("data: {chunk}\n\n")
            } else if index == STREAM_CHUNKS {
                let chunk = serde_json::json!({
                    "id": "chatcmpl-mock",
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [],
                    "usage": usage(),
                });
                format!("data: {chunk}\n\n")
            } else {
                "data: [DONE]\n\n".to_owned()
            };

            Some((Ok::<_, std::io::Error>(Bytes::from(event)), index + 1))
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(events))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn synthesize(State(state): State<Arc<MockState>>, _body: Bytes) -> Response {
    state.speech_requests.fetch_add(1, Ordering::SeqCst);

    let delay = state.chunk_delay;
    let last = AUDIO_CHUNKS.len() - 1;
    let frames = futures_util::stream::iter(AUDIO_CHUNKS.into_iter().enumerate()).then(move |(index, chunk)| {
        async move {
            tokio::time::sleep(delay).await;
            let sequence = i32::try_from(index + 1).unwrap_or(i32::MAX);
            let frame = Frame::audio_response(sequence, index == last, Bytes::from_static(chunk));
            frame.to_bytes().map_err(std::io::Error::other)
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(frames))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn recognize(State(state): State<Arc<MockState>>, _body: Bytes) -> Response {
    state.speech_requests.fetch_add(1, Ordering::SeqCst);

    let result = serde_json::json!({"text": TRANSCRIPT, "duration_ms": TRANSCRIPT_DURATION_MS});
    let frame = Frame::server_response(Bytes::from(result.to_string()));

    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        frame.to_bytes().expect("encodable frame"),
    )
        .into_response()
}
