//! Chat completion forwarding with metering
//!
//! Every call that passes validation produces exactly one finished record
//! set. Buffered calls record once the response is read. Streamed calls
//! record `STARTED` when the stream opens and finish from the draining task,
//! so a caller that disconnects is still billed for what the upstream
//! produced.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::Stream;
use http::header::{ACCEPT, CONTENT_TYPE};
use tollgate_billing::{BillingContext, BillingError, CallRecorder, PricingCatalog, Usage};
use tollgate_core::{BusinessId, CallerIdentity, RequestMeta, best_effort};
use tollgate_store::{CallStatus, Provider, Service};
use tollgate_telemetry::metrics;
use tollgate_upstream::{
    DispatchError, DispatchFailure, Dispatcher, ForwardOptions, StreamEnd, TeeOutcome, UpstreamClient, spawn_tee,
};

use crate::LlmError;
use crate::protocol::{ChatRequest, ChatResponse, WireUsage};
use crate::usage::{resolve_usage, summarize_stream};

const CHAT_PATH: &str = "chat/completions";

/// Body stream handed to the caller
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// Successful result of a chat call
pub enum ChatReply {
    /// Upstream JSON body, forwarded unchanged
    Complete { business_id: BusinessId, body: Bytes },
    /// SSE bytes as they arrive from the upstream
    Stream { business_id: BusinessId, body: ReplyStream },
}

impl ChatReply {
    pub const fn business_id(&self) -> BusinessId {
        match self {
            Self::Complete { business_id, .. } | Self::Stream { business_id, .. } => *business_id,
        }
    }
}

impl std::fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete { business_id, body } => f
                .debug_struct("Complete")
                .field("business_id", business_id)
                .field("bytes", &body.len())
                .finish(),
            Self::Stream { business_id, .. } => f
                .debug_struct("Stream")
                .field("business_id", business_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Validates, prices, dispatches and records chat completion calls
pub struct ChatPipeline {
    dispatcher: Dispatcher,
    client: UpstreamClient,
    catalog: Arc<PricingCatalog>,
    recorder: CallRecorder,
    options: ForwardOptions,
}

impl ChatPipeline {
    pub fn new(
        dispatcher: Dispatcher,
        client: UpstreamClient,
        catalog: Arc<PricingCatalog>,
        recorder: CallRecorder,
        options: ForwardOptions,
    ) -> Self {
        Self {
            dispatcher,
            client,
            catalog,
            recorder,
            options,
        }
    }

    pub fn catalog(&self) -> &PricingCatalog {
        &self.catalog
    }

    /// Handle one `POST /v1/chat/completions` body
    ///
    /// Caller errors are returned before any record is written.
    pub async fn handle(&self, caller: CallerIdentity, meta: RequestMeta, raw: Bytes) -> Result<ChatReply, LlmError> {
        let mut body: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| LlmError::InvalidRequest(format!("invalid JSON body: {e}")))?;
        let request: ChatRequest = serde_json::from_value(body.clone())
            .map_err(|e| LlmError::InvalidRequest(format!("invalid chat completion request: {e}")))?;

        if request.messages.is_empty() {
            return Err(LlmError::InvalidRequest("messages must not be empty".to_owned()));
        }

        let price = self
            .catalog
            .price(Service::ChatCompletion, &request.model)
            .ok_or_else(|| BillingError::UnknownModel {
                service: Service::ChatCompletion,
                model: request.model.clone(),
            })?;

        let mut ctx = BillingContext::new(caller, meta, price);
        ctx.request_body = String::from_utf8_lossy(&raw).into_owned();

        if request.stream {
            request_stream_usage(&mut body);
            let payload = serde_json::to_vec(&body)
                .map_err(|e| LlmError::InvalidRequest(format!("invalid chat completion request: {e}")))?;
            self.stream(ctx, request, Bytes::from(payload)).await
        } else {
            self.complete(ctx, &request, raw).await
        }
    }

    async fn complete(&self, mut ctx: BillingContext, request: &ChatRequest, payload: Bytes) -> Result<ChatReply, LlmError> {
        let started = Instant::now();
        let timeout = self.options.request_timeout;

        let result = self
            .dispatcher
            .dispatch(
                Provider::OpenAi,
                |attempt, upstream_id, e: &DispatchError| {
                    metrics::record_upstream_failure(Provider::OpenAi.as_str(), e.is_retryable());
                    ctx.record_upstream_error(attempt, upstream_id, e.to_string());
                },
                |upstream| {
                    let request = self
                        .client
                        .post(&upstream, CHAT_PATH)
                        .timeout(timeout)
                        .header(CONTENT_TYPE, "application/json")
                        .body(payload.clone());
                    async move {
                        let response = self.client.send(request).await?;
                        response.bytes().await.map_err(DispatchError::from)
                    }
                },
            )
            .await;

        let dispatched = match result {
            Ok(dispatched) => dispatched,
            Err(failure) => {
                metrics::record_call(Service::ChatCompletion.as_str(), "failed", started);
                return Err(self.fail(ctx, request, failure).await);
            }
        };

        ctx.set_upstream(dispatched.upstream.id);
        let body = dispatched.value;
        ctx.response_body = String::from_utf8_lossy(&body).into_owned();

        let response = serde_json::from_slice::<ChatResponse>(&body).unwrap_or_else(|e| {
            ctx.record_internal_error(format!("unparseable upstream response: {e}"));
            ChatResponse::default()
        });
        ctx.response_text = response.text();
        apply_usage(&mut ctx, response.usage, request);

        ctx.finish(CallStatus::Succeeded);
        best_effort::log_failure("record call", self.recorder.finish(&ctx).await);
        metrics::record_call(Service::ChatCompletion.as_str(), "succeeded", started);

        Ok(ChatReply::Complete {
            business_id: ctx.business_id(),
            body,
        })
    }

    async fn stream(&self, mut ctx: BillingContext, request: ChatRequest, payload: Bytes) -> Result<ChatReply, LlmError> {
        let started = Instant::now();
        let open_timeout = self.options.request_timeout;

        let result = self
            .dispatcher
            .dispatch(
                Provider::OpenAi,
                |attempt, upstream_id, e: &DispatchError| {
                    metrics::record_upstream_failure(Provider::OpenAi.as_str(), e.is_retryable());
                    ctx.record_upstream_error(attempt, upstream_id, e.to_string());
                },
                |upstream| {
                    let request = self
                        .client
                        .post(&upstream, CHAT_PATH)
                        .header(CONTENT_TYPE, "application/json")
                        .header(ACCEPT, "text/event-stream")
                        .body(payload.clone());
                    async move {
                        tokio::time::timeout(open_timeout, self.client.send(request))
                            .await
                            .unwrap_or(Err(DispatchError::Timeout))
                    }
                },
            )
            .await;

        let dispatched = match result {
            Ok(dispatched) => dispatched,
            Err(failure) => {
                metrics::record_call(Service::ChatCompletion.as_str(), "failed", started);
                return Err(self.fail(ctx, &request, failure).await);
            }
        };

        ctx.set_upstream(dispatched.upstream.id);
        self.recorder.begin(&ctx).await;

        let business_id = ctx.business_id();
        let attempt = dispatched.attempt;
        let recorder = self.recorder.clone();
        let charge_on_error = self.options.charge_on_upstream_error;

        let body = spawn_tee(
            dispatched.value.bytes_stream(),
            self.options.stream_timeout,
            move |outcome| async move {
                let outcome_label = finish_stream(&mut ctx, &request, outcome, attempt, charge_on_error).await;
                best_effort::log_failure("record call", recorder.finish(&ctx).await);
                metrics::record_call(Service::ChatCompletion.as_str(), outcome_label, started);
            },
        );

        Ok(ChatReply::Stream {
            business_id,
            body: Box::pin(body),
        })
    }

    /// Record a call whose dispatch failed and build the caller's error
    async fn fail(&self, mut ctx: BillingContext, request: &ChatRequest, failure: DispatchFailure) -> LlmError {
        if let Some(upstream_id) = failure.upstream_id {
            ctx.set_upstream(upstream_id);
        }

        if failure.error.is_environment() {
            ctx.mark_no_charge();
        } else {
            if let DispatchError::UpstreamStatus { body, .. } = &failure.error {
                ctx.response_body.clone_from(body);
            }
            ctx.record_internal_error(format!("upstream rejected call: {}", failure.error));
            if self.options.charge_on_upstream_error {
                apply_usage(&mut ctx, None, request);
            }
        }

        ctx.finish(CallStatus::Failed);
        best_effort::log_failure("record call", self.recorder.finish(&ctx).await);

        LlmError::Dispatch {
            business_id: ctx.business_id(),
            source: failure.error,
        }
    }
}

impl std::fmt::Debug for ChatPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatPipeline")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Settle a drained stream's context; returns the outcome label
async fn finish_stream(
    ctx: &mut BillingContext,
    request: &ChatRequest,
    outcome: TeeOutcome,
    attempt: u32,
    charge_on_error: bool,
) -> &'static str {
    let summary = summarize_stream(outcome.body.clone()).await;
    ctx.response_body = String::from_utf8_lossy(&outcome.body).into_owned();
    ctx.response_text.clone_from(&summary.text);

    let upstream_id = ctx.upstream_id();
    let (status, label) = match (&outcome.end, &summary.error) {
        (StreamEnd::Completed, None) => (CallStatus::Succeeded, "succeeded"),
        (StreamEnd::Completed, Some(error)) | (StreamEnd::Failed(error), _) => {
            ctx.record_upstream_error(attempt, upstream_id, error.clone());
            (CallStatus::Failed, "failed")
        }
        (StreamEnd::TimedOut, _) => {
            ctx.record_upstream_error(attempt, upstream_id, "stream exceeded its deadline");
            ctx.mark_no_charge();
            (CallStatus::Failed, "timed_out")
        }
    };

    if status == CallStatus::Succeeded || summary.events > 0 {
        apply_usage(ctx, summary.usage, request);
    } else if charge_on_error {
        apply_usage(ctx, None, request);
    }

    ctx.finish(status);

    tracing::info!(
        business_id = %ctx.business_id(),
        chunks = outcome.chunks,
        client_connected = outcome.client_connected,
        outcome = label,
        "chat stream finished"
    );

    label
}

fn apply_usage(ctx: &mut BillingContext, reported: Option<WireUsage>, request: &ChatRequest) {
    let text = ctx.response_text.clone();
    match resolve_usage(reported, request, &text) {
        Ok(usage) => ctx.set_usage(Usage::Chat(usage)),
        Err(e) => ctx.record_internal_error(format!("token count failed, billing zero usage: {e}")),
    }
}

/// Ask the upstream to append a usage chunk to the stream
fn request_stream_usage(body: &mut serde_json::Value) {
    let Some(fields) = body.as_object_mut() else {
        return;
    };
    let options = fields
        .entry("stream_options")
        .or_insert_with(|| serde_json::json!({}));
    if let Some(options) = options.as_object_mut() {
        options.insert("include_usage".to_owned(), serde_json::Value::Bool(true));
    }
}
