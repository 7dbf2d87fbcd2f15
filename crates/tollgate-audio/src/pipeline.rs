//! Speech forwarding with metering
//!
//! Synthesis streams audio frames back and is billed on the UTF-8 length of
//! the input text. Recognition is buffered and billed on the audio duration
//! the upstream reports, falling back to the WAV header of the upload.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use http::header::CONTENT_TYPE;
use tokio_util::codec::Encoder;
use tollgate_billing::{BillingContext, BillingError, CallRecorder, PricingCatalog, SpeechUsage, TranscriptionUsage, Usage};
use tollgate_core::{BusinessId, CallerIdentity, RequestMeta, best_effort};
use tollgate_store::{CallStatus, ModelPrice, Provider, Service};
use tollgate_telemetry::metrics;
use tollgate_upstream::{
    DispatchError, DispatchFailure, Dispatcher, ForwardOptions, StreamEnd, TeeOutcome, UpstreamClient, spawn_tee,
};

use crate::AudioError;
use crate::frame::{self, Frame, FrameCodec, MessageType};
use crate::protocol::{RecognitionParams, RecognitionResult, SpeechRequest, SynthesisParams, TranscriptionForm, wav_duration_ms};
use crate::stream::audio_payloads;

const SYNTHESIS_PATH: &str = "tts";
const RECOGNITION_PATH: &str = "asr";
const FRAME_CONTENT_TYPE: &str = "application/octet-stream";

pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// Audio streamed back from a synthesis call
pub struct SpeechReply {
    pub business_id: BusinessId,
    pub content_type: &'static str,
    pub body: ReplyStream,
}

impl std::fmt::Debug for SpeechReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechReply")
            .field("business_id", &self.business_id)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Text recognized from an uploaded file
#[derive(Debug)]
pub struct TranscriptionReply {
    pub business_id: BusinessId,
    pub text: String,
    pub response_format: Option<String>,
}

pub struct AudioPipeline {
    dispatcher: Dispatcher,
    client: UpstreamClient,
    catalog: Arc<PricingCatalog>,
    recorder: CallRecorder,
    options: ForwardOptions,
}

impl AudioPipeline {
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

    /// Handle one `POST /v1/audio/speech` body
    pub async fn speech(&self, caller: CallerIdentity, meta: RequestMeta, raw: Bytes) -> Result<SpeechReply, AudioError> {
        let request: SpeechRequest = serde_json::from_slice(&raw)
            .map_err(|e| AudioError::InvalidRequest(format!("invalid speech request: {e}")))?;
        if request.input.is_empty() {
            return Err(AudioError::InvalidRequest("input must not be empty".to_owned()));
        }

        let price = self.price(Service::TextToSpeech, &request.model)?;
        let params = serde_json::to_vec(&SynthesisParams::from(&request))
            .map_err(|e| AudioError::InvalidRequest(format!("invalid speech request: {e}")))?;
        let payload = Frame::client_request(params)
            .to_bytes()
            .map_err(|e| AudioError::InvalidRequest(e.to_string()))?;

        let mut ctx = BillingContext::new(caller, meta, price);
        ctx.request_body = String::from_utf8_lossy(&raw).into_owned();
        let usage = SpeechUsage {
            utf8_bytes: u64::try_from(request.input.len()).unwrap_or(u64::MAX),
        };

        let started = Instant::now();
        let open_timeout = self.options.request_timeout;

        let result = self
            .dispatcher
            .dispatch(
                Provider::Speech,
                |attempt, upstream_id, e: &DispatchError| {
                    metrics::record_upstream_failure(Provider::Speech.as_str(), e.is_retryable());
                    ctx.record_upstream_error(attempt, upstream_id, e.to_string());
                },
                |upstream| {
                    let request = self
                        .client
                        .post(&upstream, SYNTHESIS_PATH)
                        .header(CONTENT_TYPE, FRAME_CONTENT_TYPE)
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
                metrics::record_call(Service::TextToSpeech.as_str(), "failed", started);
                return Err(self.fail(ctx, Some(Usage::Speech(usage)), failure).await);
            }
        };

        ctx.set_upstream(dispatched.upstream.id);
        self.recorder.begin(&ctx).await;

        let business_id = ctx.business_id();
        let attempt = dispatched.attempt;
        let recorder = self.recorder.clone();
        let charge_on_error = self.options.charge_on_upstream_error;

        let body = spawn_tee(
            audio_payloads(dispatched.value.bytes_stream()),
            self.options.stream_timeout,
            move |outcome| async move {
                let label = finish_speech(&mut ctx, usage, &outcome, attempt, charge_on_error);
                best_effort::log_failure("record call", recorder.finish(&ctx).await);
                metrics::record_call(Service::TextToSpeech.as_str(), label, started);
            },
        );

        Ok(SpeechReply {
            business_id,
            content_type: request.content_type(),
            body: Box::pin(body),
        })
    }

    /// Handle one parsed `POST /v1/audio/transcriptions` form
    pub async fn transcribe(
        &self,
        caller: CallerIdentity,
        meta: RequestMeta,
        form: TranscriptionForm,
    ) -> Result<TranscriptionReply, AudioError> {
        if form.model.is_empty() {
            return Err(AudioError::InvalidRequest("model is required".to_owned()));
        }
        if form.audio.is_empty() {
            return Err(AudioError::InvalidRequest("file must not be empty".to_owned()));
        }

        let price = self.price(Service::SpeechToText, &form.model)?;
        let params = serde_json::to_vec(&RecognitionParams::from(&form))
            .map_err(|e| AudioError::InvalidRequest(format!("invalid transcription request: {e}")))?;

        let mut payload = BytesMut::new();
        FrameCodec
            .encode(Frame::client_request(params.clone()), &mut payload)
            .and_then(|()| FrameCodec.encode(Frame::audio_request(form.audio.clone(), true), &mut payload))
            .map_err(|e| AudioError::InvalidRequest(e.to_string()))?;
        let payload = payload.freeze();

        let mut ctx = BillingContext::new(caller, meta, price);
        ctx.request_body = String::from_utf8_lossy(&params).into_owned();
        let header_duration = wav_duration_ms(&form.audio);

        let started = Instant::now();
        let timeout = self.options.request_timeout;

        let result = self
            .dispatcher
            .dispatch(
                Provider::Speech,
                |attempt, upstream_id, e: &DispatchError| {
                    metrics::record_upstream_failure(Provider::Speech.as_str(), e.is_retryable());
                    ctx.record_upstream_error(attempt, upstream_id, e.to_string());
                },
                |upstream| {
                    let request = self
                        .client
                        .post(&upstream, RECOGNITION_PATH)
                        .timeout(timeout)
                        .header(CONTENT_TYPE, FRAME_CONTENT_TYPE)
                        .body(payload.clone());
                    async move {
                        let response = self.client.send(request).await?;
                        let body = response.bytes().await?;
                        recognition_result(&body)
                    }
                },
            )
            .await;

        let estimated = header_duration.map(|duration_ms| Usage::Transcription(TranscriptionUsage { duration_ms }));
        let dispatched = match result {
            Ok(dispatched) => dispatched,
            Err(failure) => {
                metrics::record_call(Service::SpeechToText.as_str(), "failed", started);
                return Err(self.fail(ctx, estimated, failure).await);
            }
        };

        ctx.set_upstream(dispatched.upstream.id);
        let (raw_result, result) = dispatched.value;
        ctx.response_body = String::from_utf8_lossy(&raw_result).into_owned();
        ctx.response_text.clone_from(&result.text);

        match result.duration_ms.or(header_duration) {
            Some(duration_ms) => ctx.set_usage(Usage::Transcription(TranscriptionUsage { duration_ms })),
            None => ctx.record_internal_error("audio duration unknown, billing zero usage"),
        }

        ctx.finish(CallStatus::Succeeded);
        best_effort::log_failure("record call", self.recorder.finish(&ctx).await);
        metrics::record_call(Service::SpeechToText.as_str(), "succeeded", started);

        Ok(TranscriptionReply {
            business_id: ctx.business_id(),
            text: result.text,
            response_format: form.response_format,
        })
    }

    fn price(&self, service: Service, model: &str) -> Result<ModelPrice, BillingError> {
        self.catalog
            .price(service, model)
            .ok_or_else(|| BillingError::UnknownModel {
                service,
                model: model.to_owned(),
            })
    }

    /// Record a call whose dispatch failed and build the caller's error
    async fn fail(&self, mut ctx: BillingContext, estimated: Option<Usage>, failure: DispatchFailure) -> AudioError {
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
            if self.options.charge_on_upstream_error
                && let Some(usage) = estimated
            {
                ctx.set_usage(usage);
            }
        }

        ctx.finish(CallStatus::Failed);
        best_effort::log_failure("record call", self.recorder.finish(&ctx).await);

        AudioError::Dispatch {
            business_id: ctx.business_id(),
            source: failure.error,
        }
    }
}

impl std::fmt::Debug for AudioPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPipeline")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Pull the recognition result out of a buffered frame response
fn recognition_result(body: &Bytes) -> Result<(Bytes, RecognitionResult), DispatchError> {
    let frames = frame::decode_all(body).map_err(|e| DispatchError::Protocol(e.to_string()))?;

    for frame in frames {
        match frame.message_type {
            MessageType::Error => {
                let message = frame
                    .into_remote_error()
                    .map_or_else(|| "error frame without code".to_owned(), |e| e.to_string());
                return Err(DispatchError::Protocol(message));
            }
            MessageType::FullServerResponse => {
                let result = serde_json::from_slice(&frame.payload)
                    .map_err(|e| DispatchError::Protocol(format!("unparseable recognition result: {e}")))?;
                return Ok((frame.payload, result));
            }
            _ => {}
        }
    }

    Err(DispatchError::Protocol("response carried no recognition result".to_owned()))
}

/// Settle a drained synthesis stream; returns the outcome label
fn finish_speech(
    ctx: &mut BillingContext,
    usage: SpeechUsage,
    outcome: &TeeOutcome,
    attempt: u32,
    charge_on_error: bool,
) -> &'static str {
    ctx.response_body = format!("{} bytes of audio", outcome.body.len());

    let upstream_id = ctx.upstream_id();
    let (status, label) = match &outcome.end {
        StreamEnd::Completed => (CallStatus::Succeeded, "succeeded"),
        StreamEnd::Failed(error) => {
            ctx.record_upstream_error(attempt, upstream_id, error.clone());
            (CallStatus::Failed, "failed")
        }
        StreamEnd::TimedOut => {
            ctx.record_upstream_error(attempt, upstream_id, "stream exceeded its deadline");
            ctx.mark_no_charge();
            (CallStatus::Failed, "timed_out")
        }
    };

    // audio already delivered is billed even when the stream broke later
    if status == CallStatus::Succeeded || outcome.chunks > 0 || charge_on_error {
        ctx.set_usage(Usage::Speech(usage));
    }

    ctx.finish(status);

    tracing::info!(
        business_id = %ctx.business_id(),
        chunks = outcome.chunks,
        audio_bytes = outcome.body.len(),
        client_connected = outcome.client_connected,
        outcome = label,
        "speech stream finished"
    );

    label
}
