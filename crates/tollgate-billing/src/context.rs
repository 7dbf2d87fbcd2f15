//! Per-request billing state and cost model
//!
//! A [`BillingContext`] is created once per inbound call, owned by the
//! request task while the call runs, and turned into the three durable
//! records when it finishes. Metering differs per service and is modelled as
//! the closed [`Usage`] enum; everything else is shared.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tollgate_core::{BusinessId, CallerIdentity, RequestMeta};
use tollgate_store::{
    ApiCallDetail, ApiCallRecord, CallOutcome, CallStatus, ModelPrice, Provider, Service, Transaction,
    TransactionKind, TransactionStatus, UpstreamFailure,
};

use crate::cost::round_cost;

const PER_MILLION: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);
const MILLIS_PER_HOUR: Decimal = Decimal::from_parts(3_600_000, 0, 0, false, 0);

/// Capability shared by every metering variant
pub trait Metered {
    /// Exact, unrounded cost at `price`
    fn exact_cost(&self, price: &ModelPrice) -> Decimal;

    /// Structured description of the billed quantities
    fn summary(&self, price: &ModelPrice) -> serde_json::Value;
}

/// Token counts of one chat completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Metered for ChatUsage {
    fn exact_cost(&self, price: &ModelPrice) -> Decimal {
        (Decimal::from(self.input_tokens) * price.input_price + Decimal::from(self.output_tokens) * price.output_price)
            / PER_MILLION
    }

    fn summary(&self, price: &ModelPrice) -> serde_json::Value {
        json!({
            "input_tokens": self.input_tokens,
            "output_tokens": self.output_tokens,
            "input_price_per_million": price.input_price,
            "output_price_per_million": price.output_price,
        })
    }
}

/// Speech synthesis, billed on the UTF-8 length of the input text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeechUsage {
    pub utf8_bytes: u64,
}

impl Metered for SpeechUsage {
    fn exact_cost(&self, price: &ModelPrice) -> Decimal {
        Decimal::from(self.utf8_bytes) * price.input_price / PER_MILLION
    }

    fn summary(&self, price: &ModelPrice) -> serde_json::Value {
        json!({
            "utf8_bytes": self.utf8_bytes,
            "price_per_million_bytes": price.input_price,
        })
    }
}

/// Speech recognition, billed on audio duration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranscriptionUsage {
    pub duration_ms: u64,
}

impl Metered for TranscriptionUsage {
    fn exact_cost(&self, price: &ModelPrice) -> Decimal {
        Decimal::from(self.duration_ms) * price.input_price / MILLIS_PER_HOUR
    }

    fn summary(&self, price: &ModelPrice) -> serde_json::Value {
        json!({
            "duration_ms": self.duration_ms,
            "price_per_hour": price.input_price,
        })
    }
}

/// Metering variant of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Chat(ChatUsage),
    Speech(SpeechUsage),
    Transcription(TranscriptionUsage),
}

impl Usage {
    /// Zero usage for a service
    pub const fn empty(service: Service) -> Self {
        match service {
            Service::ChatCompletion => Self::Chat(ChatUsage {
                input_tokens: 0,
                output_tokens: 0,
            }),
            Service::TextToSpeech => Self::Speech(SpeechUsage { utf8_bytes: 0 }),
            Service::SpeechToText => Self::Transcription(TranscriptionUsage { duration_ms: 0 }),
        }
    }

    pub const fn service(&self) -> Service {
        match self {
            Self::Chat(_) => Service::ChatCompletion,
            Self::Speech(_) => Service::TextToSpeech,
            Self::Transcription(_) => Service::SpeechToText,
        }
    }

    /// Vendor family serving this kind of call
    pub const fn provider(&self) -> Provider {
        match self {
            Self::Chat(_) => Provider::OpenAi,
            Self::Speech(_) | Self::Transcription(_) => Provider::Speech,
        }
    }

    fn metered(&self) -> &dyn Metered {
        match self {
            Self::Chat(usage) => usage,
            Self::Speech(usage) => usage,
            Self::Transcription(usage) => usage,
        }
    }
}

/// Billing state of one proxied call
#[derive(Debug, Clone)]
pub struct BillingContext {
    business_id: BusinessId,
    caller: CallerIdentity,
    meta: RequestMeta,
    model: String,
    /// Captured at creation; later catalog reloads do not apply
    price: ModelPrice,
    upstream_id: Option<i64>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: CallStatus,
    pub request_body: String,
    pub response_body: String,
    pub response_text: String,
    usage: Usage,
    no_charge: bool,
    internal_errors: Vec<String>,
    upstream_errors: Vec<UpstreamFailure>,
}

impl BillingContext {
    /// Start billing a call with a fresh business id
    pub fn new(caller: CallerIdentity, meta: RequestMeta, price: ModelPrice) -> Self {
        Self {
            business_id: BusinessId::generate(),
            caller,
            meta,
            model: price.model.clone(),
            usage: Usage::empty(price.service),
            price,
            upstream_id: None,
            start_time: Utc::now(),
            end_time: None,
            status: CallStatus::Started,
            request_body: String::new(),
            response_body: String::new(),
            response_text: String::new(),
            no_charge: false,
            internal_errors: Vec::new(),
            upstream_errors: Vec::new(),
        }
    }

    pub const fn business_id(&self) -> BusinessId {
        self.business_id
    }

    pub const fn caller(&self) -> &CallerIdentity {
        &self.caller
    }

    pub const fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub const fn service(&self) -> Service {
        self.usage.service()
    }

    pub const fn provider(&self) -> Provider {
        self.usage.provider()
    }

    pub const fn upstream_id(&self) -> Option<i64> {
        self.upstream_id
    }

    pub const fn set_upstream(&mut self, upstream_id: i64) {
        self.upstream_id = Some(upstream_id);
    }

    pub const fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Replace the metered quantities
    ///
    /// A usage of another service is ignored and reported as an internal error.
    pub fn set_usage(&mut self, usage: Usage) {
        if usage.service() == self.service() {
            self.usage = usage;
        } else {
            self.record_internal_error(format!(
                "usage for {} reported on a {} call",
                usage.service(),
                self.service()
            ));
        }
    }

    pub const fn no_charge(&self) -> bool {
        self.no_charge
    }

    /// Waive the cost of a call that failed for system or network reasons
    pub const fn mark_no_charge(&mut self) {
        self.no_charge = true;
    }

    pub fn record_internal_error(&mut self, message: impl Into<String>) {
        self.internal_errors.push(message.into());
    }

    /// Record the failure of one upstream attempt before moving on
    pub fn record_upstream_error(&mut self, attempt: u32, upstream_id: Option<i64>, message: impl Into<String>) {
        self.upstream_errors.push(UpstreamFailure {
            attempt,
            upstream_id,
            message: message.into(),
        });
    }

    pub fn internal_errors(&self) -> &[String] {
        &self.internal_errors
    }

    pub fn upstream_errors(&self) -> &[UpstreamFailure] {
        &self.upstream_errors
    }

    pub const fn status(&self) -> CallStatus {
        self.status
    }

    pub const fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub const fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Stamp the end time and final status; later calls keep the first stamp
    pub fn finish(&mut self, status: CallStatus) {
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
            self.status = status;
        }
    }

    /// Elapsed milliseconds, zero until finished
    pub fn duration_ms(&self) -> i64 {
        self.end_time
            .map_or(0, |end| (end - self.start_time).num_milliseconds().max(0))
    }

    /// Ledger amount for this call
    ///
    /// Pure over the usage, the captured price and the no-charge flag.
    pub fn calculate_cost(&self) -> Decimal {
        if self.no_charge {
            return Decimal::ZERO;
        }
        round_cost(self.usage.metered().exact_cost(&self.price))
    }

    pub fn billing_summary(&self) -> serde_json::Value {
        let mut summary = self.usage.metered().summary(&self.price);
        if let Some(fields) = summary.as_object_mut() {
            fields.insert("service".to_owned(), json!(self.service().as_str()));
            fields.insert("model".to_owned(), json!(self.model));
            fields.insert("cost".to_owned(), json!(self.calculate_cost()));
            fields.insert("no_charge".to_owned(), json!(self.no_charge));
        }
        summary
    }

    /// Ledger row; waived calls need no settlement and start `COMPLETED`
    pub fn to_transaction(&self) -> Transaction {
        let at = self.end_time.unwrap_or(self.start_time);
        Transaction {
            business_id: self.business_id,
            kind: TransactionKind::ApiCall,
            wallet_id: self.caller.wallet_id,
            user_id: self.caller.user_id,
            api_key_id: self.caller.api_key_id,
            amount: self.calculate_cost(),
            status: if self.no_charge {
                TransactionStatus::Completed
            } else {
                TransactionStatus::Pending
            },
            created_at: at,
            updated_at: at,
        }
    }

    pub fn to_call_record(&self) -> ApiCallRecord {
        ApiCallRecord {
            business_id: self.business_id,
            user_id: self.caller.user_id,
            wallet_id: self.caller.wallet_id,
            api_key_id: self.caller.api_key_id,
            provider: self.provider(),
            service: self.service(),
            model: Some(self.model.clone()),
            upstream_id: self.upstream_id,
            status: self.status,
            client_ip: self.meta.client_ip.clone(),
            user_agent: self.meta.user_agent.clone(),
            external_trace_id: self.meta.external_trace_id.clone(),
            started_at: self.start_time,
            finished_at: self.end_time,
            duration_ms: self.duration_ms(),
            cost: self.calculate_cost(),
            no_charge: self.no_charge,
        }
    }

    pub fn to_call_detail(&self) -> ApiCallDetail {
        ApiCallDetail {
            business_id: self.business_id,
            request_body: self.request_body.clone(),
            response_body: self.response_body.clone(),
            response_text: self.response_text.clone(),
            billing_summary: self.billing_summary(),
            internal_errors: self.internal_errors.clone(),
            upstream_errors: self.upstream_errors.clone(),
        }
    }

    /// All three records, for one atomic write
    pub fn to_outcome(&self) -> CallOutcome {
        CallOutcome {
            transaction: self.to_transaction(),
            record: self.to_call_record(),
            detail: self.to_call_detail(),
        }
    }
}
