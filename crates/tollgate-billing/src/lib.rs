//! Call metering, cost model and wallet settlement

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod context;
pub mod cost;
mod error;
mod pricing;
mod recorder;
pub mod settlement;

pub use context::{BillingContext, ChatUsage, Metered, SpeechUsage, TranscriptionUsage, Usage};
pub use error::BillingError;
pub use pricing::PricingCatalog;
pub use recorder::CallRecorder;
pub use settlement::{BatchReport, SettlementEngine};
