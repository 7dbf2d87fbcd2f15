use http::StatusCode;
use rust_decimal::Decimal;
use thiserror::Error;
use tollgate_core::{BusinessId, HttpError};
use tollgate_store::{Service, StoreError};

/// Errors raised while pricing or recording a call
#[derive(Debug, Error)]
pub enum BillingError {
    /// No active price exists for the requested model
    #[error("no price for {service} model {model}")]
    UnknownModel { service: Service, model: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The finished call could not be written to the ledger
    #[error("failed to record call {business_id} (amount {amount}): {source}")]
    Record {
        business_id: BusinessId,
        amount: Decimal,
        #[source]
        source: StoreError,
    },
}

impl HttpError for BillingError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownModel { .. } => StatusCode::BAD_REQUEST,
            Self::Store(_) | Self::Record { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::UnknownModel { .. } => "invalid_request_error",
            Self::Store(_) | Self::Record { .. } => "internal_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::UnknownModel { model, .. } => format!("model '{model}' is not available"),
            Self::Store(_) | Self::Record { .. } => "internal error".to_owned(),
        }
    }
}
