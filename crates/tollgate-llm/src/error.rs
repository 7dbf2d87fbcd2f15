use http::StatusCode;
use thiserror::Error;
use tollgate_billing::BillingError;
use tollgate_core::{BusinessId, HttpError};
use tollgate_upstream::DispatchError;

/// Errors returned by the chat completion pipeline
#[derive(Debug, Error)]
pub enum LlmError {
    /// Client sent a malformed or invalid request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Model is not priced or otherwise unusable
    #[error(transparent)]
    Billing(#[from] BillingError),

    /// Upstream exchange failed after the call was recorded
    #[error("dispatch failed for {business_id}: {source}")]
    Dispatch {
        business_id: BusinessId,
        source: DispatchError,
    },
}

impl LlmError {
    /// Business id of the recorded call, if one was created
    pub const fn business_id(&self) -> Option<BusinessId> {
        match self {
            Self::Dispatch { business_id, .. } => Some(*business_id),
            _ => None,
        }
    }
}

impl HttpError for LlmError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Billing(e) => e.status_code(),
            Self::Dispatch { source, .. } => source.status_code(),
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::Billing(e) => e.error_type(),
            Self::Dispatch { source, .. } => source.error_type(),
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::InvalidRequest(message) => message.clone(),
            Self::Billing(e) => e.client_message(),
            Self::Dispatch { source, .. } => source.client_message(),
        }
    }
}
