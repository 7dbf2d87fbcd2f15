use http::StatusCode;
use tollgate_core::HttpError;
use tollgate_store::StoreError;

/// Authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No bearer credential on the request
    #[error("missing API key")]
    MissingKey,

    /// Credential does not have the `<prefix>-<suffix>` shape
    #[error("malformed API key")]
    MalformedKey,

    /// Membership filter reports the key as definitely absent
    #[error("API key rejected by filter")]
    FilterRejected,

    /// Filter passed but no active key has this hash
    #[error("API key does not exist")]
    KeyNotFound,

    /// Store unreachable during lookup or rebuild
    #[error("key store error: {0}")]
    Store(#[from] StoreError),
}

impl HttpError for AuthError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Store(_) => "internal_error",
            _ => "authentication_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::MissingKey => "missing API key".to_owned(),
            Self::MalformedKey | Self::FilterRejected | Self::KeyNotFound => "invalid API key".to_owned(),
            Self::Store(_) => "key verification is temporarily unavailable".to_owned(),
        }
    }
}
