use http::StatusCode;
use thiserror::Error;
use tollgate_core::HttpError;
use tollgate_store::Provider;

/// Failures of one upstream exchange or of the whole dispatch
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No endpoint with positive weight is left after exclusions
    #[error("no available upstream for {0}")]
    NoAvailableUpstream(Provider),

    /// Connection could not be established (refused, DNS, TLS)
    #[error("connect failed: {0}")]
    Connect(String),

    /// Exchange exceeded its deadline
    #[error("upstream timed out")]
    Timeout,

    /// Upstream answered with a non-success status
    #[error("upstream returned {status}")]
    UpstreamStatus { status: StatusCode, body: String },

    /// Response was received but could not be read or understood
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl DispatchError {
    /// Whether another endpoint may succeed where this one failed
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NoAvailableUpstream(_) | Self::Connect(_) | Self::Timeout)
    }

    /// System or network failure the caller must not pay for
    pub const fn is_environment(&self) -> bool {
        self.is_retryable()
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Protocol(e.to_string())
        }
    }
}

impl HttpError for DispatchError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NoAvailableUpstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Connect(_) | Self::Protocol(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamStatus { status, .. } => *status,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::NoAvailableUpstream(_) => "service_unavailable",
            Self::Timeout => "timeout_error",
            Self::Connect(_) | Self::Protocol(_) | Self::UpstreamStatus { .. } => "upstream_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::NoAvailableUpstream(_) => "no upstream is currently available".to_owned(),
            Self::Timeout => "upstream timed out".to_owned(),
            Self::Connect(_) => "could not reach upstream".to_owned(),
            Self::Protocol(_) => "upstream returned an unreadable response".to_owned(),
            Self::UpstreamStatus { status, body } => {
                if body.is_empty() {
                    format!("upstream returned {status}")
                } else {
                    body.clone()
                }
            }
        }
    }
}
