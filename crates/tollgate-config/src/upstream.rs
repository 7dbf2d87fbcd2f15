use std::time::Duration;

use serde::Deserialize;

/// Upstream pool and dispatch settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// How often the endpoint table is reloaded from the store
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
    /// Total attempts per request, first try included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Deadline for a buffered (non-streaming) upstream call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Deadline for a whole streamed response; must exceed the request timeout
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_seconds: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

impl UpstreamConfig {
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub const fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_seconds)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: default_refresh_interval(),
            max_attempts: default_max_attempts(),
            request_timeout_seconds: default_request_timeout(),
            stream_timeout_seconds: default_stream_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

const fn default_refresh_interval() -> u64 {
    60
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_request_timeout() -> u64 {
    120
}

const fn default_stream_timeout() -> u64 {
    600
}

const fn default_connect_timeout() -> u64 {
    10
}
