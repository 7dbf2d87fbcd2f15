use serde::Deserialize;
use url::Url;

/// Operational alert sink
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    /// Webhook receiving JSON alert payloads
    pub webhook_url: Url,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

const fn default_timeout() -> u64 {
    5
}
