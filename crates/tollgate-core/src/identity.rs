use serde::{Deserialize, Serialize};

/// Owner of a verified API key
///
/// Inserted into request extensions by the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub api_key_id: i64,
    pub user_id: i64,
    /// Wallet the key draws from
    pub wallet_id: i64,
}

/// Provenance captured from the inbound request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    /// Value of the caller's `x-trace-id`, echoed on the response
    pub external_trace_id: Option<String>,
}
