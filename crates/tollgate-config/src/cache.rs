use serde::Deserialize;
use url::Url;

/// Shared key/value cache configuration
///
/// Without this section each gateway instance keeps an in-process cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Redis/Valkey connection URL
    pub url: Url,
    /// Prefix prepended to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "tollgate".to_owned()
}

/// Entry bound of the in-process cache used when no `[cache]` section is configured
pub const DEFAULT_LOCAL_CAPACITY: u64 = 100_000;
