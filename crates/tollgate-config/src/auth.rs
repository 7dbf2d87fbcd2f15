use std::time::Duration;

use serde::Deserialize;

/// API key verification settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Literal prefix every issued key starts with, before the `-`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// TTL for cached key lookups
    #[serde(default = "default_key_cache_ttl")]
    pub key_cache_ttl_seconds: u64,

    /// How often the membership filter is rebuilt from the store
    #[serde(default = "default_filter_rebuild_interval")]
    pub filter_rebuild_interval_seconds: u64,

    /// Lower bound on filter capacity regardless of active key count
    #[serde(default = "default_filter_min_capacity")]
    pub filter_min_capacity: usize,

    /// Attempts per rebuild before giving up and keeping the old filter
    #[serde(default = "default_filter_rebuild_attempts")]
    pub filter_rebuild_attempts: u32,

    /// Paths that skip authentication
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

impl AuthConfig {
    pub const fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_seconds)
    }

    pub const fn filter_rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.filter_rebuild_interval_seconds)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            key_cache_ttl_seconds: default_key_cache_ttl(),
            filter_rebuild_interval_seconds: default_filter_rebuild_interval(),
            filter_min_capacity: default_filter_min_capacity(),
            filter_rebuild_attempts: default_filter_rebuild_attempts(),
            public_paths: default_public_paths(),
        }
    }
}

fn default_key_prefix() -> String {
    "sk".to_owned()
}

const fn default_key_cache_ttl() -> u64 {
    300
}

const fn default_filter_rebuild_interval() -> u64 {
    600
}

const fn default_filter_min_capacity() -> usize {
    10_000
}

const fn default_filter_rebuild_attempts() -> u32 {
    3
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".to_owned()]
}
