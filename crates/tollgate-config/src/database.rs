use secrecy::SecretString;
use serde::Deserialize;

/// Durable store connection settings
///
/// When the section is absent the gateway runs against the in-memory store.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: SecretString,
    /// Upper bound on pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Apply bundled migrations at startup
    #[serde(default)]
    pub run_migrations: bool,
}

const fn default_max_connections() -> u32 {
    10
}
