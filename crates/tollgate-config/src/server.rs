use std::net::SocketAddr;

use secrecy::SecretString;
use serde::Deserialize;

/// HTTP listener configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind, overridable from the command line
    pub listen_address: Option<SocketAddr>,
    #[serde(default)]
    pub health: HealthConfig,
    /// Shared secret expected in `x-internal-secret` on `/internal/*` routes
    ///
    /// Internal routes are not mounted when unset.
    #[serde(default)]
    pub internal_secret: Option<SecretString>,
    /// Largest request body accepted on proxied routes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            health: HealthConfig::default(),
            internal_secret: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Health check endpoint configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_path(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

fn default_path() -> String {
    "/health".to_owned()
}

const fn default_max_body_bytes() -> usize {
    25 * 1024 * 1024
}
