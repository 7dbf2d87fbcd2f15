#![allow(clippy::must_use_candidate)]

pub mod auth;
pub mod billing;
pub mod cache;
pub mod database;
mod env;
mod loader;
pub mod notify;
pub mod server;
pub mod telemetry;
pub mod upstream;

use serde::Deserialize;

pub use auth::*;
pub use billing::*;
pub use cache::*;
pub use database::*;
pub use env::ExpandError;
pub use notify::*;
pub use server::*;
pub use telemetry::TelemetryConfig;
pub use upstream::*;

/// Top-level gateway configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Durable store; in-memory when absent
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Shared cache; in-process when absent
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    /// Operational alert webhook
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}
