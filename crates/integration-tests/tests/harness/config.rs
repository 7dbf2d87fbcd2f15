//! Programmatic configuration builder for integration tests

use std::net::SocketAddr;

use secrecy::SecretString;
use tollgate_config::Config;

pub const INTERNAL_SECRET: &str = "internal-test-secret";

/// Builder for constructing test configurations
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Minimal defaults: loopback listener, no settlement debounce and the
    /// internal endpoints enabled
    pub fn new() -> Self {
        let mut config = Config::default();
        config.server.listen_address = Some(SocketAddr::from(([127, 0, 0, 1], 0)));
        config.server.internal_secret = Some(SecretString::from(INTERNAL_SECRET));
        config.settlement.debounce_seconds = 0;
        config.upstream.request_timeout_seconds = 5;
        config.upstream.connect_timeout_seconds = 1;

        Self { config }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.config.upstream.max_attempts = attempts;
        self
    }

    /// Deadlines for opening an upstream call and for a whole stream
    pub fn with_timeouts(mut self, request_seconds: u64, stream_seconds: u64) -> Self {
        self.config.upstream.request_timeout_seconds = request_seconds;
        self.config.upstream.stream_timeout_seconds = stream_seconds;
        self
    }

    pub fn charging_upstream_errors(mut self) -> Self {
        self.config.billing.charge_on_upstream_error = true;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
