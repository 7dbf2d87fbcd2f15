use std::path::Path;

use crate::Config;

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a placeholder cannot be
    /// expanded, TOML parsing fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if expansion, parsing, or validation fails
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let expanded = crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistent setting
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_upstream()?;
        self.validate_auth()?;
        self.validate_settlement()?;
        Ok(())
    }

    fn validate_upstream(&self) -> anyhow::Result<()> {
        let upstream = &self.upstream;

        if upstream.max_attempts == 0 {
            anyhow::bail!("upstream.max_attempts must be at least 1");
        }

        if upstream.request_timeout_seconds == 0 {
            anyhow::bail!("upstream.request_timeout_seconds must be greater than 0");
        }

        // A stuck stream must outlive any buffered call before it is forced closed
        if upstream.stream_timeout_seconds <= upstream.request_timeout_seconds {
            anyhow::bail!(
                "upstream.stream_timeout_seconds ({}) must be greater than upstream.request_timeout_seconds ({})",
                upstream.stream_timeout_seconds,
                upstream.request_timeout_seconds
            );
        }

        if upstream.refresh_interval_seconds == 0 {
            anyhow::bail!("upstream.refresh_interval_seconds must be greater than 0");
        }

        Ok(())
    }

    fn validate_auth(&self) -> anyhow::Result<()> {
        let auth = &self.auth;

        if auth.key_prefix.is_empty() || auth.key_prefix.contains('-') {
            anyhow::bail!("auth.key_prefix must be non-empty and must not contain '-'");
        }

        if auth.key_cache_ttl_seconds == 0 {
            anyhow::bail!("auth.key_cache_ttl_seconds must be greater than 0");
        }

        if auth.filter_rebuild_interval_seconds == 0 {
            anyhow::bail!("auth.filter_rebuild_interval_seconds must be greater than 0");
        }

        if auth.filter_rebuild_attempts == 0 {
            anyhow::bail!("auth.filter_rebuild_attempts must be at least 1");
        }

        Ok(())
    }

    fn validate_settlement(&self) -> anyhow::Result<()> {
        let settlement = &self.settlement;

        if settlement.stale_check_interval_seconds == 0 {
            anyhow::bail!("settlement.stale_check_interval_seconds must be greater than 0");
        }

        // A live stream keeps its call record STARTED until the stream timeout
        if settlement.stale_after_seconds <= self.upstream.stream_timeout_seconds {
            anyhow::bail!(
                "settlement.stale_after_seconds ({}) must be greater than upstream.stream_timeout_seconds ({})",
                settlement.stale_after_seconds,
                self.upstream.stream_timeout_seconds
            );
        }

        if !settlement.enabled {
            return Ok(());
        }

        if settlement.batch_size == 0 {
            anyhow::bail!("settlement.batch_size must be at least 1");
        }

        if settlement.interval_seconds == 0 || settlement.failed_reset_interval_seconds == 0 {
            anyhow::bail!("settlement intervals must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Config, telemetry::LogFormat};

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert!(config.database.is_none());
        assert!(config.cache.is_none());
        assert_eq!(config.auth.key_prefix, "sk");
        assert_eq!(config.upstream.max_attempts, 3);
        assert!(config.settlement.enabled);
        assert!(config.server.health.enabled);
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
            [server]
            listen_address = "127.0.0.1:9000"
            internal_secret = "s3cret"

            [database]
            url = "postgres://localhost/tollgate"
            max_connections = 4
            run_migrations = true

            [cache]
            url = "redis://localhost:6379"
            key_prefix = "tg"

            [auth]
            key_prefix = "tg"
            filter_min_capacity = 1000

            [upstream]
            request_timeout_seconds = 30
            stream_timeout_seconds = 300

            [billing]
            charge_on_upstream_error = true

            [settlement]
            batch_size = 100

            [notify]
            webhook_url = "https://hooks.example.com/ops"

            [telemetry]
            log_format = "json"
        "#;

        let config = Config::from_toml(raw).unwrap();
        assert_eq!(config.database.as_ref().unwrap().max_connections, 4);
        assert_eq!(config.cache.as_ref().unwrap().key_prefix, "tg");
        assert_eq!(config.auth.filter_min_capacity, 1000);
        assert_eq!(config.upstream.request_timeout_seconds, 30);
        assert!(config.billing.charge_on_upstream_error);
        assert_eq!(config.settlement.batch_size, 100);
        assert_eq!(config.telemetry.unwrap().log_format, LogFormat::Json);
    }

    #[test]
    fn stream_timeout_must_exceed_request_timeout() {
        let raw = r"
            [upstream]
            request_timeout_seconds = 60
            stream_timeout_seconds = 60
        ";

        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("stream_timeout_seconds"));
    }

    #[test]
    fn stale_window_must_outlive_streams() {
        let raw = r"
            [upstream]
            stream_timeout_seconds = 900

            [settlement]
            stale_after_seconds = 900
        ";

        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("stale_after_seconds"));
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = Config::from_toml("[upstream]\nmax_attempts = 0").unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn key_prefix_cannot_contain_separator() {
        let err = Config::from_toml("[auth]\nkey_prefix = \"a-b\"").unwrap_err();
        assert!(err.to_string().contains("key_prefix"));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(Config::from_toml("[upstream]\nretries = 2").is_err());
    }

    #[test]
    fn database_url_from_environment() {
        temp_env::with_var("TOLLGATE_TEST_DB", Some("postgres://env/db"), || {
            let config = Config::from_toml("[database]\nurl = \"{{ env.TOLLGATE_TEST_DB }}\"").unwrap();
            assert!(config.database.is_some());
        });
    }
}
