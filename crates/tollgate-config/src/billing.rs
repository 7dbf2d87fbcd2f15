use std::time::Duration;

use serde::Deserialize;

/// Metering and pricing settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BillingConfig {
    /// How often the price table is reloaded from the store
    #[serde(default = "default_pricing_refresh_interval")]
    pub pricing_refresh_interval_seconds: u64,
    /// Bill known partial usage when the upstream answers with an error
    ///
    /// Off by default: an upstream error response is recorded but costs nothing.
    #[serde(default)]
    pub charge_on_upstream_error: bool,
}

impl BillingConfig {
    pub const fn pricing_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.pricing_refresh_interval_seconds)
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            pricing_refresh_interval_seconds: default_pricing_refresh_interval(),
            charge_on_upstream_error: false,
        }
    }
}

const fn default_pricing_refresh_interval() -> u64 {
    300
}

/// Background settlement job settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettlementConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Period of the batch settlement tick
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    /// Maximum pending rows claimed per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Rows younger than this are left for a later tick
    #[serde(default = "default_debounce")]
    pub debounce_seconds: u64,
    /// Period of the job that returns failed rows to pending
    #[serde(default = "default_failed_reset_interval")]
    pub failed_reset_interval_seconds: u64,
    /// Age after which a `PROCESSING` ledger row or a `STARTED` call record
    /// is treated as abandoned by a crashed process
    ///
    /// Must exceed the upstream stream timeout.
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,
    /// Period of the job that recovers abandoned rows and records
    #[serde(default = "default_stale_check_interval")]
    pub stale_check_interval_seconds: u64,
}

impl SettlementConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub const fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_seconds)
    }

    pub const fn failed_reset_interval(&self) -> Duration {
        Duration::from_secs(self.failed_reset_interval_seconds)
    }

    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }

    pub const fn stale_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_check_interval_seconds)
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_seconds: default_interval(),
            batch_size: default_batch_size(),
            debounce_seconds: default_debounce(),
            failed_reset_interval_seconds: default_failed_reset_interval(),
            stale_after_seconds: default_stale_after(),
            stale_check_interval_seconds: default_stale_check_interval(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

const fn default_interval() -> u64 {
    60
}

const fn default_batch_size() -> u32 {
    500
}

const fn default_debounce() -> u64 {
    10
}

const fn default_failed_reset_interval() -> u64 {
    1800
}

const fn default_stale_after() -> u64 {
    900
}

const fn default_stale_check_interval() -> u64 {
    300
}
