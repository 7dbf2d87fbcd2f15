//! Metric names and recording helpers
//!
//! Instruments come from the global meter, which is a no-op until
//! [`crate::init`] installs an exporting provider.

use std::sync::LazyLock;
use std::time::Instant;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram};

// Pipeline metric names
pub const CALL_DURATION: &str = "tollgate.call.duration";
pub const CALL_COUNT: &str = "tollgate.call.count";
pub const UPSTREAM_FAILURES: &str = "tollgate.upstream.failures";

// Settlement metric names
pub const SETTLEMENT_ROWS: &str = "tollgate.settlement.rows";
pub const SETTLEMENT_RESETS: &str = "tollgate.settlement.resets";

// Auth metric names
pub const AUTH_REJECTIONS: &str = "tollgate.auth.rejections";

struct Instruments {
    call_duration: Histogram<f64>,
    call_count: Counter<u64>,
    upstream_failures: Counter<u64>,
    settlement_rows: Counter<u64>,
    settlement_resets: Counter<u64>,
    auth_rejections: Counter<u64>,
}

static INSTRUMENTS: LazyLock<Instruments> = LazyLock::new(|| {
    let meter = opentelemetry::global::meter("tollgate");
    Instruments {
        call_duration: meter
            .f64_histogram(CALL_DURATION)
            .with_unit("s")
            .with_description("Proxied call duration")
            .build(),
        call_count: meter.u64_counter(CALL_COUNT).build(),
        upstream_failures: meter.u64_counter(UPSTREAM_FAILURES).build(),
        settlement_rows: meter.u64_counter(SETTLEMENT_ROWS).build(),
        settlement_resets: meter.u64_counter(SETTLEMENT_RESETS).build(),
        auth_rejections: meter.u64_counter(AUTH_REJECTIONS).build(),
    }
});

/// Record a finished proxied call
pub fn record_call(service: &'static str, outcome: &'static str, start: Instant) {
    let attributes = [KeyValue::new("service", service), KeyValue::new("outcome", outcome)];
    INSTRUMENTS
        .call_duration
        .record(start.elapsed().as_secs_f64(), &attributes);
    INSTRUMENTS.call_count.add(1, &attributes);
}

/// Record one failed upstream attempt
pub fn record_upstream_failure(provider: &'static str, retryable: bool) {
    INSTRUMENTS.upstream_failures.add(
        1,
        &[KeyValue::new("provider", provider), KeyValue::new("retryable", retryable)],
    );
}

/// Record the row outcomes of one settlement batch
pub fn record_settlement(completed: u64, failed: u64) {
    INSTRUMENTS
        .settlement_rows
        .add(completed, &[KeyValue::new("outcome", "completed")]);
    INSTRUMENTS
        .settlement_rows
        .add(failed, &[KeyValue::new("outcome", "failed")]);
}

/// Record failed rows moved back to pending
pub fn record_settlement_reset(rows: u64) {
    INSTRUMENTS
        .settlement_resets
        .add(rows, &[KeyValue::new("from", "failed")]);
}

/// Record abandoned processing rows moved back to pending
pub fn record_stale_reclaim(rows: u64) {
    INSTRUMENTS
        .settlement_resets
        .add(rows, &[KeyValue::new("from", "processing")]);
}

pub fn record_auth_rejection(reason: &'static str) {
    INSTRUMENTS
        .auth_rejections
        .add(1, &[KeyValue::new("reason", reason)]);
}
