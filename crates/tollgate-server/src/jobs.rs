use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tollgate_auth::KeyVerifier;
use tollgate_billing::{CallRecorder, PricingCatalog, SettlementEngine};
use tollgate_store::CatalogStore;
use tollgate_telemetry::metrics;
use tollgate_upstream::UpstreamRegistry;

use crate::scheduler::Scheduler;

/// Periods of the background jobs
#[derive(Debug, Clone, Copy)]
pub struct JobPeriods {
    pub upstream_reload: Duration,
    pub pricing_reload: Duration,
    pub filter_rebuild: Duration,
    /// Settlement is disabled when `None`
    pub settlement: Option<SettlementPeriods>,
    pub stale_recovery: StaleRecovery,
}

/// Recovery of work abandoned by a crashed process
#[derive(Debug, Clone, Copy)]
pub struct StaleRecovery {
    pub period: Duration,
    /// Age past which a `PROCESSING` row or `STARTED` record is abandoned
    pub stale_after: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct SettlementPeriods {
    pub batch: Duration,
    pub failed_reset: Duration,
}

/// Everything the background jobs operate on
#[derive(Clone)]
pub struct BackgroundJobs {
    pub(crate) registry: Arc<UpstreamRegistry>,
    pub(crate) catalog: Arc<PricingCatalog>,
    pub(crate) catalog_store: Arc<dyn CatalogStore>,
    pub(crate) verifier: Arc<KeyVerifier>,
    pub(crate) settlement: Arc<SettlementEngine>,
    pub(crate) recorder: CallRecorder,
    pub(crate) periods: JobPeriods,
}

impl BackgroundJobs {
    /// Spawn every job; they stop when `shutdown` is cancelled
    pub fn start(&self, shutdown: CancellationToken) -> Scheduler {
        let mut scheduler = Scheduler::new(shutdown);

        let registry = self.registry.clone();
        let store = self.catalog_store.clone();
        scheduler.every("upstream_reload", self.periods.upstream_reload, move || {
            let registry = registry.clone();
            let store = store.clone();
            async move {
                match registry.reload(store.as_ref()).await {
                    Ok(count) => tracing::debug!(endpoints = count, "upstream registry reloaded"),
                    Err(e) => tracing::warn!(error = %e, "upstream reload failed, keeping previous table"),
                }
            }
        });

        let catalog = self.catalog.clone();
        let store = self.catalog_store.clone();
        scheduler.every("pricing_reload", self.periods.pricing_reload, move || {
            let catalog = catalog.clone();
            let store = store.clone();
            async move {
                match catalog.reload(store.as_ref()).await {
                    Ok(count) => tracing::debug!(models = count, "pricing catalog reloaded"),
                    Err(e) => tracing::warn!(error = %e, "pricing reload failed, keeping previous table"),
                }
            }
        });

        let verifier = self.verifier.clone();
        scheduler.every("filter_rebuild", self.periods.filter_rebuild, move || {
            let verifier = verifier.clone();
            async move {
                match verifier.rebuild_filter().await {
                    Ok(keys) => tracing::debug!(keys, "api key filter job finished"),
                    Err(e) => tracing::warn!(error = %e, "api key filter kept its previous contents"),
                }
            }
        });

        if let Some(periods) = self.periods.settlement {
            let engine = self.settlement.clone();
            scheduler.every("settlement_batch", periods.batch, move || {
                let engine = engine.clone();
                async move { settle_batch(&engine).await }
            });

            let engine = self.settlement.clone();
            scheduler.every("settlement_failed_reset", periods.failed_reset, move || {
                let engine = engine.clone();
                async move {
                    match engine.reset_failed().await {
                        Ok(rows) => metrics::record_settlement_reset(rows),
                        Err(e) => tracing::error!(error = %e, "failed to reset failed settlement rows"),
                    }
                }
            });
        }

        let engine = self.settlement.clone();
        let recorder = self.recorder.clone();
        let stale = self.periods.stale_recovery;
        scheduler.every("stale_recovery", stale.period, move || {
            let engine = engine.clone();
            let recorder = recorder.clone();
            async move { recover_stale(&engine, &recorder, stale.stale_after).await }
        });

        tracing::info!(jobs = scheduler.len(), "background jobs started");
        scheduler
    }
}

async fn settle_batch(engine: &SettlementEngine) {
    match engine.run_batch().await {
        Ok(report) if report.claimed == 0 => {}
        Ok(report) => metrics::record_settlement(report.completed_rows as u64, report.failed_rows as u64),
        Err(e) => tracing::error!(error = %e, "settlement batch could not claim rows"),
    }
}

async fn recover_stale(engine: &SettlementEngine, recorder: &CallRecorder, stale_after: Duration) {
    match engine.reclaim_stale(stale_after).await {
        Ok(rows) => metrics::record_stale_reclaim(rows as u64),
        Err(e) => tracing::error!(error = %e, "failed to reclaim stale processing rows"),
    }

    if let Err(e) = recorder.fail_stale(stale_after).await {
        tracing::error!(error = %e, "failed to close abandoned call records");
    }
}

impl std::fmt::Debug for BackgroundJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundJobs")
            .field("periods", &self.periods)
            .finish_non_exhaustive()
    }
}
