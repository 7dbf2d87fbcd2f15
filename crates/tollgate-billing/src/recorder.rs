use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tollgate_store::{CallStore, StoreError};

use crate::{BillingContext, BillingError};

/// Persists billing contexts for the settlement job to pick up
///
/// Callers have already served the request, so a failed finish is logged by
/// them and never turned into a response.
#[derive(Clone)]
pub struct CallRecorder {
    store: Arc<dyn CallStore>,
}

impl CallRecorder {
    pub fn new(store: Arc<dyn CallStore>) -> Self {
        Self { store }
    }

    /// Write the `STARTED` call summary of a streaming call
    pub async fn begin(&self, ctx: &BillingContext) {
        if let Err(e) = self.store.begin_call(&ctx.to_call_record()).await {
            tracing::error!(
                error = %e,
                business_id = %ctx.business_id(),
                "failed to record call start"
            );
        }
    }

    /// Write the ledger row, detail and final summary of a finished call
    ///
    /// The error names the business id and amount so the row can be rebuilt
    /// from logs.
    pub async fn finish(&self, ctx: &BillingContext) -> Result<(), BillingError> {
        let outcome = ctx.to_outcome();
        let amount = outcome.transaction.amount;

        self.store
            .finish_call(&outcome)
            .await
            .map_err(|source| BillingError::Record {
                business_id: ctx.business_id(),
                amount,
                source,
            })?;

        tracing::debug!(
            business_id = %ctx.business_id(),
            amount = %amount,
            status = %outcome.transaction.status,
            "call recorded"
        );
        Ok(())
    }

    /// Close `STARTED` records older than `stale_after` as `FAILED`
    ///
    /// These are streams whose process died before the final write; their
    /// usage is lost and the ids are logged for manual review.
    pub async fn fail_stale(&self, stale_after: Duration) -> Result<usize, StoreError> {
        let age = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        let failed = self.store.fail_stale_calls(Utc::now() - age).await?;

        for business_id in &failed {
            tracing::error!(%business_id, "closed abandoned streaming call without a ledger row");
        }

        Ok(failed.len())
    }
}

impl std::fmt::Debug for CallRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRecorder").finish_non_exhaustive()
    }
}
