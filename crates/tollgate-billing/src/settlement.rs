//! Periodic batch settlement of pending ledger rows
//!
//! Each run claims a batch of `PENDING` rows (flipping them to `PROCESSING`
//! in the same store transaction), groups them by wallet and member, and
//! applies one conditional decrement per wallet. A wallet whose decrement
//! fails for any reason has only its own rows marked `FAILED`; the slower
//! reset timer moves those back to `PENDING`. Rows left in `PROCESSING` by a
//! run that never finished are returned to `PENDING` once they go stale.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tollgate_core::{Alert, BusinessId, Notifier};
use tollgate_store::{LedgerStore, StoreError, Transaction, TransactionKind, TransactionStatus, WalletSettlement};

/// Counts from one settlement run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub settled_wallets: usize,
    pub failed_wallets: usize,
    pub completed_rows: usize,
    pub failed_rows: usize,
}

/// Rows of one wallet within a batch
#[derive(Debug, Default)]
struct WalletGroup {
    total: Decimal,
    members: BTreeMap<i64, Decimal>,
    business_ids: Vec<BusinessId>,
}

impl WalletGroup {
    fn push(&mut self, tx: &Transaction) {
        self.total += tx.amount;
        *self.members.entry(tx.user_id).or_default() += tx.amount;
        self.business_ids.push(tx.business_id);
    }
}

fn group_by_wallet(rows: &[Transaction]) -> BTreeMap<i64, WalletGroup> {
    let mut groups: BTreeMap<i64, WalletGroup> = BTreeMap::new();
    for tx in rows {
        groups.entry(tx.wallet_id).or_default().push(tx);
    }
    groups
}

pub struct SettlementEngine {
    ledger: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    batch_size: u32,
    debounce: Duration,
}

impl SettlementEngine {
    pub fn new(ledger: Arc<dyn LedgerStore>, notifier: Arc<dyn Notifier>, batch_size: u32, debounce: Duration) -> Self {
        Self {
            ledger,
            notifier,
            batch_size,
            debounce,
        }
    }

    /// Claim and settle one batch
    ///
    /// Only a failed claim is returned as an error. Per-wallet failures are
    /// contained and counted in the report.
    pub async fn run_batch(&self) -> Result<BatchReport, StoreError> {
        let debounce = chrono::Duration::from_std(self.debounce).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - debounce;

        let rows = self.ledger.claim_pending(self.batch_size, cutoff).await?;
        let mut report = BatchReport {
            claimed: rows.len(),
            ..BatchReport::default()
        };

        if rows.is_empty() {
            return Ok(report);
        }

        for (wallet_id, group) in group_by_wallet(&rows) {
            let rows_in_group = group.business_ids.len();

            match self.settle_group(wallet_id, &group).await {
                Ok(()) => {
                    report.settled_wallets += 1;
                    report.completed_rows += rows_in_group;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        wallet_id,
                        total = %group.total,
                        rows = rows_in_group,
                        "wallet settlement failed, marking rows failed"
                    );
                    self.mark_failed(wallet_id, &group.business_ids).await;
                    report.failed_wallets += 1;
                    report.failed_rows += rows_in_group;
                }
            }
        }

        tracing::info!(
            claimed = report.claimed,
            settled_wallets = report.settled_wallets,
            failed_wallets = report.failed_wallets,
            "settlement batch finished"
        );

        Ok(report)
    }

    async fn settle_group(&self, wallet_id: i64, group: &WalletGroup) -> Result<(), StoreError> {
        if group.total.is_zero() {
            self.ledger
                .mark_status(&group.business_ids, TransactionStatus::Completed)
                .await?;
            return Ok(());
        }

        let wallet = self
            .ledger
            .wallet(wallet_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("wallet {wallet_id}")))?;

        let settlement = WalletSettlement {
            wallet_id,
            expected_version: wallet.version,
            total: group.total,
            member_totals: group.members.iter().map(|(user, amount)| (*user, *amount)).collect(),
            business_ids: group.business_ids.clone(),
        };

        self.ledger.settle_wallet(&settlement).await
    }

    async fn mark_failed(&self, wallet_id: i64, business_ids: &[BusinessId]) {
        if let Err(e) = self.ledger.mark_status(business_ids, TransactionStatus::Failed).await {
            // Rows stay PROCESSING until the stale reclaim picks them up
            tracing::error!(error = %e, wallet_id, rows = business_ids.len(), "failed to mark rows failed");
            self.notifier.notify(Alert::new(
                "settlement.stuck_processing",
                format!(
                    "{} rows of wallet {wallet_id} left in PROCESSING until reclaimed: {e}",
                    business_ids.len()
                ),
            ));
        }
    }

    /// Move failed call charges back to pending and alert when any moved
    pub async fn reset_failed(&self) -> Result<u64, StoreError> {
        let reset = self.ledger.reset_failed(TransactionKind::ApiCall).await?;

        if reset > 0 {
            tracing::warn!(rows = reset, "reset failed settlement rows to pending");
            self.notifier.notify(Alert::new(
                "settlement.failed_reset",
                format!("{reset} failed call charges were reset to pending"),
            ));
        }

        Ok(reset)
    }

    /// Return rows stuck in `PROCESSING` for longer than `stale_after` to
    /// `PENDING` and alert when any moved
    pub async fn reclaim_stale(&self, stale_after: Duration) -> Result<usize, StoreError> {
        let age = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        let reclaimed = self.ledger.reclaim_stale_processing(Utc::now() - age).await?;

        if !reclaimed.is_empty() {
            tracing::warn!(
                rows = reclaimed.len(),
                first = %reclaimed[0],
                "reclaimed stale processing rows"
            );
            self.notifier.notify(Alert::new(
                "settlement.stale_processing_reclaimed",
                format!(
                    "{} rows were stuck in PROCESSING for over {}s and were returned to pending",
                    reclaimed.len(),
                    stale_after.as_secs()
                ),
            ));
        }

        Ok(reclaimed.len())
    }
}

impl std::fmt::Debug for SettlementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementEngine")
            .field("batch_size", &self.batch_size)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}
