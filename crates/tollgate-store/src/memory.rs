use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tollgate_core::BusinessId;

use crate::{
    ApiCallDetail, ApiCallRecord, ApiKeyRecord, CallOutcome, CallStatus, CallStore, CatalogStore, KeyStore, LedgerStore,
    ModelPrice, StoreError, Transaction, TransactionKind, TransactionStatus, UpstreamEndpoint, Wallet,
    WalletSettlement,
};

#[derive(Default)]
struct State {
    keys: HashMap<String, ApiKeyRecord>,
    upstreams: Vec<UpstreamEndpoint>,
    prices: Vec<ModelPrice>,
    transactions: BTreeMap<BusinessId, Transaction>,
    records: HashMap<BusinessId, ApiCallRecord>,
    details: HashMap<BusinessId, ApiCallDetail>,
    wallets: HashMap<i64, Wallet>,
    used_credit: HashMap<(i64, i64), Decimal>,
}

/// Process-local store for development and tests
///
/// Same semantics as the PostgreSQL backend, including the conditional wallet
/// update. Exposes seeding helpers and counters for assertions.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    key_lookups: AtomicUsize,
    failing_key_listings: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_key(&self, record: ApiKeyRecord) {
        self.state().keys.insert(record.key_hash.clone(), record);
    }

    pub fn deactivate_key(&self, key_hash: &str) {
        if let Some(record) = self.state().keys.get_mut(key_hash) {
            record.active = false;
        }
    }

    pub fn insert_wallet(&self, id: i64, balance: Decimal) {
        self.state().wallets.insert(id, Wallet { id, balance, version: 0 });
    }

    pub fn set_upstreams(&self, upstreams: Vec<UpstreamEndpoint>) {
        self.state().upstreams = upstreams;
    }

    pub fn set_prices(&self, prices: Vec<ModelPrice>) {
        self.state().prices = prices;
    }

    pub fn insert_transaction(&self, transaction: Transaction) {
        self.state().transactions.insert(transaction.business_id, transaction);
    }

    /// Snapshot of every ledger row, ordered by business id
    pub fn transactions(&self) -> Vec<Transaction> {
        self.state().transactions.values().cloned().collect()
    }

    pub fn used_credit(&self, wallet_id: i64, user_id: i64) -> Decimal {
        self.state()
            .used_credit
            .get(&(wallet_id, user_id))
            .copied()
            .unwrap_or_default()
    }

    /// Number of `find_active_key` calls served so far
    pub fn key_lookups(&self) -> usize {
        self.key_lookups.load(Ordering::SeqCst)
    }

    /// Make the next `count` active-key listings fail
    pub fn fail_next_key_listings(&self, count: u32) {
        self.failing_key_listings.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn find_active_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        self.key_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().keys.get(key_hash).filter(|record| record.active).cloned())
    }

    async fn list_active_key_hashes(&self) -> Result<Vec<String>, StoreError> {
        let should_fail = self
            .failing_key_listings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StoreError::NotFound("api key table".to_owned()));
        }

        Ok(self
            .state()
            .keys
            .values()
            .filter(|record| record.active)
            .map(|record| record.key_hash.clone())
            .collect())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn list_active_upstreams(&self) -> Result<Vec<UpstreamEndpoint>, StoreError> {
        Ok(self.state().upstreams.clone())
    }

    async fn list_active_pricing(&self) -> Result<Vec<ModelPrice>, StoreError> {
        Ok(self.state().prices.clone())
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn begin_call(&self, record: &ApiCallRecord) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.records.contains_key(&record.business_id) {
            return Err(StoreError::Duplicate(record.business_id));
        }
        state.records.insert(record.business_id, record.clone());
        Ok(())
    }

    async fn finish_call(&self, outcome: &CallOutcome) -> Result<(), StoreError> {
        let business_id = outcome.transaction.business_id;
        let mut state = self.state();
        if state.transactions.contains_key(&business_id) {
            return Err(StoreError::Duplicate(business_id));
        }
        state.transactions.insert(business_id, outcome.transaction.clone());
        state.details.insert(business_id, outcome.detail.clone());
        state.records.insert(business_id, outcome.record.clone());
        Ok(())
    }

    async fn transaction(&self, business_id: BusinessId) -> Result<Option<Transaction>, StoreError> {
        Ok(self.state().transactions.get(&business_id).cloned())
    }

    async fn call_record(&self, business_id: BusinessId) -> Result<Option<ApiCallRecord>, StoreError> {
        Ok(self.state().records.get(&business_id).cloned())
    }

    async fn call_detail(&self, business_id: BusinessId) -> Result<Option<ApiCallDetail>, StoreError> {
        Ok(self.state().details.get(&business_id).cloned())
    }

    async fn fail_stale_calls(&self, started_before: DateTime<Utc>) -> Result<Vec<BusinessId>, StoreError> {
        let mut state = self.state();
        let now = Utc::now();
        let mut failed = Vec::new();
        for record in state
            .records
            .values_mut()
            .filter(|r| r.status == CallStatus::Started && r.started_at < started_before)
        {
            record.status = CallStatus::Failed;
            record.finished_at = Some(now);
            failed.push(record.business_id);
        }
        failed.sort();
        Ok(failed)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn claim_pending(&self, limit: u32, created_before: DateTime<Utc>) -> Result<Vec<Transaction>, StoreError> {
        let mut state = self.state();
        let mut pending: Vec<&mut Transaction> = state
            .transactions
            .values_mut()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.created_at < created_before)
            .collect();
        pending.sort_by(|a, b| (a.created_at, a.business_id).cmp(&(b.created_at, b.business_id)));

        let now = Utc::now();
        Ok(pending
            .into_iter()
            .take(limit as usize)
            .map(|tx| {
                tx.status = TransactionStatus::Processing;
                tx.updated_at = now;
                tx.clone()
            })
            .collect())
    }

    async fn wallet(&self, wallet_id: i64) -> Result<Option<Wallet>, StoreError> {
        Ok(self.state().wallets.get(&wallet_id).cloned())
    }

    async fn settle_wallet(&self, settlement: &WalletSettlement) -> Result<(), StoreError> {
        let mut state = self.state();
        let Some(wallet) = state.wallets.get_mut(&settlement.wallet_id) else {
            return Err(StoreError::NotFound(format!("wallet {}", settlement.wallet_id)));
        };

        if wallet.version != settlement.expected_version || wallet.balance < settlement.total {
            return Err(StoreError::Conflict(settlement.wallet_id));
        }

        wallet.balance -= settlement.total;
        wallet.version += 1;

        for (user_id, amount) in &settlement.member_totals {
            *state
                .used_credit
                .entry((settlement.wallet_id, *user_id))
                .or_default() += *amount;
        }

        let now = Utc::now();
        for business_id in &settlement.business_ids {
            if let Some(tx) = state.transactions.get_mut(business_id) {
                tx.status = TransactionStatus::Completed;
                tx.updated_at = now;
            }
        }

        Ok(())
    }

    async fn mark_status(&self, business_ids: &[BusinessId], status: TransactionStatus) -> Result<u64, StoreError> {
        let mut state = self.state();
        let now = Utc::now();
        let mut updated = 0;
        for business_id in business_ids {
            if let Some(tx) = state.transactions.get_mut(business_id) {
                tx.status = status;
                tx.updated_at = now;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn reset_failed(&self, kind: TransactionKind) -> Result<u64, StoreError> {
        let mut state = self.state();
        let now = Utc::now();
        let mut updated = 0;
        for tx in state
            .transactions
            .values_mut()
            .filter(|tx| tx.kind == kind && tx.status == TransactionStatus::Failed)
        {
            tx.status = TransactionStatus::Pending;
            tx.updated_at = now;
            updated += 1;
        }
        Ok(updated)
    }

    async fn reclaim_stale_processing(&self, updated_before: DateTime<Utc>) -> Result<Vec<BusinessId>, StoreError> {
        let mut state = self.state();
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for tx in state
            .transactions
            .values_mut()
            .filter(|tx| tx.status == TransactionStatus::Processing && tx.updated_at < updated_before)
        {
            tx.status = TransactionStatus::Pending;
            tx.updated_at = now;
            reclaimed.push(tx.business_id);
        }
        Ok(reclaimed)
    }
}
