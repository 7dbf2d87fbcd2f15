use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tollgate_core::BusinessId;

use crate::{
    ApiCallDetail, ApiCallRecord, ApiKeyRecord, CallOutcome, ModelPrice, StoreError, Transaction, TransactionKind,
    TransactionStatus, UpstreamEndpoint, Wallet, WalletSettlement,
};

/// API key lookups
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Find an active key by the hex hash of its full text
    async fn find_active_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError>;

    /// Hashes of every active key, for membership filter rebuilds
    async fn list_active_key_hashes(&self) -> Result<Vec<String>, StoreError>;
}

/// Reference data reloaded on timers
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_active_upstreams(&self) -> Result<Vec<UpstreamEndpoint>, StoreError>;

    async fn list_active_pricing(&self) -> Result<Vec<ModelPrice>, StoreError>;
}

/// Per-call record persistence
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Write the call summary in `STARTED` state when a stream opens
    async fn begin_call(&self, record: &ApiCallRecord) -> Result<(), StoreError>;

    /// Write the ledger row and detail and upsert the final call summary
    ///
    /// All three land in one store transaction. A second finish for the same
    /// business id fails with [`StoreError::Duplicate`].
    async fn finish_call(&self, outcome: &CallOutcome) -> Result<(), StoreError>;

    async fn transaction(&self, business_id: BusinessId) -> Result<Option<Transaction>, StoreError>;

    async fn call_record(&self, business_id: BusinessId) -> Result<Option<ApiCallRecord>, StoreError>;

    async fn call_detail(&self, business_id: BusinessId) -> Result<Option<ApiCallDetail>, StoreError>;

    /// Close every `STARTED` record begun before `started_before` as `FAILED`
    ///
    /// Such records belong to streams whose draining task died with its
    /// process; no ledger row exists for them.
    async fn fail_stale_calls(&self, started_before: DateTime<Utc>) -> Result<Vec<BusinessId>, StoreError>;
}

/// Wallet settlement operations
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Atomically move up to `limit` pending rows created before `created_before`
    /// to `PROCESSING`, returning them oldest first
    async fn claim_pending(&self, limit: u32, created_before: DateTime<Utc>) -> Result<Vec<Transaction>, StoreError>;

    async fn wallet(&self, wallet_id: i64) -> Result<Option<Wallet>, StoreError>;

    /// Apply one wallet's batch in a single transaction
    ///
    /// Decrements the balance only if the version still matches and the
    /// balance covers the total, bumps the version, credits each member's
    /// used-credit counter and marks the rows `COMPLETED`. A failed condition
    /// returns [`StoreError::Conflict`] and changes nothing.
    async fn settle_wallet(&self, settlement: &WalletSettlement) -> Result<(), StoreError>;

    async fn mark_status(&self, business_ids: &[BusinessId], status: TransactionStatus) -> Result<u64, StoreError>;

    /// Move every `FAILED` row of `kind` back to `PENDING`
    async fn reset_failed(&self, kind: TransactionKind) -> Result<u64, StoreError>;

    /// Move `PROCESSING` rows last touched before `updated_before` back to
    /// `PENDING`, returning their ids
    ///
    /// A settlement that crashed between claim and commit leaves its rows
    /// here; the wallet was never debited for them.
    async fn reclaim_stale_processing(&self, updated_before: DateTime<Utc>) -> Result<Vec<BusinessId>, StoreError>;
}

/// Every store capability behind one object
pub trait Store: KeyStore + CatalogStore + CallStore + LedgerStore {}

impl<T> Store for T where T: KeyStore + CatalogStore + CallStore + LedgerStore {}

/// Shared handles to one backend, one per capability
#[derive(Clone)]
pub struct StoreHandles {
    pub keys: Arc<dyn KeyStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub calls: Arc<dyn CallStore>,
    pub ledger: Arc<dyn LedgerStore>,
}

impl StoreHandles {
    pub fn new<S: Store + 'static>(store: Arc<S>) -> Self {
        Self {
            keys: store.clone(),
            catalog: store.clone(),
            calls: store.clone(),
            ledger: store,
        }
    }
}

impl std::fmt::Debug for StoreHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandles").finish_non_exhaustive()
    }
}
