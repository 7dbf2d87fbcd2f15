use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row};
use tollgate_core::BusinessId;

use crate::{
    ApiCallDetail, ApiCallRecord, ApiKeyRecord, CallOutcome, CallStatus, CallStore, CatalogStore, KeyStore,
    LedgerStore, ModelPrice, StoreError, Transaction, TransactionKind, TransactionStatus, UpstreamEndpoint, UpstreamFailure,
    Wallet, WalletSettlement,
};

const TRANSACTION_COLUMNS: &str =
    "business_id, kind, wallet_id, user_id, api_key_id, amount, status, created_at, updated_at";

const RECORD_COLUMNS: &str = "business_id, user_id, wallet_id, api_key_id, provider, service, model, upstream_id, \
     status, client_ip, user_agent, external_trace_id, started_at, finished_at, duration_ms, cost, no_charge";

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Open a connection pool
    ///
    /// # Errors
    ///
    /// Returns an error if the initial connection fails
    pub async fn connect(url: &SecretString, max_connections: u32) -> Result<Self, StoreError> {
        tracing::info!(max_connections, "connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(url.expose_secret())
            .await?;

        Ok(Self { pool })
    }

    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply bundled migrations
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        tracing::info!("running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore").finish_non_exhaustive()
    }
}

fn business_id(row: &PgRow) -> Result<BusinessId, StoreError> {
    let raw: String = row.try_get("business_id")?;
    raw.trim()
        .parse()
        .map_err(|e: tollgate_core::InvalidBusinessId| StoreError::Corrupt(e.to_string()))
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    Ok(Transaction {
        business_id: business_id(row)?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        wallet_id: row.try_get("wallet_id")?,
        user_id: row.try_get("user_id")?,
        api_key_id: row.try_get("api_key_id")?,
        amount: row.try_get("amount")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<ApiCallRecord, StoreError> {
    Ok(ApiCallRecord {
        business_id: business_id(row)?,
        user_id: row.try_get("user_id")?,
        wallet_id: row.try_get("wallet_id")?,
        api_key_id: row.try_get("api_key_id")?,
        provider: row.try_get::<String, _>("provider")?.parse()?,
        service: row.try_get::<String, _>("service")?.parse()?,
        model: row.try_get("model")?,
        upstream_id: row.try_get("upstream_id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        client_ip: row.try_get("client_ip")?,
        user_agent: row.try_get("user_agent")?,
        external_trace_id: row.try_get("external_trace_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        cost: row.try_get("cost")?,
        no_charge: row.try_get("no_charge")?,
    })
}

fn map_unique_violation(error: sqlx::Error, business_id: BusinessId) -> StoreError {
    match error {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => StoreError::Duplicate(business_id),
        other => StoreError::Database(other),
    }
}

async fn upsert_record<'e, E>(executor: E, record: &ApiCallRecord) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r"
        INSERT INTO api_call_records (business_id, user_id, wallet_id, api_key_id, provider, service, model,
            upstream_id, status, client_ip, user_agent, external_trace_id, started_at, finished_at, duration_ms,
            cost, no_charge)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ON CONFLICT (business_id) DO UPDATE SET
            upstream_id = EXCLUDED.upstream_id,
            status = EXCLUDED.status,
            finished_at = EXCLUDED.finished_at,
            duration_ms = EXCLUDED.duration_ms,
            cost = EXCLUDED.cost,
            no_charge = EXCLUDED.no_charge
        ",
    )
    .bind(record.business_id.to_string())
    .bind(record.user_id)
    .bind(record.wallet_id)
    .bind(record.api_key_id)
    .bind(record.provider.as_str())
    .bind(record.service.as_str())
    .bind(&record.model)
    .bind(record.upstream_id)
    .bind(record.status.as_str())
    .bind(&record.client_ip)
    .bind(&record.user_agent)
    .bind(&record.external_trace_id)
    .bind(record.started_at)
    .bind(record.finished_at)
    .bind(record.duration_ms)
    .bind(record.cost)
    .bind(record.no_charge)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl KeyStore for PgStore {
    async fn find_active_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, wallet_id, key_hash, active FROM api_keys WHERE key_hash = $1 AND active",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<ApiKeyRecord, StoreError> {
            Ok(ApiKeyRecord {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                wallet_id: row.try_get("wallet_id")?,
                key_hash: row.try_get::<String, _>("key_hash")?.trim().to_owned(),
                active: row.try_get("active")?,
            })
        })
        .transpose()
    }

    async fn list_active_key_hashes(&self) -> Result<Vec<String>, StoreError> {
        let hashes: Vec<String> = sqlx::query_scalar("SELECT key_hash FROM api_keys WHERE active")
            .fetch_all(&self.pool)
            .await?;

        Ok(hashes.into_iter().map(|hash| hash.trim().to_owned()).collect())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn list_active_upstreams(&self) -> Result<Vec<UpstreamEndpoint>, StoreError> {
        let rows = sqlx::query("SELECT id, provider, base_url, api_key, weight FROM upstreams WHERE active ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<UpstreamEndpoint, StoreError> {
                let weight: i32 = row.try_get("weight")?;
                Ok(UpstreamEndpoint {
                    id: row.try_get("id")?,
                    provider: row.try_get::<String, _>("provider")?.parse()?,
                    base_url: row.try_get("base_url")?,
                    api_key: SecretString::from(row.try_get::<String, _>("api_key")?),
                    weight: u32::try_from(weight).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn list_active_pricing(&self) -> Result<Vec<ModelPrice>, StoreError> {
        let rows = sqlx::query("SELECT model, service, input_price, output_price FROM model_prices WHERE active")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ModelPrice, StoreError> {
                Ok(ModelPrice {
                    model: row.try_get("model")?,
                    service: row.try_get::<String, _>("service")?.parse()?,
                    input_price: row.try_get("input_price")?,
                    output_price: row.try_get("output_price")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CallStore for PgStore {
    async fn begin_call(&self, record: &ApiCallRecord) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO api_call_records ({RECORD_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(record.business_id.to_string())
        .bind(record.user_id)
        .bind(record.wallet_id)
        .bind(record.api_key_id)
        .bind(record.provider.as_str())
        .bind(record.service.as_str())
        .bind(&record.model)
        .bind(record.upstream_id)
        .bind(record.status.as_str())
        .bind(&record.client_ip)
        .bind(&record.user_agent)
        .bind(&record.external_trace_id)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.duration_ms)
        .bind(record.cost)
        .bind(record.no_charge)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, record.business_id))?;

        Ok(())
    }

    async fn finish_call(&self, outcome: &CallOutcome) -> Result<(), StoreError> {
        let CallOutcome {
            transaction,
            record,
            detail,
        } = outcome;
        let business_id = transaction.business_id;

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO transactions ({TRANSACTION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(business_id.to_string())
        .bind(transaction.kind.as_str())
        .bind(transaction.wallet_id)
        .bind(transaction.user_id)
        .bind(transaction.api_key_id)
        .bind(transaction.amount)
        .bind(transaction.status.as_str())
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, business_id))?;

        sqlx::query(
            r"
            INSERT INTO api_call_details (business_id, request_body, response_body, response_text,
                billing_summary, internal_errors, upstream_errors)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(business_id.to_string())
        .bind(&detail.request_body)
        .bind(&detail.response_body)
        .bind(&detail.response_text)
        .bind(Json(&detail.billing_summary))
        .bind(Json(&detail.internal_errors))
        .bind(Json(&detail.upstream_errors))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, business_id))?;

        upsert_record(&mut *tx, record).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn transaction(&self, business_id: BusinessId) -> Result<Option<Transaction>, StoreError> {
        sqlx::query(&format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE business_id = $1"))
            .bind(business_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(transaction_from_row)
            .transpose()
    }

    async fn call_record(&self, business_id: BusinessId) -> Result<Option<ApiCallRecord>, StoreError> {
        sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM api_call_records WHERE business_id = $1"))
            .bind(business_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(record_from_row)
            .transpose()
    }

    async fn call_detail(&self, business_id: BusinessId) -> Result<Option<ApiCallDetail>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT request_body, response_body, response_text, billing_summary, internal_errors, upstream_errors
            FROM api_call_details WHERE business_id = $1
            ",
        )
        .bind(business_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<ApiCallDetail, StoreError> {
            let Json(internal_errors): Json<Vec<String>> = row.try_get("internal_errors")?;
            let Json(upstream_errors): Json<Vec<UpstreamFailure>> = row.try_get("upstream_errors")?;
            Ok(ApiCallDetail {
                business_id,
                request_body: row.try_get("request_body")?,
                response_body: row.try_get("response_body")?,
                response_text: row.try_get("response_text")?,
                billing_summary: row.try_get("billing_summary")?,
                internal_errors,
                upstream_errors,
            })
        })
        .transpose()
    }

    async fn fail_stale_calls(&self, started_before: DateTime<Utc>) -> Result<Vec<BusinessId>, StoreError> {
        let rows = sqlx::query(
            r"
            UPDATE api_call_records SET status = $1, finished_at = now()
            WHERE status = $2 AND started_at < $3
            RETURNING business_id
            ",
        )
        .bind(CallStatus::Failed.as_str())
        .bind(CallStatus::Started.as_str())
        .bind(started_before)
        .fetch_all(&self.pool)
        .await?;

        let mut failed = rows.iter().map(business_id).collect::<Result<Vec<_>, _>>()?;
        failed.sort();
        Ok(failed)
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn claim_pending(&self, limit: u32, created_before: DateTime<Utc>) -> Result<Vec<Transaction>, StoreError> {
        // Single statement: the select and the status flip commit together
        let rows = sqlx::query(&format!(
            r"
            UPDATE transactions SET status = $1, updated_at = now()
            WHERE business_id IN (
                SELECT business_id FROM transactions
                WHERE status = $2 AND created_at < $3
                ORDER BY created_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TRANSACTION_COLUMNS}
            "
        ))
        .bind(TransactionStatus::Processing.as_str())
        .bind(TransactionStatus::Pending.as_str())
        .bind(created_before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows.iter().map(transaction_from_row).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| (a.created_at, a.business_id).cmp(&(b.created_at, b.business_id)));
        Ok(claimed)
    }

    async fn wallet(&self, wallet_id: i64) -> Result<Option<Wallet>, StoreError> {
        let row = sqlx::query("SELECT id, balance, version FROM wallets WHERE id = $1")
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Wallet, StoreError> {
            Ok(Wallet {
                id: row.try_get("id")?,
                balance: row.try_get("balance")?,
                version: row.try_get("version")?,
            })
        })
        .transpose()
    }

    async fn settle_wallet(&self, settlement: &WalletSettlement) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE wallets
            SET balance = balance - $1, version = version + 1, updated_at = now()
            WHERE id = $2 AND version = $3 AND balance >= $1
            ",
        )
        .bind(settlement.total)
        .bind(settlement.wallet_id)
        .bind(settlement.expected_version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Err(StoreError::Conflict(settlement.wallet_id));
        }

        for (user_id, amount) in &settlement.member_totals {
            sqlx::query(
                r"
                INSERT INTO wallet_members (wallet_id, user_id, used_credit) VALUES ($1, $2, $3)
                ON CONFLICT (wallet_id, user_id) DO UPDATE
                SET used_credit = wallet_members.used_credit + EXCLUDED.used_credit
                ",
            )
            .bind(settlement.wallet_id)
            .bind(user_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;
        }

        let ids: Vec<String> = settlement.business_ids.iter().map(ToString::to_string).collect();
        sqlx::query("UPDATE transactions SET status = $1, updated_at = now() WHERE business_id = ANY($2)")
            .bind(TransactionStatus::Completed.as_str())
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_status(&self, business_ids: &[BusinessId], status: TransactionStatus) -> Result<u64, StoreError> {
        let ids: Vec<String> = business_ids.iter().map(ToString::to_string).collect();
        let result = sqlx::query("UPDATE transactions SET status = $1, updated_at = now() WHERE business_id = ANY($2)")
            .bind(status.as_str())
            .bind(&ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn reset_failed(&self, kind: TransactionKind) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE transactions SET status = $1, updated_at = now() WHERE status = $2 AND kind = $3")
                .bind(TransactionStatus::Pending.as_str())
                .bind(TransactionStatus::Failed.as_str())
                .bind(kind.as_str())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    async fn reclaim_stale_processing(&self, updated_before: DateTime<Utc>) -> Result<Vec<BusinessId>, StoreError> {
        // Rows held by a live settlement are locked and skipped
        let rows = sqlx::query(
            r"
            UPDATE transactions SET status = $1, updated_at = now()
            WHERE business_id IN (
                SELECT business_id FROM transactions
                WHERE status = $2 AND updated_at < $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING business_id
            ",
        )
        .bind(TransactionStatus::Pending.as_str())
        .bind(TransactionStatus::Processing.as_str())
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(business_id).collect()
    }
}
