use std::sync::Arc;
use std::time::Duration;

use tollgate_cache::{Cache, get_json, set_json};
use tollgate_core::{Alert, Notifier, Snapshot, best_effort};
use tollgate_store::{ApiKeyRecord, KeyStore, StoreError};

use crate::bloom::BloomFilter;
use crate::key::{has_valid_shape, hash_key};
use crate::AuthError;

const CACHE_KEY_PREFIX: &str = "apikey:";

/// Tunables for [`KeyVerifier`]
#[derive(Debug, Clone)]
pub struct VerifierOptions {
    pub key_prefix: String,
    pub cache_ttl: Duration,
    pub filter_min_capacity: usize,
    pub rebuild_attempts: u32,
}

/// Gatekeeper for inbound API keys
///
/// Checks shape, then the membership filter, then the cache, then the store.
/// Until the first successful rebuild there is no filter and every
/// well-formed key falls through to the cache and store.
pub struct KeyVerifier {
    options: VerifierOptions,
    filter: Snapshot<Option<BloomFilter>>,
    keys: Arc<dyn KeyStore>,
    cache: Arc<dyn Cache>,
    notifier: Arc<dyn Notifier>,
}

impl KeyVerifier {
    pub fn new(
        options: VerifierOptions,
        keys: Arc<dyn KeyStore>,
        cache: Arc<dyn Cache>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            options,
            filter: Snapshot::new(None),
            keys,
            cache,
            notifier,
        }
    }

    /// Resolve a raw key to its active record
    pub async fn verify(&self, raw_key: &str) -> Result<ApiKeyRecord, AuthError> {
        if !has_valid_shape(&self.options.key_prefix, raw_key) {
            return Err(AuthError::MalformedKey);
        }

        let key_hash = hash_key(raw_key);

        if let Some(filter) = self.filter.load().as_ref()
            && !filter.might_contain(&key_hash)
        {
            return Err(AuthError::FilterRejected);
        }

        let cache_key = format!("{CACHE_KEY_PREFIX}{key_hash}");
        match get_json::<ApiKeyRecord>(self.cache.as_ref(), &cache_key).await {
            Ok(Some(record)) => return Ok(record),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "api key cache read failed, falling back to store"),
        }

        let record = self
            .keys
            .find_active_key(&key_hash)
            .await?
            .ok_or(AuthError::KeyNotFound)?;

        let cache = Arc::clone(&self.cache);
        let ttl = self.options.cache_ttl;
        let cached = record.clone();
        best_effort::spawn("cache api key", async move {
            set_json(cache.as_ref(), &cache_key, &cached, ttl).await
        });

        Ok(record)
    }

    /// Drop the cached record for a key hash, e.g. after revocation
    pub async fn invalidate(&self, key_hash: &str) {
        best_effort::log_failure(
            "invalidate api key",
            self.cache.delete(&format!("{CACHE_KEY_PREFIX}{key_hash}")).await,
        );
    }

    /// Rebuild the filter from every active key hash and publish it
    ///
    /// The new filter is fully built in a staging slot before it replaces the
    /// one in service. On repeated failure the previous filter stays and an
    /// alert is raised.
    pub async fn rebuild_filter(&self) -> Result<usize, AuthError> {
        let attempts = self.options.rebuild_attempts.max(1);
        let mut last_error: Option<StoreError> = None;

        for attempt in 1..=attempts {
            match self.keys.list_active_key_hashes().await {
                Ok(hashes) => {
                    let staging =
                        BloomFilter::build(hashes.iter().map(String::as_str), self.options.filter_min_capacity);
                    let count = staging.len();
                    self.filter.replace(Some(staging));
                    tracing::info!(keys = count, "api key filter rebuilt");
                    return Ok(count);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, attempts, "api key filter rebuild failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| StoreError::NotFound("active key hashes".to_owned()));
        self.notifier.notify(Alert::new(
            "auth.filter_rebuild_failed",
            format!("api key filter rebuild failed after {attempts} attempts: {error}"),
        ));
        Err(error.into())
    }

    /// Whether a filter has been published
    pub fn has_filter(&self) -> bool {
        self.filter.load().is_some()
    }
}

impl std::fmt::Debug for KeyVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVerifier")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
