//! TTL key/value cache shared by gateway components
//!
//! [`RedisCache`] is shared across gateway instances; [`LocalCache`] keeps
//! entries in process when no shared cache is configured.

#![allow(clippy::missing_errors_doc)]

mod local;
mod redis_cache;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use local::LocalCache;
pub use redis_cache::RedisCache;

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Connection or command error
    #[error("cache backend: {0}")]
    Backend(String),
    /// Serialization error
    #[error("serialization: {0}")]
    Serialization(String),
}

/// String key/value cache with per-entry expiry
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Read and decode a JSON entry
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Result<Option<T>, CacheError> {
    let Some(raw) = cache.get(key).await? else {
        return Ok(None);
    };

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| CacheError::Serialization(format!("deserialize: {e}")))
}

/// Encode and write a JSON entry
pub async fn set_json<T: Serialize + Sync>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value).map_err(|e| CacheError::Serialization(format!("serialize: {e}")))?;
    cache.set(key, &raw, ttl).await
}
