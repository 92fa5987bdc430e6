use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("stored value could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

/// Shared key-value state (nonces, caches, counters, durable buffers).
///
/// Individual operations are atomic; sequences of operations are not.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Prepare the backing store (create tables, etc.)
    async fn init(&self) -> KvResult<()> {
        Ok(())
    }

    /// Get a live (non-expired) value
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Insert or overwrite a value, optionally expiring after `ttl`
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Live entries whose key starts with `prefix`, in ascending key order
    async fn list(&self, prefix: &str, limit: usize) -> KvResult<Vec<KvEntry>>;

    /// Number of live entries under `prefix`
    async fn count(&self, prefix: &str) -> KvResult<usize>;
}

pub async fn get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> KvResult<Option<T>> {
    match kv.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize + ?Sized>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> KvResult<()> {
    let raw = serde_json::to_string(value)?;
    kv.put(key, &raw, ttl).await
}

/// Delete every entry under `prefix`, returning how many were removed
pub async fn delete_prefix(kv: &dyn KvStore, prefix: &str) -> KvResult<usize> {
    let mut removed = 0;
    loop {
        let batch = kv.list(prefix, 500).await?;
        if batch.is_empty() {
            return Ok(removed);
        }
        for entry in &batch {
            kv.delete(&entry.key).await?;
        }
        removed += batch.len();
    }
}
