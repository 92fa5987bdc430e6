use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::models::QueuedClick;
use crate::storage::{put_json, KvResult, KvStore};

pub const DLQ_PREFIX: &str = "dlq:";
pub const DLQ_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub click: QueuedClick,
    /// Unix milliseconds
    pub failed_at: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub key: String,
    #[serde(flatten)]
    pub letter: DeadLetter,
}

/// Terminal store for clicks that exhausted their delivery attempts
#[derive(Clone)]
pub struct DeadLetterQueue {
    kv: Arc<dyn KvStore>,
}

impl DeadLetterQueue {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn park(&self, click: QueuedClick, reason: &str, now_ms: i64) -> KvResult<String> {
        let key = format!("{DLQ_PREFIX}{}", click.event.storage_key());
        let letter = DeadLetter {
            click,
            failed_at: now_ms,
            reason: reason.to_string(),
        };
        put_json(self.kv.as_ref(), &key, &letter, Some(DLQ_RETENTION)).await?;
        Ok(key)
    }

    pub async fn list(&self, limit: usize) -> KvResult<Vec<DeadLetterEntry>> {
        let entries = self.kv.list(DLQ_PREFIX, limit).await?;
        entries
            .into_iter()
            .map(|entry| {
                Ok(DeadLetterEntry {
                    letter: serde_json::from_str(&entry.value)?,
                    key: entry.key,
                })
            })
            .collect()
    }

    /// The given letters, or all of them; nothing is removed
    pub async fn select(&self, keys: Option<&[String]>) -> KvResult<Vec<DeadLetterEntry>> {
        let Some(keys) = keys else {
            return self.list(usize::MAX).await;
        };
        let mut selected = Vec::with_capacity(keys.len());
        for key in keys.iter().filter(|k| k.starts_with(DLQ_PREFIX)) {
            if let Some(raw) = self.kv.get(key).await? {
                selected.push(DeadLetterEntry {
                    key: key.clone(),
                    letter: serde_json::from_str(&raw)?,
                });
            }
        }
        Ok(selected)
    }

    pub async fn remove(&self, key: &str) -> KvResult<()> {
        self.kv.delete(key).await
    }

    pub async fn count(&self) -> KvResult<usize> {
        self.kv.count(DLQ_PREFIX).await
    }
}
