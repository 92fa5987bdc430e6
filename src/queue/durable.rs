use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::models::QueuedClick;
use crate::storage::{put_json, KvResult, KvStore};

pub const DURABLE_PREFIX: &str = "durable:click:";

/// Per-click persistent entries; the source of truth for undelivered clicks
#[derive(Clone)]
pub struct DurableStorage {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    max_entries: usize,
}

impl DurableStorage {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            kv,
            ttl,
            max_entries,
        }
    }

    pub fn key(click: &QueuedClick) -> String {
        format!("{DURABLE_PREFIX}{}", click.event.storage_key())
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub async fn save(&self, click: &QueuedClick) -> KvResult<()> {
        put_json(self.kv.as_ref(), &Self::key(click), click, Some(self.ttl)).await
    }

    pub async fn remove(&self, click: &QueuedClick) -> KvResult<()> {
        self.kv.delete(&Self::key(click)).await
    }

    pub async fn count(&self) -> KvResult<usize> {
        self.kv.count(DURABLE_PREFIX).await
    }

    /// Free slots before the hard cap; a failed count is treated as room for one
    pub async fn room(&self) -> usize {
        match self.count().await {
            Ok(count) => self.max_entries.saturating_sub(count),
            Err(e) => {
                warn!(error = %e, "durable count failed");
                1
            }
        }
    }

    /// Every persisted click; unreadable entries are logged and left in place
    pub async fn load_all(&self) -> KvResult<Vec<QueuedClick>> {
        let entries = self.kv.list(DURABLE_PREFIX, usize::MAX).await?;
        let mut clicks = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_str::<QueuedClick>(&entry.value) {
                Ok(click) => clicks.push(click),
                Err(e) => warn!(key = %entry.key, error = %e, "skipping unreadable durable click"),
            }
        }
        Ok(clicks)
    }
}
