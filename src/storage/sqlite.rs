use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;

use super::{KvEntry, KvResult, KvStore};

/// SQLite-backed store; survives process restarts
pub struct SqliteKv {
    pool: Arc<SqlitePool>,
}

impl SqliteKv {
    pub async fn new(database_url: &str, max_connections: u32) -> KvResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Delete rows whose TTL has passed
    pub async fn purge_expired(&self) -> KvResult<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now_millis())
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }

    /// Close the pool, waiting for in-flight statements
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn init(&self) -> KvResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv_entries(expires_at)")
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let row = sqlx::query(
            "SELECT value FROM kv_entries WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(|row| row.get::<String, _>("value")))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let expires_at = ttl.map(|ttl| now_millis() + ttl.as_millis() as i64);

        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> KvResult<Vec<KvEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT key, value FROM kv_entries
            WHERE substr(key, 1, ?) = ? AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY key ASC
            LIMIT ?
            "#,
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .bind(now_millis())
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| KvEntry {
                key: row.get("key"),
                value: row.get("value"),
            })
            .collect())
    }

    async fn count(&self, prefix: &str) -> KvResult<usize> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM kv_entries
            WHERE substr(key, 1, ?) = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .bind(now_millis())
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(row.get::<i64, _>("total") as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_sqlite() -> SqliteKv {
        // A single connection keeps every statement on the same in-memory database
        let kv = SqliteKv::new("sqlite::memory:", 1).await.unwrap();
        kv.init().await.unwrap();
        kv
    }

    #[tokio::test]
    async fn test_upsert_overwrites_value() {
        let kv = setup_sqlite().await;
        kv.put("k", "one", None).await.unwrap();
        kv.put("k", "two", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible() {
        let kv = setup_sqlite().await;
        kv.put("gone", "x", Some(Duration::from_millis(1))).await.unwrap();
        kv.put("kept", "y", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(kv.get("gone").await.unwrap(), None);
        assert_eq!(kv.count("").await.unwrap(), 1);
        assert_eq!(kv.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prefix_listing() {
        let kv = setup_sqlite().await;
        kv.put("durable:click:b", "2", None).await.unwrap();
        kv.put("durable:click:a", "1", None).await.unwrap();
        kv.put("dlq:a", "3", None).await.unwrap();

        let entries = kv.list("durable:", 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "durable:click:a");
        assert_eq!(kv.count("dlq:").await.unwrap(), 1);
    }
}
