use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use super::durable::DurableStorage;
use super::overflow::OverflowStorage;
use super::QueueError;
use crate::backend::{BackendClient, BackendError};
use crate::config::QueueConfig;
use crate::models::{EdgeClickEvent, QueuedClick};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Delay before the next attempt after `attempts` failures
pub fn backoff(attempts: u32) -> Duration {
    Duration::from_secs(1u64 << attempts.min(16))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOutcome {
    /// Persisted and buffered for the next batch
    Buffered,
    /// Durable buffer full; written to overflow storage
    Spilled,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub reabsorbed: usize,
    /// Durable entries the buffer was missing
    pub recovered: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub spilled: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub buffered: usize,
    pub durable: usize,
    pub overflow_blobs: usize,
    pub dead_letters: usize,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub total_queued: u64,
    pub total_delivered: u64,
    pub total_failed_attempts: u64,
    pub total_dead_lettered: u64,
    pub total_spilled: u64,
}

#[derive(Default)]
struct QueueStats {
    queued: AtomicU64,
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    dead_lettered: AtomicU64,
    spilled: AtomicU64,
}

/// Batches clicks to the backend without ever holding the only copy in memory.
///
/// Every accepted click is written to durable storage before `queue_click`
/// returns; the in-memory buffer mirrors those entries and is rebuilt from
/// them by [`ClickQueue::restore`], which must run before serving traffic.
pub struct ClickQueue {
    durable: DurableStorage,
    overflow: OverflowStorage,
    dead_letters: DeadLetterQueue,
    backend: Arc<dyn BackendClient>,
    buffer: Mutex<Vec<QueuedClick>>,
    flush_lock: Mutex<()>,
    batch_size: usize,
    max_attempts: u32,
    send_timeout: Duration,
    stats: QueueStats,
    shutdown_tx: watch::Sender<bool>,
}

impl ClickQueue {
    pub fn new(
        durable: DurableStorage,
        overflow: OverflowStorage,
        dead_letters: DeadLetterQueue,
        backend: Arc<dyn BackendClient>,
        config: &QueueConfig,
        send_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            durable,
            overflow,
            dead_letters,
            backend,
            buffer: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            batch_size: config.batch_size.max(1),
            max_attempts: config.max_attempts.max(1),
            send_timeout,
            stats: QueueStats::default(),
            shutdown_tx,
        }
    }

    /// Rebuild the buffer from durable storage and pull in overflow blobs
    pub async fn restore(&self) -> Result<usize, QueueError> {
        let clicks = self.durable.load_all().await?;
        let restored = clicks.len();
        *self.buffer.lock().await = clicks;

        let reabsorbed = self.reabsorb_overflow().await;
        if restored + reabsorbed > 0 {
            info!(restored, reabsorbed, "click queue restored from storage");
        }
        Ok(restored + reabsorbed)
    }

    pub async fn queue_click(&self, event: EdgeClickEvent) -> Result<QueueOutcome, QueueError> {
        let click = QueuedClick::new(event, now_millis());

        if self.durable.room().await == 0 {
            let key = self
                .overflow
                .spill(std::slice::from_ref(&click))
                .await
                .map_err(QueueError::Overflow)?;
            self.stats.spilled.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, tracking_code = %click.event.tracking_code, "durable buffer full, click spilled");
            return Ok(QueueOutcome::Spilled);
        }

        self.durable.save(&click).await?;
        self.stats.queued.fetch_add(1, Ordering::Relaxed);

        let full = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(click);
            buffer.len() >= self.batch_size
        };
        if full {
            if let Err(e) = self.flush().await {
                warn!(error = %e, "flush after full buffer failed");
            }
        }
        Ok(QueueOutcome::Buffered)
    }

    pub async fn ingest(&self, events: Vec<EdgeClickEvent>) -> IngestReport {
        let mut report = IngestReport::default();
        for event in events {
            match self.queue_click(event).await {
                Ok(QueueOutcome::Buffered) => report.accepted += 1,
                Ok(QueueOutcome::Spilled) => report.spilled += 1,
                Err(e) => {
                    error!(error = %e, "failed to ingest click");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub async fn flush(&self) -> Result<FlushReport, QueueError> {
        self.flush_at(now_millis()).await
    }

    /// Send every due click; `now_ms` decides which retries are due
    pub async fn flush_at(&self, now_ms: i64) -> Result<FlushReport, QueueError> {
        let _guard = self.flush_lock.lock().await;
        let mut report = FlushReport {
            recovered: self.reconcile_durable().await,
            ..FlushReport::default()
        };

        let due: Vec<QueuedClick> = {
            let mut buffer = self.buffer.lock().await;
            let mut seen = HashSet::with_capacity(buffer.len());
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut *buffer)
                .into_iter()
                .filter(|c| seen.insert(DurableStorage::key(c)))
                .partition(|c| c.is_due(now_ms));
            *buffer = waiting;
            due
        };

        let mut retry = Vec::new();
        let mut chunks = due.chunks(self.batch_size);
        for chunk in chunks.by_ref() {
            let events: Vec<EdgeClickEvent> = chunk.iter().map(|c| c.event.clone()).collect();
            report.sent += events.len();

            let result = match time::timeout(self.send_timeout, self.backend.send_clicks(&events)).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(self.send_timeout)),
            };

            match result {
                Ok(()) => {
                    for click in chunk {
                        if let Err(e) = self.durable.remove(click).await {
                            warn!(error = %e, "delivered click left in durable storage");
                        }
                    }
                    report.delivered += chunk.len();
                    self.stats
                        .delivered
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(error = %e, batch = chunk.len(), "click batch delivery failed");
                    report.failed += chunk.len();
                    for click in chunk.iter().cloned() {
                        if let Some(click) = self.record_failure(click, &e.to_string(), now_ms).await {
                            retry.push(click);
                        } else {
                            report.dead_lettered += 1;
                        }
                    }
                    break;
                }
            }
        }
        // Not attempted this round; they keep their schedule
        for chunk in chunks {
            retry.extend_from_slice(chunk);
        }

        if !retry.is_empty() {
            self.buffer.lock().await.extend(retry);
        }

        report.reabsorbed = self.reabsorb_overflow().await;
        report.remaining = self.buffer.lock().await.len();
        if report.sent > 0 {
            debug!(?report, "click queue flushed");
        }
        Ok(report)
    }

    /// Bump attempts and reschedule, or park the click once attempts are exhausted.
    ///
    /// Returns `None` once the click is in the dead-letter queue. Storage
    /// errors never drop a click: one that cannot be parked stays scheduled.
    async fn record_failure(&self, mut click: QueuedClick, error: &str, now_ms: i64) -> Option<QueuedClick> {
        click.attempts += 1;
        click.last_attempt = Some(now_ms);
        click.last_error = Some(error.to_string());
        self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);

        if click.attempts >= self.max_attempts {
            match self.dead_letters.park(click.clone(), error, now_ms).await {
                Ok(_) => {
                    if let Err(e) = self.durable.remove(&click).await {
                        warn!(error = %e, "dead-lettered click left in durable storage");
                    }
                    self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        tracking_code = %click.event.tracking_code,
                        attempts = click.attempts,
                        "click moved to dead-letter queue"
                    );
                    return None;
                }
                Err(e) => error!(
                    tracking_code = %click.event.tracking_code,
                    error = %e,
                    "dead-letter write failed, click kept for retry"
                ),
            }
        }

        click.next_attempt_at = now_ms + backoff(click.attempts).as_millis() as i64;
        if let Err(e) = self.durable.save(&click).await {
            warn!(error = %e, "retry schedule not persisted");
        }
        Some(click)
    }

    /// Buffer durable entries written outside this queue (CLI replays) or
    /// dropped from the buffer by failed bookkeeping
    async fn reconcile_durable(&self) -> usize {
        let stored = match self.durable.count().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "durable count failed, skipping reconcile");
                return 0;
            }
        };
        if stored <= self.buffer.lock().await.len() {
            return 0;
        }

        let clicks = match self.durable.load_all().await {
            Ok(clicks) => clicks,
            Err(e) => {
                warn!(error = %e, "durable load failed, skipping reconcile");
                return 0;
            }
        };
        let mut buffer = self.buffer.lock().await;
        let known: HashSet<String> = buffer.iter().map(DurableStorage::key).collect();
        let missing: Vec<QueuedClick> = clicks
            .into_iter()
            .filter(|c| !known.contains(&DurableStorage::key(c)))
            .collect();
        let recovered = missing.len();
        buffer.extend(missing);
        if recovered > 0 {
            info!(recovered, "durable clicks returned to the buffer");
        }
        recovered
    }

    /// Move overflow blobs back into the durable buffer while there is room
    async fn reabsorb_overflow(&self) -> usize {
        let keys = match self.overflow.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to list overflow blobs");
                return 0;
            }
        };

        let mut reabsorbed = 0;
        for key in keys {
            let clicks = match self.overflow.read(&key).await {
                Ok(Some(clicks)) => clicks,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to read overflow blob");
                    continue;
                }
            };
            if self.durable.room().await < clicks.len() {
                break;
            }

            let total = clicks.len();
            let mut saved = Vec::with_capacity(total);
            for click in clicks {
                if let Err(e) = self.durable.save(&click).await {
                    warn!(key = %key, error = %e, "overflow reabsorb interrupted");
                    break;
                }
                saved.push(click);
            }
            let complete = saved.len() == total;
            reabsorbed += saved.len();
            self.buffer.lock().await.extend(saved);

            // A partially saved blob stays; the duplicates it causes are deduplicated by the backend
            if !complete {
                break;
            }
            if let Err(e) = self.overflow.remove(&key).await {
                warn!(key = %key, error = %e, "failed to delete reabsorbed overflow blob");
            }
        }
        reabsorbed
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        Ok(self.dead_letters.list(limit).await?)
    }

    /// Return dead letters to the active queue with a fresh attempt budget.
    ///
    /// Each letter is written to durable storage before its DLQ entry is
    /// deleted; on a failed write the remaining letters stay in the DLQ.
    pub async fn replay_dead_letters(&self, keys: Option<&[String]>) -> Result<usize, QueueError> {
        let letters = self.dead_letters.select(keys).await?;
        let now = now_millis();
        let mut replayed = Vec::with_capacity(letters.len());
        let mut failure = None;
        for entry in letters {
            let mut click = entry.letter.click;
            click.attempts = 0;
            click.next_attempt_at = now;
            click.last_error = None;
            if let Err(e) = self.durable.save(&click).await {
                failure = Some(e);
                break;
            }
            // A leftover letter only means a duplicate the backend drops on event_id
            if let Err(e) = self.dead_letters.remove(&entry.key).await {
                warn!(key = %entry.key, error = %e, "replayed letter left in dead-letter queue");
            }
            replayed.push(click);
        }

        let count = replayed.len();
        self.buffer.lock().await.extend(replayed);
        if let Some(e) = failure {
            error!(replayed = count, error = %e, "dead-letter replay stopped, remaining letters kept");
            return Err(e.into());
        }
        if count > 0 {
            info!(count, "dead letters replayed");
        }
        Ok(count)
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            buffered: self.buffered().await,
            durable: self.durable.count().await.unwrap_or(0),
            overflow_blobs: self.overflow.keys().await.map(|k| k.len()).unwrap_or(0),
            dead_letters: self.dead_letters.count().await.unwrap_or(0),
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
            total_queued: self.stats.queued.load(Ordering::Relaxed),
            total_delivered: self.stats.delivered.load(Ordering::Relaxed),
            total_failed_attempts: self.stats.failed_attempts.load(Ordering::Relaxed),
            total_dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            total_spilled: self.stats.spilled.load(Ordering::Relaxed),
        }
    }

    /// Periodic flush loop; flushes once more when [`ClickQueue::shutdown`] is called
    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval.max(Duration::from_millis(100)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = queue.flush().await {
                            error!("Failed to flush click queue: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Shutdown signal received, flushing click queue...");
                            match queue.flush().await {
                                Ok(report) => info!(remaining = report.remaining, "Click queue flushed on shutdown"),
                                Err(e) => error!("Failed to flush click queue on shutdown: {}", e),
                            }
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendResult;
    use crate::models::{OfferConfig, RuleScope, TenantStatus};
    use crate::storage::{KvEntry, KvError, KvResult, KvStore, MemoryBlobStore, MemoryKv};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct FlakyBackend {
        down: AtomicBool,
        calls: AtomicUsize,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl BackendClient for FlakyBackend {
        async fn fetch_offer(&self, _: &str) -> BackendResult<Option<OfferConfig>> {
            Ok(None)
        }
        async fn fetch_tenant(&self, _: &str) -> BackendResult<Option<TenantStatus>> {
            Ok(None)
        }

        async fn fetch_rule(
            &self,
            _kind: &str,
            _scope: RuleScope,
            _scope_id: Option<&str>,
        ) -> BackendResult<Option<serde_json::Value>> {
            Ok(None)
        }

        async fn send_clicks(&self, events: &[EdgeClickEvent]) -> BackendResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("ingest down".into()));
            }
            self.delivered.fetch_add(events.len(), Ordering::SeqCst);
            Ok(())
        }
        async fn health(&self) -> BackendResult<Duration> {
            Ok(Duration::ZERO)
        }
    }

    /// Memory store that refuses writes under `prefix` while `failing` is set
    struct FailingPuts {
        inner: MemoryKv,
        prefix: &'static str,
        failing: AtomicBool,
    }

    impl FailingPuts {
        fn new(prefix: &'static str) -> Self {
            Self {
                inner: MemoryKv::new(),
                prefix,
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl KvStore for FailingPuts {
        async fn get(&self, key: &str) -> KvResult<Option<String>> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
            if self.failing.load(Ordering::SeqCst) && key.starts_with(self.prefix) {
                return Err(KvError::Other(anyhow::anyhow!("write refused for {key}")));
            }
            self.inner.put(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> KvResult<()> {
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str, limit: usize) -> KvResult<Vec<KvEntry>> {
            self.inner.list(prefix, limit).await
        }
        async fn count(&self, prefix: &str) -> KvResult<usize> {
            self.inner.count(prefix).await
        }
    }

    fn config(batch_size: usize, durable_max_entries: usize) -> QueueConfig {
        QueueConfig {
            batch_size,
            flush_interval_secs: 10,
            max_attempts: 5,
            durable_max_entries,
            durable_ttl_secs: 3600,
        }
    }

    fn queue_with(kv: Arc<dyn KvStore>, backend: Arc<FlakyBackend>, cfg: QueueConfig) -> ClickQueue {
        ClickQueue::new(
            DurableStorage::new(kv.clone(), Duration::from_secs(cfg.durable_ttl_secs), cfg.durable_max_entries),
            OverflowStorage::new(Arc::new(MemoryBlobStore::new())),
            DeadLetterQueue::new(kv),
            backend,
            &cfg,
            Duration::from_secs(1),
        )
    }

    fn event(ts: i64) -> EdgeClickEvent {
        serde_json::from_value(serde_json::json!({"tracking_code": "abc", "timestamp": ts})).unwrap()
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn test_clicks_are_persisted_before_returning() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let queue = queue_with(kv.clone(), Arc::new(FlakyBackend::default()), config(50, 100));

        queue.queue_click(event(1)).await.unwrap();
        queue.queue_click(event(2)).await.unwrap();
        assert_eq!(kv.count("durable:click:abc:").await.unwrap(), 2);
        assert_eq!(queue.buffered().await, 2);
    }

    #[tokio::test]
    async fn test_full_buffer_triggers_flush_and_clears_durable() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let backend = Arc::new(FlakyBackend::default());
        let queue = queue_with(kv.clone(), backend.clone(), config(3, 100));

        for ts in 0..3 {
            queue.queue_click(event(ts)).await.unwrap();
        }
        assert_eq!(backend.delivered.load(Ordering::SeqCst), 3);
        assert_eq!(kv.count("durable:").await.unwrap(), 0);
        assert_eq!(queue.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_five_failures_with_backoff_reach_dead_letters() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let backend = Arc::new(FlakyBackend::default());
        backend.down.store(true, Ordering::SeqCst);
        let queue = queue_with(kv.clone(), backend.clone(), config(50, 100));
        queue.queue_click(event(7)).await.unwrap();

        let mut now = now_millis();
        for attempt in 1..=5u32 {
            let report = queue.flush_at(now).await.unwrap();
            assert_eq!(report.sent, 1, "attempt {attempt}");

            if attempt < 5 {
                // Not due again until the backoff has elapsed
                let wait = backoff(attempt).as_millis() as i64;
                assert_eq!(queue.flush_at(now + wait - 1).await.unwrap().sent, 0);
                now += wait;
            }
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);

        assert_eq!(queue.buffered().await, 0);
        assert_eq!(kv.count("durable:").await.unwrap(), 0);
        let letters = queue.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].letter.click.attempts, 5);
        assert_eq!(letters[0].letter.click.event.timestamp, 7);

        // Nothing left to retry
        assert_eq!(queue.flush_at(now + 1_000_000).await.unwrap().sent, 0);
    }

    #[tokio::test]
    async fn test_replayed_dead_letters_are_delivered() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let backend = Arc::new(FlakyBackend::default());
        backend.down.store(true, Ordering::SeqCst);
        let mut cfg = config(50, 100);
        cfg.max_attempts = 1;
        let queue = queue_with(kv.clone(), backend.clone(), cfg);

        queue.queue_click(event(1)).await.unwrap();
        assert_eq!(queue.flush().await.unwrap().dead_lettered, 1);

        backend.down.store(false, Ordering::SeqCst);
        assert_eq!(queue.replay_dead_letters(None).await.unwrap(), 1);
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 0);
        assert_eq!(queue.flush().await.unwrap().delivered, 1);
    }

    #[tokio::test]
    async fn test_durable_cap_spills_to_overflow_and_reabsorbs() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let backend = Arc::new(FlakyBackend::default());
        backend.down.store(true, Ordering::SeqCst);
        let queue = queue_with(kv.clone(), backend.clone(), config(50, 2));

        assert_eq!(queue.queue_click(event(1)).await.unwrap(), QueueOutcome::Buffered);
        assert_eq!(queue.queue_click(event(2)).await.unwrap(), QueueOutcome::Buffered);
        assert_eq!(queue.queue_click(event(3)).await.unwrap(), QueueOutcome::Spilled);
        assert_eq!(queue.snapshot().await.overflow_blobs, 1);

        backend.down.store(false, Ordering::SeqCst);
        let report = queue.flush().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.reabsorbed, 1);
        assert_eq!(queue.snapshot().await.overflow_blobs, 0);
        assert_eq!(queue.flush().await.unwrap().delivered, 1);
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_letters_in_dead_letter_queue() {
        let kv = Arc::new(FailingPuts::new("durable:"));
        let backend = Arc::new(FlakyBackend::default());
        backend.down.store(true, Ordering::SeqCst);
        let mut cfg = config(50, 100);
        cfg.max_attempts = 1;
        let queue = queue_with(kv.clone(), backend.clone(), cfg);

        queue.queue_click(event(1)).await.unwrap();
        queue.queue_click(event(2)).await.unwrap();
        assert_eq!(queue.flush().await.unwrap().dead_lettered, 2);

        kv.failing.store(true, Ordering::SeqCst);
        assert!(queue.replay_dead_letters(None).await.is_err());
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 2);
        assert_eq!(queue.buffered().await, 0);

        kv.failing.store(false, Ordering::SeqCst);
        backend.down.store(false, Ordering::SeqCst);
        assert_eq!(queue.replay_dead_letters(None).await.unwrap(), 2);
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 0);
        assert_eq!(queue.flush().await.unwrap().delivered, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_write_failure_keeps_clicks_scheduled() {
        let kv = Arc::new(FailingPuts::new("dlq:"));
        kv.failing.store(true, Ordering::SeqCst);
        let backend = Arc::new(FlakyBackend::default());
        backend.down.store(true, Ordering::SeqCst);
        let mut cfg = config(50, 100);
        cfg.max_attempts = 1;
        let queue = queue_with(kv.clone(), backend.clone(), cfg);

        queue.queue_click(event(1)).await.unwrap();
        queue.queue_click(event(2)).await.unwrap();
        let report = queue.flush().await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(queue.buffered().await, 2);

        kv.failing.store(false, Ordering::SeqCst);
        backend.down.store(false, Ordering::SeqCst);
        let report = queue.flush_at(now_millis() + 60_000).await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(kv.count("durable:").await.unwrap(), 0);
        assert_eq!(queue.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_clicks_persisted_by_another_process_are_flushed() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let backend = Arc::new(FlakyBackend::default());
        let running = queue_with(kv.clone(), backend.clone(), config(50, 100));
        let operator = queue_with(kv.clone(), backend.clone(), config(50, 100));

        operator.queue_click(event(5)).await.unwrap();
        assert_eq!(running.buffered().await, 0);

        let report = running.flush().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(kv.count("durable:").await.unwrap(), 0);
        assert_eq!(backend.delivered.load(Ordering::SeqCst), 1);
    }
}
