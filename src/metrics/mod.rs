//! Edge counters and latency samples
//!
//! Counters live in a per-edge Prometheus registry and are exported in the
//! text format; the most recent latencies are also kept in a fixed ring so
//! diagnostics can report an exact average and p99. Nothing on the request
//! path waits on persistence.

use dashmap::DashMap;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::storage::{put_json, KvStore};

pub const LATENCY_SAMPLES: usize = 1000;
const METRICS_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Fixed-size ring of the most recent latencies
struct LatencyRing {
    samples: Vec<u64>,
    next: usize,
}

impl LatencyRing {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(LATENCY_SAMPLES),
            next: 0,
        }
    }

    fn push(&mut self, micros: u64) {
        if self.samples.len() < LATENCY_SAMPLES {
            self.samples.push(micros);
        } else {
            self.samples[self.next] = micros;
        }
        self.next = (self.next + 1) % LATENCY_SAMPLES;
    }

    fn summary(&self) -> LatencySummary {
        if self.samples.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();
        // Nearest-rank percentile
        let rank = ((sorted.len() as f64) * 0.99).ceil() as usize;
        let p99 = sorted[rank.clamp(1, sorted.len()) - 1];
        LatencySummary {
            samples: sorted.len(),
            avg_ms: sum as f64 / sorted.len() as f64 / 1000.0,
            p99_ms: p99 as f64 / 1000.0,
            max_ms: sorted[sorted.len() - 1] as f64 / 1000.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub redirects: u64,
    pub valid_links: u64,
    pub invalid_links: u64,
    pub legacy_links: u64,
    pub bots_blocked: u64,
    pub geo_blocked: u64,
    pub device_blocked: u64,
    pub capped: u64,
    pub fallbacks: u64,
    pub backend_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub clicks_queued: u64,
    pub queue_failures: u64,
    pub rejections: std::collections::BTreeMap<String, u64>,
    pub latency: LatencySummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Requests,
    Redirects,
    ValidLinks,
    InvalidLinks,
    LegacyLinks,
    BotsBlocked,
    GeoBlocked,
    DeviceBlocked,
    Capped,
    Fallbacks,
    BackendErrors,
    CacheHits,
    CacheMisses,
    ClicksQueued,
    QueueFailures,
}

impl Counter {
    /// Registration order; a counter's position is its index
    const ALL: [Counter; 15] = [
        Counter::Requests,
        Counter::Redirects,
        Counter::ValidLinks,
        Counter::InvalidLinks,
        Counter::LegacyLinks,
        Counter::BotsBlocked,
        Counter::GeoBlocked,
        Counter::DeviceBlocked,
        Counter::Capped,
        Counter::Fallbacks,
        Counter::BackendErrors,
        Counter::CacheHits,
        Counter::CacheMisses,
        Counter::ClicksQueued,
        Counter::QueueFailures,
    ];

    fn describe(self) -> (&'static str, &'static str) {
        match self {
            Counter::Requests => ("clickedge_requests_total", "Click requests received"),
            Counter::Redirects => ("clickedge_redirects_total", "Clicks routed to an offer destination"),
            Counter::ValidLinks => ("clickedge_valid_links_total", "Signed links that passed validation"),
            Counter::InvalidLinks => ("clickedge_invalid_links_total", "Links rejected by validation"),
            Counter::LegacyLinks => ("clickedge_legacy_links_total", "Unsigned legacy codes accepted"),
            Counter::BotsBlocked => ("clickedge_bots_blocked_total", "Requests blocked as bots"),
            Counter::GeoBlocked => ("clickedge_geo_blocked_total", "Requests blocked by geo rules"),
            Counter::DeviceBlocked => ("clickedge_device_blocked_total", "Requests blocked by device rules"),
            Counter::Capped => ("clickedge_capped_total", "Clicks refused by offer caps"),
            Counter::Fallbacks => ("clickedge_fallbacks_total", "Requests sent to a fallback URL"),
            Counter::BackendErrors => ("clickedge_backend_errors_total", "Offer lookups that hit a backend error"),
            Counter::CacheHits => ("clickedge_cache_hits_total", "Offer lookups served from cache"),
            Counter::CacheMisses => ("clickedge_cache_misses_total", "Offer lookups that went to the backend"),
            Counter::ClicksQueued => ("clickedge_clicks_queued_total", "Clicks accepted by the click queue"),
            Counter::QueueFailures => ("clickedge_queue_failures_total", "Clicks the click queue rejected"),
        }
    }
}

pub struct EdgeMetrics {
    registry: Registry,
    counters: Vec<IntCounter>,
    /// Rejections labelled by reason (`invalid_signature`, `geo_blocked_FR`, ...)
    rejections: IntCounterVec,
    /// Label handles seen so far, for snapshots
    rejection_handles: DashMap<String, IntCounter>,
    latency_seconds: Histogram,
    latency: Mutex<LatencyRing>,
}

impl EdgeMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let mut counters = Vec::with_capacity(Counter::ALL.len());
        for counter in Counter::ALL {
            let (name, help) = counter.describe();
            let metric = IntCounter::new(name, help)?;
            registry.register(Box::new(metric.clone()))?;
            counters.push(metric);
        }

        let rejections = IntCounterVec::new(
            Opts::new("clickedge_rejections_total", "Rejected clicks by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(rejections.clone()))?;

        let latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "clickedge_click_latency_seconds",
                "Time to decide a click redirect in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(latency_seconds.clone()))?;

        Ok(Self {
            registry,
            counters,
            rejections,
            rejection_handles: DashMap::new(),
            latency_seconds,
            latency: Mutex::new(LatencyRing::new()),
        })
    }

    pub fn incr(&self, counter: Counter) {
        self.counters[counter as usize].inc();
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].get()
    }

    pub fn record_rejection(&self, reason: &str) {
        if let Some(handle) = self.rejection_handles.get(reason) {
            handle.inc();
            return;
        }
        let handle = self.rejections.with_label_values(&[reason]);
        handle.inc();
        self.rejection_handles.insert(reason.to_string(), handle);
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latency_seconds.observe(latency.as_secs_f64());
        // A poisoned ring only loses samples
        if let Ok(mut ring) = self.latency.lock() {
            ring.push(latency.as_micros().min(u128::from(u64::MAX)) as u64);
        }
    }

    pub fn latency(&self) -> LatencySummary {
        self.latency
            .lock()
            .map(|ring| ring.summary())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.get(Counter::Requests),
            redirects: self.get(Counter::Redirects),
            valid_links: self.get(Counter::ValidLinks),
            invalid_links: self.get(Counter::InvalidLinks),
            legacy_links: self.get(Counter::LegacyLinks),
            bots_blocked: self.get(Counter::BotsBlocked),
            geo_blocked: self.get(Counter::GeoBlocked),
            device_blocked: self.get(Counter::DeviceBlocked),
            capped: self.get(Counter::Capped),
            fallbacks: self.get(Counter::Fallbacks),
            backend_errors: self.get(Counter::BackendErrors),
            cache_hits: self.get(Counter::CacheHits),
            cache_misses: self.get(Counter::CacheMisses),
            clicks_queued: self.get(Counter::ClicksQueued),
            queue_failures: self.get(Counter::QueueFailures),
            rejections: self
                .rejection_handles
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().get()))
                .collect(),
            latency: self.latency(),
        }
    }

    /// Prometheus text exposition of every registered metric
    pub fn export(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Best effort: a failed write is logged at debug and otherwise ignored
    pub async fn persist(&self, kv: &dyn KvStore, edge_location: &str) {
        let key = format!(
            "metrics:{}:{edge_location}",
            chrono::Utc::now().format("%Y-%m-%d")
        );
        if let Err(e) = put_json(kv, &key, &self.snapshot(), Some(METRICS_TTL)).await {
            debug!(error = %e, "metrics snapshot not persisted");
        }
    }
}
