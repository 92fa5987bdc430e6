//! Per-request sequencing of the click pipeline
//!
//! `handle_click` runs validation, detection and routing, returns where to
//! send the user and hands back the work that must happen after the
//! redirect as an explicit list of [`DeferredTask`]s.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::BackendClient;
use crate::config::{Config, FeatureFlags};
use crate::detection::{
    BotDetection, BotDetector, DeviceDetector, GeoIpService, GeoValidator, RuleResolver,
};
use crate::failover::{EmergencyFlush, FailoverManager, FailoverSnapshot, FallbackReason, OfferLookup};
use crate::link::{LinkInspection, LinkRejection, LinkValidator};
use crate::metrics::{Counter, EdgeMetrics, MetricsSnapshot};
use crate::models::{
    new_event_id, BackendHealthStatus, ClickMeta, EdgeClickEvent, EdgeRequest, OfferConfig,
    OfferStatus,
};
use crate::queue::{
    ClickQueue, DeadLetterQueue, DurableStorage, FlushReport, OverflowStorage, QueueError,
    QueueSnapshot,
};
use crate::routing::SmartRouter;
use crate::storage::{BlobStore, KvResult, KvStore};

/// Why a request was sent to a fallback instead of being routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Link(LinkRejection),
    OfferNotFound,
    OfferPaused,
    TenantSuspended,
    BotBlocked,
    BackendDown,
    /// Country code; empty when unknown
    GeoBlocked(String),
    /// Already rendered as `device_{mode}_{type}`
    DeviceBlocked(String),
    CapExceeded,
    RuleBlocked,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Link(reason) => f.write_str(reason.as_str()),
            RejectReason::OfferNotFound => f.write_str("offer_not_found"),
            RejectReason::OfferPaused => f.write_str("offer_paused"),
            RejectReason::TenantSuspended => f.write_str("tenant_suspended"),
            RejectReason::BotBlocked => f.write_str("bot_blocked"),
            RejectReason::BackendDown => f.write_str("backend_down"),
            RejectReason::GeoBlocked(country) => write!(f, "geo_blocked_{country}"),
            RejectReason::DeviceBlocked(reason) => f.write_str(reason),
            RejectReason::CapExceeded => f.write_str("cap_exceeded"),
            RejectReason::RuleBlocked => f.write_str("rule_blocked"),
        }
    }
}

/// Work scheduled after the redirect has been returned
#[derive(Debug, Clone)]
pub enum DeferredTask {
    QueueClick(Box<EdgeClickEvent>),
    IncrementCap { offer_id: String },
}

#[derive(Debug, Clone)]
pub struct ClickOutcome {
    pub location: String,
    /// Router decision kind, or `rejected`
    pub decision: String,
    pub reason: Option<RejectReason>,
    pub tracking_code: Option<String>,
    pub deferred: Vec<DeferredTask>,
}

impl ClickOutcome {
    fn rejected(reason: RejectReason, location: String, tracking_code: Option<String>) -> Self {
        Self {
            location,
            decision: "rejected".to_string(),
            reason: Some(reason),
            tracking_code,
            deferred: Vec::new(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.reason.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTarget {
    Offer,
    Tenant,
    Geo,
    Device,
    All,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlushSummary {
    pub queue: FlushReport,
    pub emergency: EmergencyFlush,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeStatus {
    pub status: &'static str,
    pub edge_location: String,
    pub backend: BackendHealthStatus,
    pub buffered_clicks: usize,
    pub dead_letters: usize,
    pub emergency_clicks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub environment: String,
    pub edge_location: String,
    pub config: Config,
    pub geoip_configured: bool,
    pub metrics: MetricsSnapshot,
    pub queue: QueueSnapshot,
    pub failover: FailoverSnapshot,
}

pub struct EdgeRouter {
    config: Config,
    kv: Arc<dyn KvStore>,
    links: LinkValidator,
    bots: BotDetector,
    geo: GeoValidator,
    devices: DeviceDetector,
    router: SmartRouter,
    failover: Arc<FailoverManager>,
    queue: Arc<ClickQueue>,
    metrics: Arc<EdgeMetrics>,
    geoip_configured: bool,
    /// Post-redirect work still running; drained before shutdown
    deferred: Mutex<JoinSet<()>>,
}

impl EdgeRouter {
    pub fn new(
        config: Config,
        kv: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
        backend: Arc<dyn BackendClient>,
        geoip: Option<Arc<GeoIpService>>,
    ) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.backend.timeout_secs.max(1));
        let links = LinkValidator::new(&config.signing, Arc::clone(&kv))?;
        let rules = RuleResolver::new(Arc::clone(&kv)).with_backend(Arc::clone(&backend));

        let queue = ClickQueue::new(
            DurableStorage::new(
                Arc::clone(&kv),
                Duration::from_secs(config.queue.durable_ttl_secs),
                config.queue.durable_max_entries,
            ),
            OverflowStorage::new(blobs),
            DeadLetterQueue::new(Arc::clone(&kv)),
            Arc::clone(&backend),
            &config.queue,
            timeout,
        );

        let failover = FailoverManager::new(
            Arc::clone(&kv),
            backend,
            config.default_fallback_url.clone(),
            timeout,
            config.features.failover,
        );

        let geoip_configured = geoip.as_ref().is_some_and(|g| g.is_configured());

        Ok(Self {
            links,
            bots: BotDetector::new(),
            geo: GeoValidator::new(rules.clone(), geoip),
            devices: DeviceDetector::new(rules),
            router: SmartRouter::new(Arc::clone(&kv)),
            failover: Arc::new(failover),
            queue: Arc::new(queue),
            metrics: Arc::new(EdgeMetrics::new()?),
            geoip_configured,
            deferred: Mutex::new(JoinSet::new()),
            kv,
            config,
        })
    }

    pub fn with_bot_detector(mut self, bots: BotDetector) -> Self {
        self.bots = bots;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn features(&self) -> &FeatureFlags {
        &self.config.features
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn links(&self) -> &LinkValidator {
        &self.links
    }

    pub fn geo(&self) -> &GeoValidator {
        &self.geo
    }

    pub fn devices(&self) -> &DeviceDetector {
        &self.devices
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    pub fn queue(&self) -> &Arc<ClickQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<EdgeMetrics> {
        &self.metrics
    }

    /// Decide where a click goes; never fails, rejections carry a fallback location
    pub async fn handle_click(&self, signed_code: &str, request: &EdgeRequest) -> ClickOutcome {
        let started = Instant::now();
        self.metrics.incr(Counter::Requests);

        let outcome = self.evaluate(signed_code, request, started).await;

        match &outcome.reason {
            Some(reason) => {
                self.metrics.incr(Counter::Fallbacks);
                self.metrics.record_rejection(&reason.to_string());
                info!(
                    tracking_code = outcome.tracking_code.as_deref().unwrap_or("-"),
                    reason = %reason,
                    "click rejected"
                );
            }
            None => self.metrics.incr(Counter::Redirects),
        }
        self.metrics.record_latency(started.elapsed());
        outcome
    }

    async fn evaluate(&self, signed_code: &str, request: &EdgeRequest, started: Instant) -> ClickOutcome {
        let features = &self.config.features;
        let default_fallback = || self.config.default_fallback_url.clone();

        let validation = self.links.validate(signed_code).await;
        let tracking_code = match (validation.valid, validation.tracking_code.clone()) {
            (true, Some(code)) => code,
            (_, code) => {
                self.metrics.incr(Counter::InvalidLinks);
                let reason = validation.reason.unwrap_or(LinkRejection::InvalidFormat);
                return ClickOutcome::rejected(RejectReason::Link(reason), default_fallback(), code);
            }
        };
        self.metrics.incr(Counter::ValidLinks);
        if validation.is_legacy {
            self.metrics.incr(Counter::LegacyLinks);
        }
        let code = Some(tracking_code.clone());

        let geo = self.geo.extract(request);

        let bot = if features.bot_detection {
            self.bots.detect(request, geo.asn, geo.as_org.as_deref(), geo.country.as_deref())
        } else {
            BotDetection::clean()
        };
        if features.bot_detection && bot.risk_score >= self.config.bot_block_threshold {
            self.metrics.incr(Counter::BotsBlocked);
            debug!(
                tracking_code = %tracking_code,
                risk_score = bot.risk_score,
                indicators = ?bot.indicators,
                "bot blocked"
            );
            return ClickOutcome::rejected(RejectReason::BotBlocked, default_fallback(), code);
        }

        let offer = match self.failover.get_offer(&tracking_code).await {
            OfferLookup::Found { offer, cached } => {
                self.metrics.incr(if cached { Counter::CacheHits } else { Counter::CacheMisses });
                offer
            }
            OfferLookup::NotFound => {
                self.metrics.incr(Counter::CacheMisses);
                return ClickOutcome::rejected(RejectReason::OfferNotFound, default_fallback(), code);
            }
            OfferLookup::BackendDown => {
                self.metrics.incr(Counter::CacheMisses);
                self.metrics.incr(Counter::BackendErrors);
                let location = self
                    .failover
                    .fallback_url(FallbackReason::BackendDown, Some(&tracking_code))
                    .await;
                return ClickOutcome::rejected(RejectReason::BackendDown, location, code);
            }
        };

        if offer.status == OfferStatus::Paused {
            return ClickOutcome::rejected(RejectReason::OfferPaused, self.offer_fallback(&offer), code);
        }

        if let Some(tenant) = self.failover.get_tenant(&offer.tenant_id).await {
            if !tenant.is_serving() {
                let location = self
                    .failover
                    .fallback_url(FallbackReason::TenantSuspended, Some(&tracking_code))
                    .await;
                return ClickOutcome::rejected(RejectReason::TenantSuspended, location, code);
            }
        }

        if features.geo_validation {
            let decision = self.geo.validate(&offer, &geo).await;
            if !decision.allowed {
                self.metrics.incr(Counter::GeoBlocked);
                let country = geo.country.clone().unwrap_or_default();
                return ClickOutcome::rejected(
                    RejectReason::GeoBlocked(country),
                    self.offer_fallback(&offer),
                    code,
                );
            }
        }

        let device = self.devices.detect(request.user_agent());
        if features.device_detection {
            let decision = self.devices.validate(&offer, &device).await;
            if !decision.allowed {
                self.metrics.incr(Counter::DeviceBlocked);
                return ClickOutcome::rejected(
                    RejectReason::DeviceBlocked(decision.reason),
                    self.offer_fallback(&offer),
                    code,
                );
            }
        }

        let decision = self.router.route(&offer, &geo, &device, request).await;
        if decision.capped {
            self.metrics.incr(Counter::Capped);
            return ClickOutcome::rejected(RejectReason::CapExceeded, decision.destination, code);
        }
        if decision.is_blocked() {
            return ClickOutcome::rejected(RejectReason::RuleBlocked, decision.destination, code);
        }

        let header = |name: &str| request.header(name).unwrap_or("").to_string();
        let event = EdgeClickEvent {
            event_id: new_event_id(),
            tracking_code: tracking_code.clone(),
            tenant_id: offer.tenant_id.clone(),
            offer_id: offer.id.clone(),
            user_offer_id: offer.user_offer_id.clone(),
            country: geo.country.clone().unwrap_or_default(),
            region: geo.region.clone().unwrap_or_default(),
            city: geo.city.clone().unwrap_or_default(),
            device: device.device_type.as_str().to_string(),
            browser: device.browser_name().to_string(),
            os: device.os_name().to_string(),
            ip: request.client_ip.to_string(),
            timestamp: request.received_at,
            user_agent: request.user_agent().to_string(),
            referer: header("referer"),
            accept_language: header("accept-language"),
            edge_location: self.config.edge_location.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            router_decision: decision.kind.as_str().to_string(),
            final_destination: decision.destination.clone(),
            meta: ClickMeta {
                variant_id: decision.variant_id.clone(),
                rotation_index: decision.rotation_index,
                rule_id: decision.rule_id.clone(),
                asn: geo.asn,
                is_legacy: validation.is_legacy,
                bot_score: bot.risk_score,
                extra: Default::default(),
            },
        };

        ClickOutcome {
            location: decision.destination,
            decision: decision.kind.as_str().to_string(),
            reason: None,
            tracking_code: code,
            deferred: vec![
                DeferredTask::QueueClick(Box::new(event)),
                DeferredTask::IncrementCap { offer_id: offer.id },
            ],
        }
    }

    /// Policy rejections never go to the landing page
    fn offer_fallback(&self, offer: &OfferConfig) -> String {
        offer
            .fallback_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or(&self.config.default_fallback_url)
            .to_string()
    }

    /// Execute deferred work; a click no queue path accepted goes to the emergency store
    pub async fn run_deferred(&self, tasks: Vec<DeferredTask>) {
        for task in tasks {
            match task {
                DeferredTask::QueueClick(event) => {
                    let event = *event;
                    match self.queue.queue_click(event.clone()).await {
                        Ok(_) => self.metrics.incr(Counter::ClicksQueued),
                        Err(e) => {
                            self.metrics.incr(Counter::QueueFailures);
                            warn!(tracking_code = %event.tracking_code, error = %e, "click queue rejected event");
                            if let Err(e) = self.failover.store_emergency_click(&event).await {
                                error!(
                                    tracking_code = %event.tracking_code,
                                    event_id = %event.event_id,
                                    error = %e,
                                    "click could not be stored anywhere"
                                );
                            }
                        }
                    }
                }
                DeferredTask::IncrementCap { offer_id } => {
                    self.router.record_click(&offer_id).await;
                }
            }
        }
    }

    fn deferred_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.deferred.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run deferred work on its own task so the response is not held up.
    /// Returns false when there was nothing to run.
    pub fn spawn_deferred(self: &Arc<Self>, tasks: Vec<DeferredTask>) -> bool {
        if tasks.is_empty() {
            return false;
        }
        let edge = Arc::clone(self);
        let mut running = self.deferred_tasks();
        // Reap finished tasks so the set only holds in-flight work
        while let Some(result) = running.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "deferred click task failed");
            }
        }
        running.spawn(async move { edge.run_deferred(tasks).await });
        true
    }

    /// Wait for every spawned deferred task; returns how many were awaited
    pub async fn drain_deferred(&self) -> usize {
        let mut drained = 0;
        loop {
            let mut running = std::mem::take(&mut *self.deferred_tasks());
            if running.is_empty() {
                return drained;
            }
            while let Some(result) = running.join_next().await {
                drained += 1;
                if let Err(e) = result {
                    error!(error = %e, "deferred click task failed");
                }
            }
        }
    }

    pub fn verify(&self, signed_code: &str) -> LinkInspection {
        self.links.inspect(signed_code)
    }

    /// Drop cached configuration; returns how many entries were removed
    pub async fn refresh_cache(&self, target: CacheTarget, id: Option<&str>) -> KvResult<usize> {
        match target {
            CacheTarget::Offer => match id {
                Some(code) => self.failover.invalidate_offer(code).await.map(|_| 1),
                None => crate::storage::delete_prefix(self.kv.as_ref(), "offer:").await,
            },
            CacheTarget::Tenant => match id {
                Some(tenant) => self.failover.invalidate_tenant(tenant).await.map(|_| 1),
                None => crate::storage::delete_prefix(self.kv.as_ref(), "tenant:").await,
            },
            CacheTarget::Geo => self.geo.invalidate(id).await,
            CacheTarget::Device => self.devices.invalidate(id).await,
            CacheTarget::All => {
                let mut removed = self.failover.invalidate_all().await?;
                removed += self.geo.invalidate(None).await?;
                removed += self.devices.invalidate(None).await?;
                Ok(removed)
            }
        }
    }

    /// Force a queue flush and re-deliver the emergency store
    pub async fn flush(&self) -> Result<FlushSummary, QueueError> {
        let queue = self.queue.flush().await?;
        let emergency = self.failover.flush_emergency_clicks().await?;
        Ok(FlushSummary { queue, emergency })
    }

    /// Probe the backend; while it answers, parked emergency clicks are re-delivered
    pub async fn probe_backend(&self) -> BackendHealthStatus {
        let status = self.failover.probe().await;
        if status.healthy && self.failover.emergency_count().await > 0 {
            match self.failover.flush_emergency_clicks().await {
                Ok(report) => info!(
                    delivered = report.delivered,
                    remaining = report.remaining,
                    "emergency clicks re-delivered after backend recovery"
                ),
                Err(e) => warn!(error = %e, "emergency flush after backend recovery failed"),
            }
        }
        status
    }

    pub async fn status(&self) -> EdgeStatus {
        let backend = self.failover.check_health().await;
        let queue = self.queue.snapshot().await;
        let emergency_clicks = self.failover.emergency_count().await;
        let status = if backend.healthy && queue.dead_letters == 0 && emergency_clicks == 0 {
            "healthy"
        } else {
            "degraded"
        };
        EdgeStatus {
            status,
            edge_location: self.config.edge_location.clone(),
            backend,
            buffered_clicks: queue.buffered,
            dead_letters: queue.dead_letters,
            emergency_clicks,
        }
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            environment: self.config.environment.clone(),
            edge_location: self.config.edge_location.clone(),
            config: self.config.clone(),
            geoip_configured: self.geoip_configured,
            metrics: self.metrics.snapshot(),
            queue: self.queue.snapshot().await,
            failover: self.failover.snapshot().await,
        }
    }

    pub async fn persist_metrics(&self) {
        self.metrics
            .persist(self.kv.as_ref(), &self.config.edge_location)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendResult};
    use crate::models::{GeoRule, RuleMode, RuleScope, RuleStatus, TenantState, TenantStatus};
    use crate::storage::{MemoryBlobStore, MemoryKv};
    use async_trait::async_trait;
    use axum::http::{HeaderMap, HeaderValue};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubBackend {
        down: AtomicBool,
        suspended: AtomicBool,
        offers: Mutex<Vec<OfferConfig>>,
        delivered: Mutex<Vec<EdgeClickEvent>>,
    }

    #[async_trait]
    impl BackendClient for StubBackend {
        async fn fetch_offer(&self, tracking_code: &str) -> BackendResult<Option<OfferConfig>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("down".into()));
            }
            Ok(self
                .offers
                .lock()
                .unwrap()
                .iter()
                .find(|o| o.id == tracking_code)
                .cloned())
        }

        async fn fetch_tenant(&self, tenant_id: &str) -> BackendResult<Option<TenantStatus>> {
            let status = if self.suspended.load(Ordering::SeqCst) {
                TenantState::Suspended
            } else {
                TenantState::Active
            };
            Ok(Some(TenantStatus {
                id: tenant_id.to_string(),
                status,
                fallback_url: Some("https://tenant.example/paused".into()),
            }))
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
            if self.down.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("down".into()));
            }
            self.delivered.lock().unwrap().extend_from_slice(events);
            Ok(())
        }

        async fn health(&self) -> BackendResult<Duration> {
            Ok(Duration::from_millis(1))
        }
    }

    fn offer(code: &str) -> OfferConfig {
        serde_json::from_value(serde_json::json!({
            "id": code,
            "tenant_id": "t1",
            "landing_url": "https://shop.example/landing",
            "fallback_url": "https://shop.example/sorry"
        }))
        .unwrap()
    }

    fn setup() -> (Arc<EdgeRouter>, Arc<StubBackend>) {
        let backend = Arc::new(StubBackend::default());
        backend.offers.lock().unwrap().push(offer("summer"));
        let edge = EdgeRouter::new(
            Config::default(),
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryBlobStore::new()),
            backend.clone(),
            None,
        )
        .unwrap();
        (Arc::new(edge), backend)
    }

    fn browser_request(country: &str) -> EdgeRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            "user-agent",
            HeaderValue::from_static(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
            ),
        );
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.insert("accept-language", HeaderValue::from_static("en-US"));
        headers.insert("accept-encoding", HeaderValue::from_static("gzip"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("cf-ipcountry", HeaderValue::from_str(country).unwrap());
        EdgeRequest::new("203.0.113.9".parse().unwrap(), headers)
    }

    #[test]
    fn test_reject_reason_taxonomy() {
        assert_eq!(RejectReason::Link(LinkRejection::ReplayAttempt).to_string(), "replay_attempt");
        assert_eq!(RejectReason::GeoBlocked("FR".into()).to_string(), "geo_blocked_FR");
        assert_eq!(RejectReason::CapExceeded.to_string(), "cap_exceeded");
        assert_eq!(RejectReason::OfferPaused.to_string(), "offer_paused");
    }

    #[tokio::test]
    async fn test_valid_click_routes_and_defers_recording() {
        let (edge, _) = setup();
        let link = edge.links().generate("summer");

        let outcome = edge.handle_click(&link, &browser_request("US")).await;
        assert!(!outcome.is_rejected(), "{:?}", outcome.reason);
        assert_eq!(outcome.location, "https://shop.example/landing");
        assert_eq!(outcome.decision, "landing");
        assert_eq!(outcome.deferred.len(), 2);
        // Nothing is queued until the deferred work runs
        assert_eq!(edge.queue().buffered().await, 0);

        edge.run_deferred(outcome.deferred).await;
        assert_eq!(edge.queue().buffered().await, 1);
        assert_eq!(edge.metrics().get(Counter::ClicksQueued), 1);
    }

    #[tokio::test]
    async fn test_spawned_deferred_work_is_drained_before_shutdown() {
        let (edge, _) = setup();
        for _ in 0..3 {
            let link = edge.links().generate("summer");
            let outcome = edge.handle_click(&link, &browser_request("US")).await;
            assert!(edge.spawn_deferred(outcome.deferred));
        }
        assert!(!edge.spawn_deferred(Vec::new()));

        assert!(edge.drain_deferred().await <= 3);
        assert_eq!(edge.queue().buffered().await, 3);
        assert_eq!(edge.metrics().get(Counter::ClicksQueued), 3);
        assert_eq!(edge.drain_deferred().await, 0);
    }

    #[tokio::test]
    async fn test_healthy_backend_redelivers_emergency_clicks() {
        let (edge, backend) = setup();
        let link = edge.links().generate("summer");
        let outcome = edge.handle_click(&link, &browser_request("US")).await;
        let Some(DeferredTask::QueueClick(event)) = outcome.deferred.into_iter().next() else {
            panic!("routed click should queue an event");
        };
        edge.failover().store_emergency_click(&event).await.unwrap();

        backend.down.store(true, Ordering::SeqCst);
        edge.probe_backend().await;
        assert_eq!(edge.failover().emergency_count().await, 1);

        backend.down.store(false, Ordering::SeqCst);
        let status = edge.probe_backend().await;
        assert!(status.healthy);
        assert_eq!(edge.failover().emergency_count().await, 0);
        assert_eq!(backend.delivered.lock().unwrap()[0].event_id, event.event_id);
    }

    #[tokio::test]
    async fn test_replayed_link_falls_back_without_click() {
        let (edge, _) = setup();
        let link = edge.links().generate("summer");

        let first = edge.handle_click(&link, &browser_request("US")).await;
        assert!(!first.is_rejected());

        let second = edge.handle_click(&link, &browser_request("US")).await;
        assert_eq!(second.reason, Some(RejectReason::Link(LinkRejection::ReplayAttempt)));
        assert_eq!(second.location, edge.config().default_fallback_url);
        assert!(second.deferred.is_empty());
    }

    #[tokio::test]
    async fn test_bot_is_blocked_before_offer_lookup() {
        let (edge, _) = setup();
        let link = edge.links().generate("summer");
        let request = EdgeRequest::new("203.0.113.9".parse().unwrap(), HeaderMap::new());

        let outcome = edge.handle_click(&link, &request).await;
        assert_eq!(outcome.reason, Some(RejectReason::BotBlocked));
        assert_eq!(edge.metrics().get(Counter::CacheMisses), 0);
        assert_eq!(edge.metrics().get(Counter::BotsBlocked), 1);
    }

    #[tokio::test]
    async fn test_geo_block_sends_user_to_offer_fallback() {
        let (edge, _) = setup();
        edge.geo()
            .store_rule(&GeoRule {
                id: Some("g1".into()),
                scope: RuleScope::Offer,
                scope_id: Some("summer".into()),
                mode: RuleMode::Block,
                countries: vec!["FR".into()],
                regions: vec![],
                status: RuleStatus::Active,
            })
            .await
            .unwrap();

        let link = edge.links().generate("summer");
        let outcome = edge.handle_click(&link, &browser_request("FR")).await;
        assert_eq!(outcome.reason, Some(RejectReason::GeoBlocked("FR".into())));
        assert_eq!(outcome.location, "https://shop.example/sorry");

        let link = edge.links().generate("summer");
        assert!(!edge.handle_click(&link, &browser_request("US")).await.is_rejected());
    }

    #[tokio::test]
    async fn test_suspended_tenant_uses_tenant_fallback() {
        let (edge, backend) = setup();
        backend.suspended.store(true, Ordering::SeqCst);

        let link = edge.links().generate("summer");
        let outcome = edge.handle_click(&link, &browser_request("US")).await;
        assert_eq!(outcome.reason, Some(RejectReason::TenantSuspended));
        assert_eq!(outcome.location, "https://tenant.example/paused");
    }

    #[tokio::test]
    async fn test_backend_down_uses_cached_offer_then_fallback() {
        let (edge, backend) = setup();
        let link = edge.links().generate("summer");
        assert!(!edge.handle_click(&link, &browser_request("US")).await.is_rejected());

        backend.down.store(true, Ordering::SeqCst);

        // Cached offer keeps routing working
        let link = edge.links().generate("summer");
        let outcome = edge.handle_click(&link, &browser_request("US")).await;
        assert!(!outcome.is_rejected());
        assert_eq!(edge.metrics().get(Counter::CacheHits), 1);

        // Unknown code with the backend down goes to the default fallback
        let link = edge.links().generate("winter");
        let outcome = edge.handle_click(&link, &browser_request("US")).await;
        assert_eq!(outcome.reason, Some(RejectReason::BackendDown));
        assert_eq!(outcome.location, edge.config().default_fallback_url);
    }

    #[tokio::test]
    async fn test_daily_cap_reached_through_deferred_increments() {
        let backend = Arc::new(StubBackend::default());
        let mut capped = offer("capped");
        capped.daily_cap = Some(2);
        backend.offers.lock().unwrap().push(capped);
        let edge = EdgeRouter::new(
            Config::default(),
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryBlobStore::new()),
            backend,
            None,
        )
        .unwrap();

        for _ in 0..2 {
            let link = edge.links().generate("capped");
            let outcome = edge.handle_click(&link, &browser_request("US")).await;
            assert!(!outcome.is_rejected());
            edge.run_deferred(outcome.deferred).await;
        }

        let link = edge.links().generate("capped");
        let outcome = edge.handle_click(&link, &browser_request("US")).await;
        assert_eq!(outcome.reason, Some(RejectReason::CapExceeded));
        assert_eq!(outcome.location, "https://shop.example/sorry");
        assert!(outcome.deferred.is_empty());
    }

    #[tokio::test]
    async fn test_flush_delivers_queued_clicks() {
        let (edge, backend) = setup();
        let link = edge.links().generate("summer");
        let outcome = edge.handle_click(&link, &browser_request("US")).await;
        edge.run_deferred(outcome.deferred).await;

        let summary = edge.flush().await.unwrap();
        assert_eq!(summary.queue.delivered, 1);
        let delivered = backend.delivered.lock().unwrap();
        assert_eq!(delivered[0].tracking_code, "summer");
        assert_eq!(delivered[0].country, "US");
        assert_eq!(delivered[0].device, "desktop");
    }
}
