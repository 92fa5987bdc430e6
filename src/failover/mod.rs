//! Keeps redirects working while the backend is slow or down
//!
//! Offer and tenant configuration are cached in the shared store, backend
//! health is tracked with a short-lived local cache in front of a shared one,
//! and clicks that no queue path accepted are parked in an emergency store.

use moka::future::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, BackendError};
use crate::models::{BackendHealthStatus, EdgeClickEvent, OfferConfig, OfferStatus, TenantStatus};
use crate::storage::{delete_prefix, get_json, put_json, KvResult, KvStore};

pub const HEALTH_KEY: &str = "health:backend";
pub const OFFER_CACHE_TTL: Duration = Duration::from_secs(30 * 60);
pub const TENANT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const EMERGENCY_TTL: Duration = Duration::from_secs(24 * 3600);
const SHARED_HEALTH_FRESHNESS_MS: i64 = 30_000;
const LOCAL_HEALTH_TTL: Duration = Duration::from_secs(10);
const EMERGENCY_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    BackendDown,
    TenantSuspended,
    Maintenance,
    Error,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::BackendDown => "backend_down",
            FallbackReason::TenantSuspended => "tenant_suspended",
            FallbackReason::Maintenance => "maintenance",
            FallbackReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub enum OfferLookup {
    Found { offer: OfferConfig, cached: bool },
    NotFound,
    BackendDown,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EmergencyFlush {
    pub attempted: usize,
    pub delivered: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailoverSnapshot {
    pub enabled: bool,
    pub backend: BackendHealthStatus,
    pub cached_offers: usize,
    pub cached_tenants: usize,
    pub emergency_clicks: usize,
    pub default_fallback_url: String,
}

fn offer_key(tracking_code: &str) -> String {
    format!("offer:{tracking_code}")
}

fn tenant_key(tenant_id: &str) -> String {
    format!("tenant:{tenant_id}")
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct FailoverManager {
    kv: Arc<dyn KvStore>,
    backend: Arc<dyn BackendClient>,
    local_health: Cache<&'static str, BackendHealthStatus>,
    default_fallback_url: String,
    timeout: Duration,
    enabled: bool,
}

impl FailoverManager {
    pub fn new(
        kv: Arc<dyn KvStore>,
        backend: Arc<dyn BackendClient>,
        default_fallback_url: String,
        timeout: Duration,
        enabled: bool,
    ) -> Self {
        let local_health = Cache::builder()
            .max_capacity(1)
            .time_to_live(LOCAL_HEALTH_TTL)
            .build();

        Self {
            kv,
            backend,
            local_health,
            default_fallback_url,
            timeout,
            enabled,
        }
    }

    pub fn default_fallback_url(&self) -> &str {
        &self.default_fallback_url
    }

    /// Last known health without probing: local cache, then the shared entry
    pub async fn known_health(&self) -> Option<BackendHealthStatus> {
        if let Some(status) = self.local_health.get(&HEALTH_KEY).await {
            return Some(status);
        }
        match get_json::<BackendHealthStatus>(self.kv.as_ref(), HEALTH_KEY).await {
            Ok(Some(status)) if now_millis() - status.last_check <= SHARED_HEALTH_FRESHNESS_MS => {
                self.local_health.insert(HEALTH_KEY, status.clone()).await;
                Some(status)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "failed to read shared backend health");
                None
            }
        }
    }

    /// Cached health, probing the backend when both caches are stale
    pub async fn check_health(&self) -> BackendHealthStatus {
        if let Some(status) = self.known_health().await {
            return status;
        }
        self.probe().await
    }

    pub async fn probe(&self) -> BackendHealthStatus {
        match tokio::time::timeout(self.timeout, self.backend.health()).await {
            Ok(Ok(latency)) => self.record_success(latency).await,
            Ok(Err(e)) => self.record_failure(&e.to_string()).await,
            Err(_) => self.record_failure("health probe timed out").await,
        }
    }

    async fn previous_health(&self) -> BackendHealthStatus {
        if let Some(status) = self.local_health.get(&HEALTH_KEY).await {
            return status;
        }
        get_json(self.kv.as_ref(), HEALTH_KEY)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(BackendHealthStatus::unknown)
    }

    pub async fn record_success(&self, latency: Duration) -> BackendHealthStatus {
        let previous = self.previous_health().await;
        let now = now_millis();
        let status = BackendHealthStatus {
            healthy: true,
            last_check: now,
            last_success: Some(now),
            consecutive_failures: 0,
            latency_ms: latency.as_millis() as u64,
        };
        if !previous.healthy {
            info!("backend recovered after {} failed checks", previous.consecutive_failures);
        }
        self.store_health(&status).await;
        status
    }

    pub async fn record_failure(&self, error: &str) -> BackendHealthStatus {
        let previous = self.previous_health().await;
        let status = BackendHealthStatus {
            healthy: false,
            last_check: now_millis(),
            last_success: previous.last_success,
            consecutive_failures: previous.consecutive_failures + 1,
            latency_ms: previous.latency_ms,
        };
        warn!(
            error = %error,
            consecutive_failures = status.consecutive_failures,
            "backend marked unhealthy"
        );
        self.store_health(&status).await;
        status
    }

    async fn store_health(&self, status: &BackendHealthStatus) {
        self.local_health.insert(HEALTH_KEY, status.clone()).await;
        if let Err(e) = put_json(self.kv.as_ref(), HEALTH_KEY, status, None).await {
            warn!(error = %e, "failed to persist backend health");
        }
    }

    /// Cached offer, or a backend fetch bounded by the configured timeout
    pub async fn get_offer(&self, tracking_code: &str) -> OfferLookup {
        let key = offer_key(tracking_code);
        match get_json::<OfferConfig>(self.kv.as_ref(), &key).await {
            Ok(Some(offer)) => return OfferLookup::Found { offer, cached: true },
            Ok(None) => {}
            Err(e) => warn!(tracking_code = %tracking_code, error = %e, "offer cache read failed"),
        }

        if self.enabled {
            if let Some(health) = self.known_health().await {
                if !health.healthy {
                    debug!(tracking_code = %tracking_code, "backend known down, skipping offer fetch");
                    return OfferLookup::BackendDown;
                }
            }
        }

        let fetched = match tokio::time::timeout(self.timeout, self.backend.fetch_offer(tracking_code)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.timeout)),
        };

        match fetched {
            Ok(Some(offer)) => {
                if let Err(e) = self.cache_offer(tracking_code, &offer).await {
                    warn!(tracking_code = %tracking_code, error = %e, "failed to cache offer");
                }
                OfferLookup::Found { offer, cached: false }
            }
            Ok(None) => OfferLookup::NotFound,
            Err(e) => {
                self.record_failure(&e.to_string()).await;
                OfferLookup::BackendDown
            }
        }
    }

    pub async fn cache_offer(&self, tracking_code: &str, offer: &OfferConfig) -> KvResult<()> {
        put_json(self.kv.as_ref(), &offer_key(tracking_code), offer, Some(OFFER_CACHE_TTL)).await
    }

    pub async fn cached_offer(&self, tracking_code: &str) -> Option<OfferConfig> {
        get_json(self.kv.as_ref(), &offer_key(tracking_code))
            .await
            .ok()
            .flatten()
    }

    /// Tenant status; unknown or unreachable tenants are treated as serving
    pub async fn get_tenant(&self, tenant_id: &str) -> Option<TenantStatus> {
        let key = tenant_key(tenant_id);
        if let Ok(Some(status)) = get_json::<TenantStatus>(self.kv.as_ref(), &key).await {
            return Some(status);
        }

        let fetched = tokio::time::timeout(self.timeout, self.backend.fetch_tenant(tenant_id)).await;
        match fetched {
            Ok(Ok(Some(status))) => {
                if let Err(e) = put_json(self.kv.as_ref(), &key, &status, Some(TENANT_CACHE_TTL)).await {
                    warn!(tenant_id = %tenant_id, error = %e, "failed to cache tenant status");
                }
                Some(status)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                debug!(tenant_id = %tenant_id, error = %e, "tenant lookup failed");
                None
            }
            Err(_) => None,
        }
    }

    pub async fn cache_tenant(&self, status: &TenantStatus) -> KvResult<()> {
        put_json(self.kv.as_ref(), &tenant_key(&status.id), status, Some(TENANT_CACHE_TTL)).await
    }

    /// Best-known destination when a request cannot be routed normally
    pub async fn fallback_url(&self, reason: FallbackReason, tracking_code: Option<&str>) -> String {
        if reason == FallbackReason::Maintenance {
            return self.default_fallback_url.clone();
        }

        let offer = match tracking_code {
            Some(code) => self.cached_offer(code).await,
            None => None,
        };

        if reason == FallbackReason::TenantSuspended {
            if let Some(offer) = &offer {
                if let Ok(Some(tenant)) =
                    get_json::<TenantStatus>(self.kv.as_ref(), &tenant_key(&offer.tenant_id)).await
                {
                    if let Some(url) = tenant.fallback_url.filter(|u| !u.is_empty()) {
                        return url;
                    }
                }
            }
            return self.default_fallback_url.clone();
        }

        match offer {
            Some(offer) if offer.status != OfferStatus::Paused => offer.fallback_or_landing().to_string(),
            _ => self.default_fallback_url.clone(),
        }
    }

    pub async fn store_emergency_click(&self, event: &EdgeClickEvent) -> KvResult<()> {
        let key = format!("emergency:{}", event.storage_key());
        put_json(self.kv.as_ref(), &key, event, Some(EMERGENCY_TTL)).await?;
        warn!(tracking_code = %event.tracking_code, "click parked in emergency store");
        Ok(())
    }

    pub async fn emergency_count(&self) -> usize {
        self.kv.count("emergency:").await.unwrap_or(0)
    }

    /// Re-deliver parked clicks, deleting only the batches the backend acknowledged
    pub async fn flush_emergency_clicks(&self) -> KvResult<EmergencyFlush> {
        let mut report = EmergencyFlush::default();
        let mut skip = 0;

        loop {
            let entries = self.kv.list("emergency:", skip + EMERGENCY_BATCH).await?;
            let batch = &entries[skip.min(entries.len())..];
            if batch.is_empty() {
                break;
            }

            let mut keys = Vec::with_capacity(batch.len());
            let mut events = Vec::with_capacity(batch.len());
            for entry in batch {
                match serde_json::from_str::<EdgeClickEvent>(&entry.value) {
                    Ok(event) => {
                        keys.push(entry.key.clone());
                        events.push(event);
                    }
                    Err(e) => {
                        warn!(key = %entry.key, error = %e, "unreadable emergency click left in place");
                        skip += 1;
                    }
                }
            }
            report.attempted += events.len();

            if events.is_empty() {
                continue;
            }
            match tokio::time::timeout(self.timeout, self.backend.send_clicks(&events)).await {
                Ok(Ok(())) => {
                    for key in &keys {
                        self.kv.delete(key).await?;
                    }
                    report.delivered += events.len();
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "emergency flush stopped, backend rejected batch");
                    break;
                }
                Err(_) => {
                    warn!("emergency flush stopped, backend timed out");
                    break;
                }
            }
        }

        report.remaining = self.emergency_count().await;
        if report.delivered > 0 {
            info!(delivered = report.delivered, remaining = report.remaining, "emergency clicks flushed");
        }
        Ok(report)
    }

    pub async fn invalidate_offer(&self, tracking_code: &str) -> KvResult<()> {
        self.kv.delete(&offer_key(tracking_code)).await
    }

    pub async fn invalidate_tenant(&self, tenant_id: &str) -> KvResult<()> {
        self.kv.delete(&tenant_key(tenant_id)).await
    }

    /// Drop every cached offer and tenant and forget backend health
    pub async fn invalidate_all(&self) -> KvResult<usize> {
        let offers = delete_prefix(self.kv.as_ref(), "offer:").await?;
        let tenants = delete_prefix(self.kv.as_ref(), "tenant:").await?;
        self.kv.delete(HEALTH_KEY).await?;
        self.local_health.invalidate_all();
        Ok(offers + tenants)
    }

    pub async fn snapshot(&self) -> FailoverSnapshot {
        FailoverSnapshot {
            enabled: self.enabled,
            backend: self
                .known_health()
                .await
                .unwrap_or_else(BackendHealthStatus::unknown),
            cached_offers: self.kv.count("offer:").await.unwrap_or(0),
            cached_tenants: self.kv.count("tenant:").await.unwrap_or(0),
            emergency_clicks: self.emergency_count().await,
            default_fallback_url: self.default_fallback_url.clone(),
        }
    }
}
