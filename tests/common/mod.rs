//! Shared helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::Request;
use clickedge::backend::{BackendClient, BackendError, BackendResult};
use clickedge::config::Config;
use clickedge::edge::EdgeRouter;
use clickedge::models::{EdgeClickEvent, OfferConfig, RuleScope, TenantStatus};
use clickedge::storage::{BlobStore, KvStore, MemoryBlobStore, MemoryKv};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::Layer;

/// In-process stand-in for the system of record
#[derive(Default)]
pub struct StubBackend {
    pub down: AtomicBool,
    pub offers: Mutex<Vec<(String, OfferConfig)>>,
    pub tenants: Mutex<Vec<TenantStatus>>,
    pub delivered: Mutex<Vec<EdgeClickEvent>>,
    pub send_calls: AtomicUsize,
}

impl StubBackend {
    pub fn with_offer(self, tracking_code: &str, offer: OfferConfig) -> Self {
        self.offers
            .lock()
            .unwrap()
            .push((tracking_code.to_string(), offer));
        self
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl BackendClient for StubBackend {
    async fn fetch_offer(&self, tracking_code: &str) -> BackendResult<Option<OfferConfig>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("stub backend down".into()));
        }
        Ok(self
            .offers
            .lock()
            .unwrap()
            .iter()
            .find(|(code, _)| code == tracking_code)
            .map(|(_, offer)| offer.clone()))
    }

    async fn fetch_tenant(&self, tenant_id: &str) -> BackendResult<Option<TenantStatus>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("stub backend down".into()));
        }
        Ok(self
            .tenants
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == tenant_id)
            .cloned())
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
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("stub backend down".into()));
        }
        self.delivered.lock().unwrap().extend_from_slice(events);
        Ok(())
    }

    async fn health(&self) -> BackendResult<Duration> {
        if self.down.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable("stub backend down".into()))
        } else {
            Ok(Duration::from_millis(2))
        }
    }
}

pub fn offer(id: &str) -> OfferConfig {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "tenant_id": "tenant-1",
        "landing_url": format!("https://shop.example/{id}"),
        "fallback_url": "https://shop.example/sorry"
    }))
    .unwrap()
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.default_fallback_url = "https://fallback.example/".to_string();
    config.edge_location = "test-edge".to_string();
    config
}

pub fn build_edge(config: Config, backend: Arc<StubBackend>) -> Arc<EdgeRouter> {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    Arc::new(EdgeRouter::new(config, kv, blobs, backend, None).unwrap())
}

/// Headers a desktop browser sends
pub fn browser_request(uri: &str, country: &str) -> Request<axum::body::Body> {
    Request::builder()
        .uri(uri)
        .header(
            "user-agent",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0 Safari/537.36",
        )
        .header("accept", "text/html,application/xhtml+xml")
        .header("accept-language", "en-US,en;q=0.9")
        .header("accept-encoding", "gzip, br")
        .header("connection", "keep-alive")
        .header("cf-ipcountry", country)
        .body(axum::body::Body::empty())
        .unwrap()
}

pub async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Helper layer to inject ConnectInfo for tests
#[derive(Clone)]
pub struct TestConnectInfoLayer;

impl<S> Layer<S> for TestConnectInfoLayer {
    type Service = TestConnectInfoMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TestConnectInfoMiddleware { inner }
    }
}

#[derive(Clone)]
pub struct TestConnectInfoMiddleware<S> {
    inner: S,
}

impl<S, B> tower::Service<Request<B>> for TestConnectInfoMiddleware<S>
where
    S: tower::Service<Request<B>> + Clone,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let addr = SocketAddr::from(([198, 51, 100, 7], 40000));
        req.extensions_mut()
            .insert(axum::extract::connect_info::ConnectInfo(addr));
        self.inner.call(req)
    }
}
