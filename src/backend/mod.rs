//! Client for the system of record
//!
//! The edge only depends on five backend routes: offer lookup, tenant
//! lookup, scoped rule lookup, batched click ingestion and a liveness probe.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::BackendConfig;
use crate::models::{EdgeClickEvent, OfferConfig, RuleScope, TenantStatus};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Serialize)]
struct ClickBatch<'a> {
    events: &'a [EdgeClickEvent],
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// `Ok(None)` when the backend does not know the tracking code
    async fn fetch_offer(&self, tracking_code: &str) -> BackendResult<Option<OfferConfig>>;

    async fn fetch_tenant(&self, tenant_id: &str) -> BackendResult<Option<TenantStatus>>;

    /// Raw geo or device rule for one scope; `Ok(None)` when none is defined
    async fn fetch_rule(
        &self,
        kind: &str,
        scope: RuleScope,
        scope_id: Option<&str>,
    ) -> BackendResult<Option<serde_json::Value>>;

    /// Deliver a batch; the backend deduplicates on `event_id`
    async fn send_clicks(&self, events: &[EdgeClickEvent]) -> BackendResult<()>;

    /// Probe liveness, returning the round-trip time
    async fn health(&self) -> BackendResult<Duration>;
}

pub struct HttpBackendClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpBackendClient {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = Client::builder()
            .user_agent(concat!("clickedge/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build backend HTTP client: {e}"))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_data<T: for<'de> Deserialize<'de>>(&self, path: &str) -> BackendResult<Option<T>> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let envelope: Envelope<T> = response.json().await?;
        Ok(Some(envelope.data))
    }

    fn classify(&self, error: reqwest::Error) -> BackendError {
        if error.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else {
            BackendError::Http(error)
        }
    }
}

async fn check_status(response: reqwest::Response) -> BackendResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status,
        body: body.chars().take(512).collect(),
    })
}

/// Path segments come from user-controlled URLs
fn encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn fetch_offer(&self, tracking_code: &str) -> BackendResult<Option<OfferConfig>> {
        self.get_data(&format!(
            "/api/internal/edge/offer/{}",
            encode_segment(tracking_code)
        ))
        .await
    }

    async fn fetch_tenant(&self, tenant_id: &str) -> BackendResult<Option<TenantStatus>> {
        self.get_data(&format!(
            "/api/internal/edge/tenant/{}",
            encode_segment(tenant_id)
        ))
        .await
    }

    async fn fetch_rule(
        &self,
        kind: &str,
        scope: RuleScope,
        scope_id: Option<&str>,
    ) -> BackendResult<Option<serde_json::Value>> {
        let mut path = format!(
            "/api/internal/edge/rules/{}/{}",
            encode_segment(kind),
            scope.as_str()
        );
        if let Some(id) = scope_id.filter(|_| scope != RuleScope::Global) {
            path.push('/');
            path.push_str(&encode_segment(id));
        }
        self.get_data(&path).await
    }

    async fn send_clicks(&self, events: &[EdgeClickEvent]) -> BackendResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(self.url("/api/internal/edge-click"))
            .header("x-edge-batch", "true")
            .json(&ClickBatch { events })
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        check_status(response).await?;
        Ok(())
    }

    async fn health(&self) -> BackendResult<Duration> {
        let started = Instant::now();
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        check_status(response).await?;
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_encoding() {
        assert_eq!(encode_segment("abc-123_x.y~"), "abc-123_x.y~");
        assert_eq!(encode_segment("a/b c"), "a%2Fb%20c");
    }
}
