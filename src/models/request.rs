use axum::http::HeaderMap;
use std::net::IpAddr;

/// Everything the edge knows about an inbound tracking request
#[derive(Debug, Clone)]
pub struct EdgeRequest {
    pub client_ip: IpAddr,
    pub headers: HeaderMap,
    /// Unix milliseconds at which the request arrived
    pub received_at: i64,
}

impl EdgeRequest {
    pub fn new(client_ip: IpAddr, headers: HeaderMap) -> Self {
        Self {
            client_ip,
            headers,
            received_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Header value as trimmed UTF-8, `None` when absent or not valid text
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }
}
