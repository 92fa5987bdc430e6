use base64::prelude::*;
use rand::RngExt;
use serde::{Deserialize, Serialize};

/// Immutable record of a processed click; the unit of durability
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeClickEvent {
    /// Idempotency key for the backend; generated at the edge
    #[serde(default = "new_event_id")]
    pub event_id: String,
    pub tracking_code: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub offer_id: String,
    #[serde(default)]
    pub user_offer_id: Option<String>,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub browser: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub ip: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub referer: String,
    #[serde(default)]
    pub accept_language: String,
    #[serde(default)]
    pub edge_location: String,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub router_decision: String,
    #[serde(default)]
    pub final_destination: String,
    #[serde(default)]
    pub meta: ClickMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClickMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
    #[serde(default)]
    pub is_legacy: bool,
    #[serde(default)]
    pub bot_score: u8,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub fn new_event_id() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 9] = rng.random();
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

impl EdgeClickEvent {
    /// Key fragment shared by the durable buffer, overflow spill and DLQ
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.tracking_code, self.timestamp, self.event_id)
    }
}

/// Retry bookkeeping around a click waiting for delivery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedClick {
    pub event: EdgeClickEvent,
    pub attempts: u32,
    /// Unix milliseconds
    pub queued_at: i64,
    #[serde(default)]
    pub last_attempt: Option<i64>,
    /// Earliest time (unix milliseconds) the next delivery may be tried
    #[serde(default)]
    pub next_attempt_at: i64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedClick {
    pub fn new(event: EdgeClickEvent, now_ms: i64) -> Self {
        Self {
            event,
            attempts: 0,
            queued_at: now_ms,
            last_attempt: None,
            next_attempt_at: now_ms,
            last_error: None,
        }
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.next_attempt_at <= now_ms
    }
}
