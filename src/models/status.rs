use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendHealthStatus {
    pub healthy: bool,
    /// Unix milliseconds of the last probe
    pub last_check: i64,
    #[serde(default)]
    pub last_success: Option<i64>,
    pub consecutive_failures: u32,
    pub latency_ms: u64,
}

impl BackendHealthStatus {
    /// Status assumed before the first probe completes
    pub fn unknown() -> Self {
        Self {
            healthy: true,
            last_check: 0,
            last_success: None,
            consecutive_failures: 0,
            latency_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TenantState {
    Active,
    Suspended,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantStatus {
    pub id: String,
    pub status: TenantState,
    #[serde(default)]
    pub fallback_url: Option<String>,
}

impl TenantStatus {
    pub fn is_serving(&self) -> bool {
        self.status == TenantState::Active
    }
}
