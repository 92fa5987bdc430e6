use serde::{Deserialize, Serialize};

use super::rules::{DeviceRule, GeoRule};

/// Offer configuration as served by the backend and cached at the edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferConfig {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub advertiser_id: Option<String>,
    #[serde(default)]
    pub user_offer_id: Option<String>,
    pub landing_url: String,
    #[serde(default)]
    pub fallback_url: Option<String>,
    #[serde(default)]
    pub daily_cap: Option<u64>,
    #[serde(default)]
    pub total_cap: Option<u64>,
    #[serde(default)]
    pub daily_clicks: u64,
    #[serde(default)]
    pub total_clicks: u64,
    #[serde(default)]
    pub status: OfferStatus,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub ab_test: Option<AbTestConfig>,
    #[serde(default)]
    pub rotation: Option<RotationConfig>,
    #[serde(default)]
    pub geo_rule: Option<GeoRule>,
    #[serde(default)]
    pub device_rule: Option<DeviceRule>,
}

impl OfferConfig {
    /// The offer's own fallback, or its landing page when none is configured
    pub fn fallback_or_landing(&self) -> &str {
        self.fallback_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or(&self.landing_url)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    #[default]
    Active,
    Paused,
    Capped,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub conditions: Vec<RoutingCondition>,
    pub action: RoutingAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    /// Narrows the subject, e.g. `region` for a geo condition or `browser` for a device one
    #[serde(default)]
    pub field: Option<String>,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Geo,
    Device,
    Isp,
    Connection,
    Time,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Neq,
    In,
    NotIn,
    Gt,
    Lt,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutingAction {
    Redirect { url: String },
    Rotate { destinations: Vec<Destination> },
    AbTest { variants: Vec<Variant> },
    Fallback { urls: Vec<String> },
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default)]
    pub id: Option<String>,
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub url: String,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub mode: RotationMode,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    RoundRobin,
    Weighted,
    /// CTR weighting is computed by the backend; the edge treats it as round-robin
    SmartCtr,
}
