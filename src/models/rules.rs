use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope a geo or device rule applies to, in descending precedence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Offer,
    Advertiser,
    Tenant,
    Global,
}

impl RuleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleScope::Offer => "offer",
            RuleScope::Advertiser => "advertiser",
            RuleScope::Tenant => "tenant",
            RuleScope::Global => "global",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    Allow,
    Block,
}

impl fmt::Display for RuleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleMode::Allow => f.write_str("allow"),
            RuleMode::Block => f.write_str("block"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Active,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoRule {
    #[serde(default)]
    pub id: Option<String>,
    pub scope: RuleScope,
    #[serde(default)]
    pub scope_id: Option<String>,
    pub mode: RuleMode,
    /// ISO country codes; `*` matches any country
    pub countries: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub status: RuleStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
    Bot,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
            DeviceType::Bot => "bot",
            DeviceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRule {
    #[serde(default)]
    pub id: Option<String>,
    pub scope: RuleScope,
    #[serde(default)]
    pub scope_id: Option<String>,
    pub mode: RuleMode,
    /// Empty matches every device type
    #[serde(default)]
    pub device_types: Vec<DeviceType>,
    #[serde(default)]
    pub browsers: Vec<String>,
    #[serde(default)]
    pub os: Vec<String>,
    #[serde(default)]
    pub status: RuleStatus,
}

/// Common view over geo and device rules for scope resolution
pub trait ScopedRule {
    /// Key segment used in the shared store (`rules:{kind}:...`)
    const KIND: &'static str;

    fn scope(&self) -> RuleScope;
    fn scope_id(&self) -> Option<&str>;
    fn is_active(&self) -> bool;
}

impl ScopedRule for GeoRule {
    const KIND: &'static str = "geo";

    fn scope(&self) -> RuleScope {
        self.scope
    }

    fn scope_id(&self) -> Option<&str> {
        self.scope_id.as_deref()
    }

    fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }
}

impl ScopedRule for DeviceRule {
    const KIND: &'static str = "device";

    fn scope(&self) -> RuleScope {
        self.scope
    }

    fn scope_id(&self) -> Option<&str> {
        self.scope_id.as_deref()
    }

    fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }
}
