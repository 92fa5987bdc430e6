//! User-agent classification and device policy

use serde::Serialize;
use woothee::parser::Parser;

use super::rules::{RuleResolver, RuleTarget};
use crate::models::{DeviceRule, DeviceType, OfferConfig, RuleMode};
use crate::storage::KvResult;

const BOT_PATTERNS: &[&str] = &[
    "bot", "crawler", "spider", "scraper", "slurp", "headless", "phantomjs", "selenium",
    "puppeteer", "playwright", "curl/", "wget", "python-requests", "python-urllib",
    "go-http-client", "java/", "okhttp", "axios", "node-fetch", "libwww-perl", "httpclient",
    "facebookexternalhit", "preview",
];
const TABLET_PATTERNS: &[&str] = &["ipad", "tablet", "kindle", "silk/", "playbook", "sm-t", "nexus 7", "nexus 10"];
const MOBILE_PATTERNS: &[&str] = &[
    "mobile", "iphone", "ipod", "android", "blackberry", "bb10", "opera mini", "iemobile",
    "windows phone", "webos",
];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceInfo {
    pub device_type: DeviceType,
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
}

impl DeviceInfo {
    pub fn browser_name(&self) -> &str {
        self.browser.as_deref().unwrap_or("unknown")
    }

    pub fn os_name(&self) -> &str {
        self.os.as_deref().unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceDecision {
    pub allowed: bool,
    /// `no_rule`, `allowed` or `device_{mode}_{type}`
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

#[derive(Clone)]
pub struct DeviceDetector {
    rules: RuleResolver,
}

impl DeviceDetector {
    pub fn new(rules: RuleResolver) -> Self {
        Self { rules }
    }

    pub fn detect(&self, user_agent: &str) -> DeviceInfo {
        detect_device(user_agent)
    }

    pub async fn resolve_rule(&self, offer: &OfferConfig) -> Option<DeviceRule> {
        self.rules
            .resolve(offer.device_rule.as_ref(), RuleTarget::for_offer(offer))
            .await
    }

    pub async fn validate(&self, offer: &OfferConfig, device: &DeviceInfo) -> DeviceDecision {
        match self.resolve_rule(offer).await {
            Some(rule) => check_device_rule(&rule, device),
            None => DeviceDecision {
                allowed: true,
                reason: "no_rule".to_string(),
                rule_id: None,
            },
        }
    }

    pub async fn store_rule(&self, rule: &DeviceRule) -> KvResult<String> {
        self.rules.store(rule).await
    }

    pub async fn invalidate(&self, id: Option<&str>) -> KvResult<usize> {
        self.rules.invalidate("device", id).await
    }
}

pub fn classify(user_agent: &str) -> DeviceType {
    let ua = user_agent.trim().to_lowercase();
    if ua.is_empty() {
        return DeviceType::Unknown;
    }
    let has_any = |patterns: &[&str]| patterns.iter().any(|p| ua.contains(p));

    if has_any(BOT_PATTERNS) {
        DeviceType::Bot
    } else if has_any(TABLET_PATTERNS) || (ua.contains("android") && !ua.contains("mobile")) {
        DeviceType::Tablet
    } else if has_any(MOBILE_PATTERNS) {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    }
}

pub fn detect_device(user_agent: &str) -> DeviceInfo {
    let device_type = classify(user_agent);
    let parsed = Parser::new().parse(user_agent).unwrap_or_default();
    let known = |value: &str| {
        (!value.is_empty() && value != "UNKNOWN").then(|| value.to_string())
    };
    let (brand, model) = brand_and_model(user_agent);

    DeviceInfo {
        device_type,
        browser: known(parsed.name),
        browser_version: known(parsed.version),
        os: known(parsed.os),
        os_version: known(&*parsed.os_version),
        brand,
        model,
    }
}

/// Best effort: Apple devices by family, Android devices by the build token
fn brand_and_model(user_agent: &str) -> (Option<String>, Option<String>) {
    for family in ["iPhone", "iPad", "iPod"] {
        if user_agent.contains(family) {
            return (Some("Apple".to_string()), Some(family.to_string()));
        }
    }

    let Some(start) = user_agent.find("Android") else {
        return (None, None);
    };
    let Some(model) = user_agent[start..]
        .split(')')
        .next()
        .and_then(|inner| inner.split(';').nth(1))
        .map(|m| m.split(" Build/").next().unwrap_or(m).trim())
        .filter(|m| !m.is_empty() && *m != "K" && *m != "wv")
    else {
        return (None, None);
    };

    let brand = if model.starts_with("SM-") || model.starts_with("GT-") {
        Some("Samsung")
    } else if model.starts_with("Pixel") {
        Some("Google")
    } else if model.starts_with("Redmi") || model.starts_with("Mi ") {
        Some("Xiaomi")
    } else if model.starts_with("moto") {
        Some("Motorola")
    } else if model.starts_with("ONEPLUS") {
        Some("OnePlus")
    } else {
        None
    };
    (brand.map(str::to_string), Some(model.to_string()))
}

/// Device type, browser and OS must all match the rule's (non-empty) lists
pub fn check_device_rule(rule: &DeviceRule, device: &DeviceInfo) -> DeviceDecision {
    let listed = |list: &[String], value: Option<&str>| {
        list.is_empty()
            || value.is_some_and(|value| {
                let value = value.to_lowercase();
                list.iter().any(|entry| value.contains(&entry.to_lowercase()))
            })
    };

    let matched = (rule.device_types.is_empty() || rule.device_types.contains(&device.device_type))
        && listed(&rule.browsers, device.browser.as_deref())
        && listed(&rule.os, device.os.as_deref());

    let allowed = match rule.mode {
        RuleMode::Allow => matched,
        RuleMode::Block => !matched,
    };

    DeviceDecision {
        allowed,
        reason: if allowed {
            "allowed".to_string()
        } else {
            format!("device_{}_{}", rule.mode, device.device_type)
        },
        rule_id: rule.id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RuleScope, RuleStatus};

    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";
    const IPAD: &str = "Mozilla/5.0 (iPad; CPU OS 16_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1";
    const PIXEL: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8 Build/UD1A.230803.041) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36";
    const GALAXY_TAB: &str = "Mozilla/5.0 (Linux; Android 13; SM-X710) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const DESKTOP: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
    const GOOGLEBOT: &str = "Mozilla/5.0 (Linux; Android 6.0.1; Nexus 5X Build/MMB29P) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Mobile Safari/537.36 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

    fn rule(mode: RuleMode, types: &[DeviceType]) -> DeviceRule {
        DeviceRule {
            id: Some("d1".to_string()),
            scope: RuleScope::Offer,
            scope_id: Some("offer-1".to_string()),
            mode,
            device_types: types.to_vec(),
            browsers: vec![],
            os: vec![],
            status: RuleStatus::Active,
        }
    }

    #[test]
    fn test_classification_order() {
        assert_eq!(classify(GOOGLEBOT), DeviceType::Bot);
        assert_eq!(classify(IPAD), DeviceType::Tablet);
        assert_eq!(classify(GALAXY_TAB), DeviceType::Tablet);
        assert_eq!(classify(IPHONE), DeviceType::Mobile);
        assert_eq!(classify(PIXEL), DeviceType::Mobile);
        assert_eq!(classify(DESKTOP), DeviceType::Desktop);
        assert_eq!(classify(""), DeviceType::Unknown);
    }

    #[test]
    fn test_browser_os_and_model() {
        let info = detect_device(PIXEL);
        assert_eq!(info.browser.as_deref(), Some("Chrome"));
        assert_eq!(info.os.as_deref(), Some("Android"));
        assert_eq!(info.brand.as_deref(), Some("Google"));
        assert_eq!(info.model.as_deref(), Some("Pixel 8"));

        let info = detect_device(IPHONE);
        assert_eq!(info.brand.as_deref(), Some("Apple"));
        assert_eq!(info.model.as_deref(), Some("iPhone"));
    }

    #[test]
    fn test_block_mode_rule() {
        let rule = rule(RuleMode::Block, &[DeviceType::Mobile]);
        let decision = check_device_rule(&rule, &detect_device(IPHONE));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "device_block_mobile");
        assert!(check_device_rule(&rule, &detect_device(DESKTOP)).allowed);
    }

    #[test]
    fn test_allow_mode_intersects_browser() {
        let mut rule = rule(RuleMode::Allow, &[DeviceType::Desktop, DeviceType::Mobile]);
        rule.browsers = vec!["chrome".to_string()];
        assert!(check_device_rule(&rule, &detect_device(DESKTOP)).allowed);
        assert!(check_device_rule(&rule, &detect_device(PIXEL)).allowed);

        let decision = check_device_rule(&rule, &detect_device(IPHONE));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "device_allow_mobile");
    }
}
