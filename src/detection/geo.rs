use serde::Serialize;
use std::sync::Arc;

use super::geoip::GeoIpService;
use super::rules::{RuleResolver, RuleTarget};
use crate::models::{EdgeRequest, GeoRule, OfferConfig, RuleMode};
use crate::storage::KvResult;

/// Where a request comes from, as reported by the edge (or MaxMind as fallback)
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub region_code: Option<String>,
    pub city: Option<String>,
    pub continent: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
    pub asn: Option<u32>,
    pub as_org: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GeoDecision {
    pub allowed: bool,
    /// `no_rule`, `no_country`, `allowed` or `geo_blocked_{country}`
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl GeoDecision {
    fn allow(reason: &str, rule_id: Option<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.to_string(),
            rule_id,
        }
    }
}

/// Two-character country code, uppercased. `XX` (unplaceable) and anything
/// else that is not a code yield `None`; `T1` (Tor) is kept.
pub fn normalize_country(raw: &str) -> Option<String> {
    let code = raw.trim();
    if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    let code = code.to_ascii_uppercase();
    (code != "XX").then_some(code)
}

#[derive(Clone)]
pub struct GeoValidator {
    rules: RuleResolver,
    geoip: Option<Arc<GeoIpService>>,
}

impl GeoValidator {
    pub fn new(rules: RuleResolver, geoip: Option<Arc<GeoIpService>>) -> Self {
        Self { rules, geoip }
    }

    pub fn extract(&self, request: &EdgeRequest) -> GeoInfo {
        let text = |name: &str| {
            request
                .header(name)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let number = |name: &str| request.header(name).and_then(|v| v.parse::<f64>().ok());

        let mut info = GeoInfo {
            country: request.header("cf-ipcountry").and_then(normalize_country),
            region: text("cf-region"),
            region_code: text("cf-region-code"),
            city: text("cf-ipcity"),
            continent: text("cf-ipcontinent"),
            postal_code: text("cf-postal-code"),
            latitude: number("cf-iplatitude"),
            longitude: number("cf-iplongitude"),
            timezone: text("cf-timezone"),
            asn: request.header("x-edge-asn").and_then(|v| v.parse().ok()),
            as_org: text("x-edge-as-org"),
        };

        if info.country.is_none() {
            if let Some(geoip) = self.geoip.as_ref().filter(|g| g.is_configured()) {
                geoip.enrich(request.client_ip, &mut info);
            }
        }
        info
    }

    pub async fn resolve_rule(&self, offer: &OfferConfig) -> Option<GeoRule> {
        self.rules
            .resolve(offer.geo_rule.as_ref(), RuleTarget::for_offer(offer))
            .await
    }

    pub async fn validate(&self, offer: &OfferConfig, geo: &GeoInfo) -> GeoDecision {
        match self.resolve_rule(offer).await {
            Some(rule) => check_geo_rule(&rule, geo),
            None => GeoDecision::allow("no_rule", None),
        }
    }

    pub async fn store_rule(&self, rule: &GeoRule) -> KvResult<String> {
        self.rules.store(rule).await
    }

    pub async fn invalidate(&self, id: Option<&str>) -> KvResult<usize> {
        self.rules.invalidate("geo", id).await
    }
}

/// Country (or `*`) and, when the rule lists regions, region must both match
pub fn check_geo_rule(rule: &GeoRule, geo: &GeoInfo) -> GeoDecision {
    let Some(country) = geo.country.as_deref() else {
        return GeoDecision::allow("no_country", rule.id.clone());
    };

    let country_matches = rule
        .countries
        .iter()
        .any(|c| c == "*" || c.eq_ignore_ascii_case(country));
    let region_matches = rule.regions.is_empty()
        || rule.regions.iter().any(|r| {
            [geo.region_code.as_deref(), geo.region.as_deref()]
                .into_iter()
                .flatten()
                .any(|value| value.eq_ignore_ascii_case(r))
        });
    let matched = country_matches && region_matches;

    let allowed = match rule.mode {
        RuleMode::Allow => matched,
        RuleMode::Block => !matched,
    };

    if allowed {
        GeoDecision::allow("allowed", rule.id.clone())
    } else {
        GeoDecision {
            allowed: false,
            reason: format!("geo_blocked_{country}"),
            rule_id: rule.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RuleScope, RuleStatus};
    use crate::storage::MemoryKv;
    use axum::http::{HeaderMap, HeaderValue};

    fn rule(mode: RuleMode, countries: &[&str], regions: &[&str]) -> GeoRule {
        GeoRule {
            id: Some("g1".to_string()),
            scope: RuleScope::Offer,
            scope_id: Some("offer-1".to_string()),
            mode,
            countries: countries.iter().map(|c| c.to_string()).collect(),
            regions: regions.iter().map(|r| r.to_string()).collect(),
            status: RuleStatus::Active,
        }
    }

    fn from(country: &str) -> GeoInfo {
        GeoInfo {
            country: Some(country.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_allow_mode() {
        let rule = rule(RuleMode::Allow, &["US", "CA"], &[]);
        assert!(check_geo_rule(&rule, &from("US")).allowed);
        let blocked = check_geo_rule(&rule, &from("FR"));
        assert!(!blocked.allowed);
        assert_eq!(blocked.reason, "geo_blocked_FR");
    }

    #[test]
    fn test_block_mode_is_the_inverse() {
        let rule = rule(RuleMode::Block, &["US", "CA"], &[]);
        assert!(!check_geo_rule(&rule, &from("US")).allowed);
        assert!(check_geo_rule(&rule, &from("FR")).allowed);
    }

    #[test]
    fn test_wildcard_with_region() {
        let rule = rule(RuleMode::Allow, &["*"], &["CA", "Oregon"]);
        let mut geo = from("US");
        geo.region_code = Some("CA".to_string());
        assert!(check_geo_rule(&rule, &geo).allowed);

        geo.region_code = Some("TX".to_string());
        geo.region = Some("Texas".to_string());
        assert!(!check_geo_rule(&rule, &geo).allowed);

        geo.region = Some("oregon".to_string());
        assert!(check_geo_rule(&rule, &geo).allowed);
    }

    #[test]
    fn test_missing_country_is_allowed() {
        let rule = rule(RuleMode::Allow, &["US"], &[]);
        let decision = check_geo_rule(&rule, &GeoInfo::default());
        assert!(decision.allowed);
        assert_eq!(decision.reason, "no_country");
    }

    #[test]
    fn test_extract_from_edge_headers() {
        let validator = GeoValidator::new(RuleResolver::new(Arc::new(MemoryKv::new())), None);
        let mut headers = HeaderMap::new();
        headers.insert("cf-ipcountry", HeaderValue::from_static("us"));
        headers.insert("cf-region-code", HeaderValue::from_static("CA"));
        headers.insert("cf-iplatitude", HeaderValue::from_static("37.77"));
        headers.insert("x-edge-asn", HeaderValue::from_static("16509"));
        let request = EdgeRequest::new("203.0.113.5".parse().unwrap(), headers);

        let geo = validator.extract(&request);
        assert_eq!(geo.country.as_deref(), Some("US"));
        assert_eq!(geo.region_code.as_deref(), Some("CA"));
        assert_eq!(geo.latitude, Some(37.77));
        assert_eq!(geo.asn, Some(16509));
    }

    #[test]
    fn test_country_header_must_be_a_code() {
        assert_eq!(normalize_country("de").as_deref(), Some("DE"));
        assert_eq!(normalize_country("T1").as_deref(), Some("T1"));
        assert_eq!(normalize_country("XX"), None);
        assert_eq!(normalize_country("Germany"), None);
        assert_eq!(normalize_country("A-"), None);
        assert_eq!(normalize_country(""), None);

        let validator = GeoValidator::new(RuleResolver::new(Arc::new(MemoryKv::new())), None);
        let mut headers = HeaderMap::new();
        headers.insert("cf-ipcountry", HeaderValue::from_static("random-junk-1234"));
        let request = EdgeRequest::new("203.0.113.5".parse().unwrap(), headers);
        assert_eq!(validator.extract(&request).country, None);
    }
}
