use chrono::{DateTime, Timelike, Utc};
use rand::RngExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::conditions::{all_match, RouteContext};
use super::selection::{next_rotation_index, pick_destination, pick_variant};
use super::RoutingError;
use crate::detection::{DeviceInfo, GeoInfo};
use crate::models::{
    EdgeRequest, OfferConfig, OfferStatus, RotationMode, RoutingAction, RoutingRule,
};
use crate::storage::KvStore;

const CAP_COUNTER_TTL: Duration = Duration::from_secs(48 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Capped,
    RuleRedirect,
    RuleRotate,
    RuleAbTest,
    RuleFallback,
    RuleBlocked,
    AbTest,
    RoundRobin,
    Weighted,
    Landing,
    Error,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Capped => "capped",
            DecisionKind::RuleRedirect => "rule_redirect",
            DecisionKind::RuleRotate => "rule_rotate",
            DecisionKind::RuleAbTest => "rule_ab_test",
            DecisionKind::RuleFallback => "rule_fallback",
            DecisionKind::RuleBlocked => "rule_blocked",
            DecisionKind::AbTest => "ab_test",
            DecisionKind::RoundRobin => "round_robin",
            DecisionKind::Weighted => "weighted",
            DecisionKind::Landing => "landing",
            DecisionKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub destination: String,
    pub kind: DecisionKind,
    pub capped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_index: Option<usize>,
}

impl RoutingDecision {
    fn to(destination: impl Into<String>, kind: DecisionKind) -> Self {
        Self {
            destination: destination.into(),
            kind,
            capped: false,
            rule_id: None,
            variant_id: None,
            rotation_index: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.kind == DecisionKind::RuleBlocked
    }
}

pub fn cap_key(offer_id: &str, now: DateTime<Utc>) -> String {
    format!("cap:{offer_id}:{}", now.format("%Y-%m-%d"))
}

pub fn rotation_key(offer_id: &str) -> String {
    format!("rotation:{offer_id}")
}

/// Chooses a destination per request: caps, then rules, then A/B test, then rotation
#[derive(Clone)]
pub struct SmartRouter {
    kv: Arc<dyn KvStore>,
}

impl SmartRouter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn route(
        &self,
        offer: &OfferConfig,
        geo: &GeoInfo,
        device: &DeviceInfo,
        request: &EdgeRequest,
    ) -> RoutingDecision {
        self.route_at(offer, geo, device, request, Utc::now()).await
    }

    pub async fn route_at(
        &self,
        offer: &OfferConfig,
        geo: &GeoInfo,
        device: &DeviceInfo,
        request: &EdgeRequest,
        now: DateTime<Utc>,
    ) -> RoutingDecision {
        if self.is_capped(offer, now).await {
            let mut decision = RoutingDecision::to(offer.fallback_or_landing(), DecisionKind::Capped);
            decision.capped = true;
            return decision;
        }

        let ctx = RouteContext {
            geo,
            device,
            request,
            hour: now.hour(),
        };
        match self.evaluate(offer, &ctx).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(offer_id = %offer.id, error = %e, "routing evaluation failed, using landing URL");
                RoutingDecision::to(offer.landing_url.clone(), DecisionKind::Error)
            }
        }
    }

    async fn evaluate(
        &self,
        offer: &OfferConfig,
        ctx: &RouteContext<'_>,
    ) -> Result<RoutingDecision, RoutingError> {
        let mut rules: Vec<&RoutingRule> = offer.routing_rules.iter().filter(|r| r.active).collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in rules {
            if all_match(&rule.conditions, ctx)? {
                let mut decision = apply_action(offer, rule)?;
                decision.rule_id = Some(rule.id.clone());
                debug!(offer_id = %offer.id, rule_id = %rule.id, "routing rule matched");
                return Ok(decision);
            }
        }

        if let Some(ab_test) = offer.ab_test.as_ref().filter(|ab| ab.enabled) {
            let roll = rand::rng().random::<f64>() * 100.0;
            if let Some(variant) = pick_variant(&ab_test.variants, roll) {
                let mut decision = RoutingDecision::to(variant.url.clone(), DecisionKind::AbTest);
                decision.variant_id = Some(variant.id.clone());
                return Ok(decision);
            }
        }

        if let Some(rotation) = offer
            .rotation
            .as_ref()
            .filter(|r| r.enabled && !r.destinations.is_empty())
        {
            return Ok(match rotation.mode {
                RotationMode::RoundRobin | RotationMode::SmartCtr => {
                    let len = rotation.destinations.len();
                    let index = self.rotation_index(&offer.id).await % len;
                    self.store_rotation_index(&offer.id, next_rotation_index(index, len))
                        .await;
                    let mut decision = RoutingDecision::to(
                        rotation.destinations[index].url.clone(),
                        DecisionKind::RoundRobin,
                    );
                    decision.rotation_index = Some(index);
                    decision
                }
                RotationMode::Weighted => {
                    let (index, destination) =
                        pick_destination(&rotation.destinations, rand::rng().random())
                            .ok_or_else(|| RoutingError::EmptyDestinations(offer.id.clone()))?;
                    let mut decision =
                        RoutingDecision::to(destination.url.clone(), DecisionKind::Weighted);
                    decision.rotation_index = Some(index);
                    decision
                }
            });
        }

        Ok(RoutingDecision::to(offer.landing_url.clone(), DecisionKind::Landing))
    }

    /// Authoritative counters from the offer, corroborated by the edge-local daily counter
    pub async fn is_capped(&self, offer: &OfferConfig, now: DateTime<Utc>) -> bool {
        if offer.status == OfferStatus::Capped {
            return true;
        }
        if offer.total_cap.is_some_and(|cap| offer.total_clicks >= cap) {
            return true;
        }
        let Some(daily_cap) = offer.daily_cap else {
            return false;
        };
        let edge_clicks = self.daily_clicks(&offer.id, now).await;
        offer.daily_clicks.max(edge_clicks) >= daily_cap
    }

    pub async fn daily_clicks(&self, offer_id: &str, now: DateTime<Utc>) -> u64 {
        match self.kv.get(&cap_key(offer_id, now)).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                warn!(offer_id = %offer_id, error = %e, "cap counter read failed, assuming not capped");
                0
            }
        }
    }

    pub async fn record_click(&self, offer_id: &str) -> u64 {
        self.record_click_at(offer_id, Utc::now()).await
    }

    /// Read-modify-write; concurrent increments for one offer may be lost
    pub async fn record_click_at(&self, offer_id: &str, now: DateTime<Utc>) -> u64 {
        let next = self.daily_clicks(offer_id, now).await + 1;
        if let Err(e) = self
            .kv
            .put(&cap_key(offer_id, now), &next.to_string(), Some(CAP_COUNTER_TTL))
            .await
        {
            warn!(offer_id = %offer_id, error = %e, "cap counter write failed");
        }
        next
    }

    async fn rotation_index(&self, offer_id: &str) -> usize {
        match self.kv.get(&rotation_key(offer_id)).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                warn!(offer_id = %offer_id, error = %e, "rotation index read failed, starting at 0");
                0
            }
        }
    }

    async fn store_rotation_index(&self, offer_id: &str, index: usize) {
        if let Err(e) = self
            .kv
            .put(&rotation_key(offer_id), &index.to_string(), None)
            .await
        {
            warn!(offer_id = %offer_id, error = %e, "rotation index write failed");
        }
    }
}

fn apply_action(offer: &OfferConfig, rule: &RoutingRule) -> Result<RoutingDecision, RoutingError> {
    Ok(match &rule.action {
        RoutingAction::Redirect { url } => {
            RoutingDecision::to(url.clone(), DecisionKind::RuleRedirect)
        }
        RoutingAction::Rotate { destinations } => {
            let (index, destination) = pick_destination(destinations, rand::rng().random())
                .ok_or_else(|| RoutingError::EmptyDestinations(rule.id.clone()))?;
            let mut decision =
                RoutingDecision::to(destination.url.clone(), DecisionKind::RuleRotate);
            decision.rotation_index = Some(index);
            decision
        }
        RoutingAction::AbTest { variants } => {
            let variant = pick_variant(variants, rand::rng().random::<f64>() * 100.0)
                .ok_or_else(|| RoutingError::EmptyDestinations(rule.id.clone()))?;
            let mut decision = RoutingDecision::to(variant.url.clone(), DecisionKind::RuleAbTest);
            decision.variant_id = Some(variant.id.clone());
            decision
        }
        RoutingAction::Fallback { urls } => {
            let url = urls
                .iter()
                .find(|url| !url.is_empty())
                .map(String::as_str)
                .unwrap_or_else(|| offer.fallback_or_landing());
            RoutingDecision::to(url, DecisionKind::RuleFallback)
        }
        RoutingAction::Block => {
            RoutingDecision::to(offer.fallback_or_landing(), DecisionKind::RuleBlocked)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::device::detect_device;
    use crate::models::{
        AbTestConfig, ConditionKind, ConditionOperator, Destination, RotationConfig,
        RoutingCondition, Variant,
    };
    use crate::storage::MemoryKv;
    use axum::http::HeaderMap;
    use chrono::TimeZone;
    use serde_json::json;

    fn offer() -> OfferConfig {
        serde_json::from_value(json!({
            "id": "offer-1",
            "tenant_id": "tenant-1",
            "landing_url": "https://shop.example/landing",
            "fallback_url": "https://shop.example/sold-out"
        }))
        .unwrap()
    }

    fn destinations(urls: &[&str]) -> Vec<Destination> {
        urls.iter()
            .map(|url| Destination {
                id: None,
                url: url.to_string(),
                weight: 1,
            })
            .collect()
    }

    fn rule(id: &str, priority: i32, conditions: Vec<RoutingCondition>, action: RoutingAction) -> RoutingRule {
        RoutingRule {
            id: id.to_string(),
            name: None,
            priority,
            active: true,
            conditions,
            action,
        }
    }

    fn geo(country: &str) -> GeoInfo {
        GeoInfo {
            country: Some(country.to_string()),
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap()
    }

    async fn route(router: &SmartRouter, offer: &OfferConfig, country: &str) -> RoutingDecision {
        let device = detect_device("Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/124.0");
        let request = EdgeRequest::new("203.0.113.1".parse().unwrap(), HeaderMap::new());
        router.route_at(offer, &geo(country), &device, &request, now()).await
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_destination_once() {
        let router = SmartRouter::new(Arc::new(MemoryKv::new()));
        let mut offer = offer();
        offer.rotation = Some(RotationConfig {
            enabled: true,
            mode: RotationMode::RoundRobin,
            destinations: destinations(&["https://a.example", "https://b.example", "https://c.example"]),
        });

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(route(&router, &offer, "US").await.destination);
        }
        assert_eq!(
            seen,
            vec!["https://a.example", "https://b.example", "https://c.example", "https://a.example"]
        );
    }

    #[tokio::test]
    async fn test_daily_cap_routes_to_fallback() {
        let router = SmartRouter::new(Arc::new(MemoryKv::new()));
        let mut offer = offer();
        offer.daily_cap = Some(10);

        for _ in 0..9 {
            router.record_click_at(&offer.id, now()).await;
        }
        let tenth = route(&router, &offer, "US").await;
        assert!(!tenth.capped);
        assert_eq!(tenth.destination, "https://shop.example/landing");

        router.record_click_at(&offer.id, now()).await;
        let eleventh = route(&router, &offer, "US").await;
        assert!(eleventh.capped);
        assert_eq!(eleventh.kind, DecisionKind::Capped);
        assert_eq!(eleventh.destination, "https://shop.example/sold-out");
    }

    #[tokio::test]
    async fn test_cap_bypasses_rules_and_counts_offer_totals() {
        let router = SmartRouter::new(Arc::new(MemoryKv::new()));
        let mut offer = offer();
        offer.total_cap = Some(500);
        offer.total_clicks = 500;
        offer.routing_rules = vec![rule(
            "r1",
            1,
            vec![],
            RoutingAction::Redirect {
                url: "https://rule.example".to_string(),
            },
        )];
        assert!(route(&router, &offer, "US").await.capped);
    }

    #[tokio::test]
    async fn test_highest_priority_matching_rule_wins() {
        let router = SmartRouter::new(Arc::new(MemoryKv::new()));
        let mut offer = offer();
        let us_only = vec![RoutingCondition {
            kind: ConditionKind::Geo,
            field: None,
            operator: ConditionOperator::Eq,
            value: json!("US"),
        }];
        offer.routing_rules = vec![
            rule("low", 1, vec![], RoutingAction::Redirect { url: "https://low.example".into() }),
            rule("high", 10, us_only, RoutingAction::Redirect { url: "https://us.example".into() }),
        ];

        let us = route(&router, &offer, "US").await;
        assert_eq!(us.destination, "https://us.example");
        assert_eq!(us.rule_id.as_deref(), Some("high"));
        assert_eq!(route(&router, &offer, "FR").await.destination, "https://low.example");
    }

    #[tokio::test]
    async fn test_block_and_fallback_actions() {
        let router = SmartRouter::new(Arc::new(MemoryKv::new()));
        let mut offer = offer();
        offer.routing_rules = vec![rule("b", 5, vec![], RoutingAction::Block)];
        let blocked = route(&router, &offer, "US").await;
        assert!(blocked.is_blocked());
        assert_eq!(blocked.destination, "https://shop.example/sold-out");

        offer.routing_rules = vec![rule(
            "f",
            5,
            vec![],
            RoutingAction::Fallback {
                urls: vec!["".into(), "https://backup.example".into()],
            },
        )];
        assert_eq!(route(&router, &offer, "US").await.destination, "https://backup.example");
    }

    #[tokio::test]
    async fn test_evaluation_error_falls_back_to_landing() {
        let router = SmartRouter::new(Arc::new(MemoryKv::new()));
        let mut offer = offer();
        offer.routing_rules = vec![rule(
            "bad",
            5,
            vec![RoutingCondition {
                kind: ConditionKind::Geo,
                field: None,
                operator: ConditionOperator::Regex,
                value: json!("[unterminated"),
            }],
            RoutingAction::Redirect { url: "https://never.example".into() },
        )];
        let decision = route(&router, &offer, "US").await;
        assert_eq!(decision.kind, DecisionKind::Error);
        assert_eq!(decision.destination, "https://shop.example/landing");

        offer.routing_rules = vec![rule("empty", 5, vec![], RoutingAction::Rotate { destinations: vec![] })];
        assert_eq!(route(&router, &offer, "US").await.kind, DecisionKind::Error);
    }

    #[tokio::test]
    async fn test_offer_ab_test_precedes_rotation() {
        let router = SmartRouter::new(Arc::new(MemoryKv::new()));
        let mut offer = offer();
        offer.ab_test = Some(AbTestConfig {
            id: Some("exp-1".into()),
            enabled: true,
            variants: vec![Variant {
                id: "only".into(),
                url: "https://variant.example".into(),
                percentage: 100.0,
            }],
        });
        offer.rotation = Some(RotationConfig {
            enabled: true,
            mode: RotationMode::RoundRobin,
            destinations: destinations(&["https://a.example"]),
        });

        let decision = route(&router, &offer, "US").await;
        assert_eq!(decision.kind, DecisionKind::AbTest);
        assert_eq!(decision.variant_id.as_deref(), Some("only"));
    }

    #[tokio::test]
    async fn test_cap_counter_key_is_daily() {
        assert_eq!(cap_key("o1", now()), "cap:o1:2026-03-14");
        let router = SmartRouter::new(Arc::new(MemoryKv::new()));
        assert_eq!(router.record_click_at("o1", now()).await, 1);
        assert_eq!(router.record_click_at("o1", now()).await, 2);
        let tomorrow = now() + chrono::Duration::days(1);
        assert_eq!(router.daily_clicks("o1", tomorrow).await, 0);
    }
}
