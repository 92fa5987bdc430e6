//! Scoped geo/device rule resolution
//!
//! Exactly one rule is effective per request: the offer's embedded rule if it
//! is active, otherwise the first active rule found by precedence
//! offer > advertiser > tenant > global. The shared store caches rules for ten
//! minutes; a scope missing from the cache is fetched from the backend, and
//! "no rule here" is cached as `null` so quiet scopes cost one lookup per TTL.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::BackendClient;
use crate::models::{OfferConfig, RuleScope, ScopedRule};
use crate::storage::{get_json, put_json, KvResult, KvStore};

pub const RULE_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
/// How long a scope stays unresolved after the backend failed to answer
const RULE_FETCH_FAILURE_TTL: Duration = Duration::from_secs(30);

/// Ids an offer exposes to each rule scope
#[derive(Debug, Clone, Copy)]
pub struct RuleTarget<'a> {
    pub offer_id: &'a str,
    pub advertiser_id: Option<&'a str>,
    pub tenant_id: &'a str,
}

impl<'a> RuleTarget<'a> {
    pub fn for_offer(offer: &'a OfferConfig) -> Self {
        Self {
            offer_id: &offer.id,
            advertiser_id: offer.advertiser_id.as_deref(),
            tenant_id: &offer.tenant_id,
        }
    }

    fn candidates(&self) -> Vec<(RuleScope, Option<&'a str>)> {
        let mut scopes = vec![(RuleScope::Offer, Some(self.offer_id))];
        if let Some(advertiser_id) = self.advertiser_id {
            scopes.push((RuleScope::Advertiser, Some(advertiser_id)));
        }
        scopes.push((RuleScope::Tenant, Some(self.tenant_id)));
        scopes.push((RuleScope::Global, None));
        scopes
    }
}

pub fn rule_key(kind: &str, scope: RuleScope, scope_id: Option<&str>) -> String {
    match (scope, scope_id) {
        (RuleScope::Global, _) | (_, None) => format!("rules:{kind}:global"),
        (scope, Some(id)) => format!("rules:{kind}:{}:{id}", scope.as_str()),
    }
}

#[derive(Clone)]
pub struct RuleResolver {
    kv: Arc<dyn KvStore>,
    backend: Option<Arc<dyn BackendClient>>,
}

impl RuleResolver {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv, backend: None }
    }

    /// Refill cache misses from the backend
    pub fn with_backend(mut self, backend: Arc<dyn BackendClient>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub async fn resolve<R>(&self, embedded: Option<&R>, target: RuleTarget<'_>) -> Option<R>
    where
        R: ScopedRule + DeserializeOwned + Serialize + Clone,
    {
        if let Some(rule) = embedded.filter(|rule| rule.is_active()) {
            return Some(rule.clone());
        }

        for (scope, scope_id) in target.candidates() {
            if let Some(rule) = self.lookup::<R>(scope, scope_id).await {
                if rule.is_active() {
                    return Some(rule);
                }
            }
        }
        None
    }

    /// Rule for one scope, from the cache or else the backend
    async fn lookup<R>(&self, scope: RuleScope, scope_id: Option<&str>) -> Option<R>
    where
        R: ScopedRule + DeserializeOwned + Serialize,
    {
        let key = rule_key(R::KIND, scope, scope_id);
        match get_json::<Option<R>>(self.kv.as_ref(), &key).await {
            Ok(Some(cached)) => return cached,
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "rule lookup failed, skipping scope");
                return None;
            }
        }

        let backend = self.backend.as_ref()?;
        let (rule, ttl) = match backend.fetch_rule(R::KIND, scope, scope_id).await {
            Ok(Some(raw)) => match serde_json::from_value::<R>(raw) {
                Ok(rule) => (Some(rule), RULE_CACHE_TTL),
                Err(e) => {
                    warn!(key = %key, error = %e, "backend returned an unreadable rule");
                    (None, RULE_CACHE_TTL)
                }
            },
            Ok(None) => (None, RULE_CACHE_TTL),
            Err(e) => {
                warn!(key = %key, error = %e, "rule fetch failed, scope treated as empty");
                (None, RULE_FETCH_FAILURE_TTL)
            }
        };
        if let Err(e) = put_json(self.kv.as_ref(), &key, &rule, Some(ttl)).await {
            debug!(key = %key, error = %e, "rule not cached");
        }
        rule
    }

    /// Cache a rule under its own scope, returning the key written
    pub async fn store<R>(&self, rule: &R) -> KvResult<String>
    where
        R: ScopedRule + Serialize,
    {
        let key = rule_key(R::KIND, rule.scope(), rule.scope_id());
        put_json(self.kv.as_ref(), &key, rule, Some(RULE_CACHE_TTL)).await?;
        Ok(key)
    }

    /// Drop cached rules of `kind`; with an id, only the rules scoped to that id
    pub async fn invalidate(&self, kind: &str, id: Option<&str>) -> KvResult<usize> {
        let Some(id) = id else {
            return crate::storage::delete_prefix(self.kv.as_ref(), &format!("rules:{kind}:"))
                .await;
        };

        let mut removed = 0;
        for scope in [RuleScope::Offer, RuleScope::Advertiser, RuleScope::Tenant] {
            let key = rule_key(kind, scope, Some(id));
            if self.kv.get(&key).await?.is_some() {
                self.kv.delete(&key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
