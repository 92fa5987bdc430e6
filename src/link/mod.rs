//! Signed tracking-link validation
//!
//! Link format: `{tracking_code}.{unix_seconds}.{nonce}.{signature}` where the
//! signature is the first 12 hex characters of
//! `HMAC-SHA256(secret, "{tracking_code}.{unix_seconds}.{nonce}")`.
//! Codes without any `.` are legacy codes and only pass when explicitly allowed.

use base64::prelude::*;
use hmac::{Hmac, Mac};
use rand::RngExt;
use serde::Serialize;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::config::SigningConfig;
use crate::storage::KvStore;

/// Hex characters kept from the HMAC digest
pub const SIGNATURE_LEN: usize = 12;
/// How far in the future a link timestamp may be before it is rejected
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;
const NONCE_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedLinkComponents {
    pub tracking_code: String,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRejection {
    InvalidFormat,
    InvalidTimestamp,
    LinkExpired,
    TimestampInFuture,
    InvalidSignature,
    ReplayAttempt,
    LegacyCodesNotAllowed,
}

impl LinkRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkRejection::InvalidFormat => "invalid_format",
            LinkRejection::InvalidTimestamp => "invalid_timestamp",
            LinkRejection::LinkExpired => "link_expired",
            LinkRejection::TimestampInFuture => "timestamp_in_future",
            LinkRejection::InvalidSignature => "invalid_signature",
            LinkRejection::ReplayAttempt => "replay_attempt",
            LinkRejection::LegacyCodesNotAllowed => "legacy_codes_not_allowed",
        }
    }
}

impl fmt::Display for LinkRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<LinkRejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<SignedLinkComponents>,
    pub is_legacy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_code: Option<String>,
}

impl LinkValidation {
    fn rejected(reason: LinkRejection, tracking_code: Option<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            components: None,
            is_legacy: false,
            tracking_code,
        }
    }
}

/// Dry-run report used by the verify endpoint and the admin CLI
#[derive(Debug, Clone, Serialize)]
pub struct LinkInspection {
    pub raw: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<LinkRejection>,
    pub is_legacy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_code: Option<String>,
    pub parts_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    pub ttl_seconds: i64,
}

pub struct LinkValidator {
    mac: Hmac<Sha256>,
    ttl_secs: i64,
    allow_legacy: bool,
    nonces: Arc<dyn KvStore>,
}

impl LinkValidator {
    pub fn new(config: &SigningConfig, nonces: Arc<dyn KvStore>) -> anyhow::Result<Self> {
        let mac = Hmac::<Sha256>::new_from_slice(config.secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to create HMAC: {}", e))?;
        Ok(Self {
            mac,
            ttl_secs: config.link_ttl_secs,
            allow_legacy: config.allow_legacy_codes,
            nonces,
        })
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Signature for a payload; a pure function of the secret and the payload
    pub fn signature(&self, tracking_code: &str, timestamp: i64, nonce: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(format!("{tracking_code}.{timestamp}.{nonce}").as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut hex = String::with_capacity(SIGNATURE_LEN);
        for byte in digest.iter().take(SIGNATURE_LEN / 2) {
            hex.push_str(&format!("{byte:02x}"));
        }
        hex
    }

    pub fn sign_at(&self, tracking_code: &str, timestamp: i64, nonce: &str) -> String {
        let signature = self.signature(tracking_code, timestamp, nonce);
        format!("{tracking_code}.{timestamp}.{nonce}.{signature}")
    }

    /// Create a fresh signed code with a random nonce
    pub fn generate(&self, tracking_code: &str) -> String {
        self.sign_at(tracking_code, chrono::Utc::now().timestamp(), &generate_nonce())
    }

    pub async fn validate(&self, signed_code: &str) -> LinkValidation {
        self.validate_at(signed_code, chrono::Utc::now().timestamp())
            .await
    }

    /// Full validation at `now` (unix seconds), consuming the nonce on success
    pub async fn validate_at(&self, signed_code: &str, now: i64) -> LinkValidation {
        let components = match self.check(signed_code, now) {
            Ok(Checked::Legacy(code)) => {
                return LinkValidation {
                    valid: true,
                    reason: None,
                    components: None,
                    is_legacy: true,
                    tracking_code: Some(code),
                };
            }
            Ok(Checked::Signed(components)) => components,
            Err((reason, tracking_code)) => {
                let mut result = LinkValidation::rejected(reason, tracking_code);
                result.is_legacy = reason == LinkRejection::LegacyCodesNotAllowed;
                return result;
            }
        };

        let key = format!("nonce:{}", components.nonce);
        match self.nonces.get(&key).await {
            Ok(Some(_)) => {
                return LinkValidation::rejected(
                    LinkRejection::ReplayAttempt,
                    Some(components.tracking_code),
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "nonce lookup failed, accepting link without replay check");
            }
        }

        let ttl = Duration::from_secs(self.ttl_secs.max(1) as u64);
        if let Err(e) = self.nonces.put(&key, "1", Some(ttl)).await {
            warn!(error = %e, "failed to record nonce, replay protection degraded");
        }

        LinkValidation {
            valid: true,
            reason: None,
            tracking_code: Some(components.tracking_code.clone()),
            components: Some(components),
            is_legacy: false,
        }
    }

    /// Format, signature and TTL checks without consuming the nonce
    pub fn inspect(&self, signed_code: &str) -> LinkInspection {
        self.inspect_at(signed_code, chrono::Utc::now().timestamp())
    }

    pub fn inspect_at(&self, signed_code: &str, now: i64) -> LinkInspection {
        let parts: Vec<&str> = signed_code.split('.').collect();
        let timestamp = if parts.len() == 4 {
            parts[1].parse::<i64>().ok()
        } else {
            None
        };

        let (valid, reason, is_legacy, tracking_code) = match self.check(signed_code, now) {
            Ok(Checked::Legacy(code)) => (true, None, true, Some(code)),
            Ok(Checked::Signed(c)) => (true, None, false, Some(c.tracking_code)),
            Err((reason, code)) => (
                false,
                Some(reason),
                reason == LinkRejection::LegacyCodesNotAllowed,
                code,
            ),
        };

        LinkInspection {
            raw: signed_code.to_string(),
            valid,
            reason,
            is_legacy,
            tracking_code,
            parts_count: parts.len(),
            timestamp,
            age_seconds: timestamp.map(|ts| now - ts),
            expires_in: timestamp.map(|ts| self.ttl_secs - (now - ts)),
            ttl_seconds: self.ttl_secs,
        }
    }

    fn check(
        &self,
        signed_code: &str,
        now: i64,
    ) -> Result<Checked, (LinkRejection, Option<String>)> {
        if signed_code.is_empty() {
            return Err((LinkRejection::InvalidFormat, None));
        }

        if !signed_code.contains('.') {
            return if self.allow_legacy {
                Ok(Checked::Legacy(signed_code.to_string()))
            } else {
                Err((
                    LinkRejection::LegacyCodesNotAllowed,
                    Some(signed_code.to_string()),
                ))
            };
        }

        let parts: Vec<&str> = signed_code.split('.').collect();
        if parts.len() != 4 || parts.iter().any(|part| part.is_empty()) {
            return Err((LinkRejection::InvalidFormat, None));
        }

        let tracking_code = parts[0].to_string();
        let timestamp = match parts[1].parse::<i64>() {
            Ok(ts) if parts[1].bytes().all(|b| b.is_ascii_digit()) => ts,
            _ => return Err((LinkRejection::InvalidTimestamp, Some(tracking_code))),
        };
        let nonce = parts[2];
        let signature = parts[3];

        let expected = self.signature(&tracking_code, timestamp, nonce);
        let matches: bool = expected.as_bytes().ct_eq(signature.as_bytes()).into();
        if !matches {
            return Err((LinkRejection::InvalidSignature, Some(tracking_code)));
        }

        if now - timestamp > self.ttl_secs {
            return Err((LinkRejection::LinkExpired, Some(tracking_code)));
        }

        if timestamp > now + MAX_CLOCK_SKEW_SECS {
            return Err((LinkRejection::TimestampInFuture, Some(tracking_code)));
        }

        Ok(Checked::Signed(SignedLinkComponents {
            tracking_code,
            timestamp,
            nonce: nonce.to_string(),
            signature: signature.to_string(),
        }))
    }
}

enum Checked {
    Legacy(String),
    Signed(SignedLinkComponents),
}

/// Random URL-safe nonce
pub fn generate_nonce() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 8] = rng.random();
    let mut nonce = BASE64_URL_SAFE_NO_PAD.encode(bytes);
    nonce.truncate(NONCE_LEN);
    nonce
}
