//! Additive bot risk scoring
//!
//! Each independent signal adds its weight to the risk score, which is
//! clamped to 100. `is_bot` is set from 50; the orchestrator blocks at its own,
//! stricter threshold.

use ipnet::IpNet;
use serde::Serialize;
use std::collections::HashSet;

use crate::models::EdgeRequest;

pub const BOT_SIGNATURE_SCORE: u32 = 50;
pub const SHORT_UA_SCORE: u32 = 40;
pub const HEADLESS_SCORE: u32 = 60;
pub const DATACENTER_SCORE: u32 = 30;
pub const TOR_SCORE: u32 = 70;
pub const MISSING_STANDARD_HEADER_SCORE: u32 = 10;
pub const IMPLAUSIBLE_PLATFORM_SCORE: u32 = 50;
pub const MISSING_LANGUAGE_SCORE: u32 = 15;
pub const MISSING_ENCODING_SCORE: u32 = 15;
pub const MISSING_CONNECTION_SCORE: u32 = 10;
pub const BOT_THRESHOLD: u8 = 50;
const MIN_UA_LEN: usize = 20;

const BOT_SIGNATURES: &[&str] = &[
    "bot", "crawler", "spider", "scraper", "slurp", "curl/", "wget", "python-requests",
    "python-urllib", "aiohttp", "go-http-client", "java/", "okhttp", "apache-httpclient",
    "libwww-perl", "node-fetch", "axios/", "scrapy", "httpie", "postman",
];
const HEADLESS_SIGNATURES: &[&str] = &[
    "headlesschrome", "phantomjs", "selenium", "webdriver", "puppeteer", "playwright",
    "electron", "slimerjs",
];
/// Hosting and cloud ASNs that rarely carry human traffic
const DATACENTER_ASNS: &[u32] = &[
    16509, 14618, 8075, 15169, 396982, 14061, 16276, 24940, 63949, 20473, 45102, 37963, 132203,
    13335, 9009, 212238,
];
const DATACENTER_ORG_HINTS: &[&str] = &[
    "amazon", "aws", "google cloud", "microsoft", "azure", "digitalocean", "ovh", "hetzner",
    "linode", "akamai", "vultr", "choopa", "alibaba", "tencent", "oracle", "m247",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BotCategory {
    Tor,
    Headless,
    KnownBot,
    SpoofedClient,
    MissingUserAgent,
    Datacenter,
    IncompleteHeaders,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotDetection {
    pub is_bot: bool,
    pub confidence: f64,
    pub risk_score: u8,
    pub indicators: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<BotCategory>,
}

impl BotDetection {
    pub fn clean() -> Self {
        Self {
            is_bot: false,
            confidence: 0.0,
            risk_score: 0,
            indicators: Vec::new(),
            category: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BotDetector {
    tor_exit_ranges: Vec<IpNet>,
    extra_datacenter_asns: HashSet<u32>,
}

struct Scorecard {
    risk: u32,
    indicators: Vec<String>,
    strongest: Option<(u32, BotCategory)>,
}

impl Scorecard {
    fn add(&mut self, weight: u32, category: BotCategory, indicator: impl Into<String>) {
        self.risk += weight;
        self.indicators.push(indicator.into());
        if self.strongest.map_or(true, |(best, _)| weight > best) {
            self.strongest = Some((weight, category));
        }
    }
}

impl BotDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tor_exit_ranges(mut self, ranges: Vec<IpNet>) -> Self {
        self.tor_exit_ranges = ranges;
        self
    }

    pub fn with_datacenter_asns(mut self, asns: impl IntoIterator<Item = u32>) -> Self {
        self.extra_datacenter_asns.extend(asns);
        self
    }

    /// Score a request; `asn`/`as_org`/`country` come from the geo layer when known
    pub fn detect(
        &self,
        request: &EdgeRequest,
        asn: Option<u32>,
        as_org: Option<&str>,
        country: Option<&str>,
    ) -> BotDetection {
        let mut card = Scorecard {
            risk: 0,
            indicators: Vec::new(),
            strongest: None,
        };

        let ua = request.user_agent();
        let ua_lower = ua.to_lowercase();

        if let Some(signature) = BOT_SIGNATURES.iter().find(|s| ua_lower.contains(*s)) {
            card.add(
                BOT_SIGNATURE_SCORE,
                BotCategory::KnownBot,
                format!("bot_signature:{signature}"),
            );
        }

        if ua.len() < MIN_UA_LEN {
            card.add(
                SHORT_UA_SCORE,
                BotCategory::MissingUserAgent,
                if ua.is_empty() { "empty_user_agent" } else { "short_user_agent" },
            );
        }

        let sec_ch_ua = request.header("sec-ch-ua").unwrap_or("").to_lowercase();
        if let Some(signature) = HEADLESS_SIGNATURES
            .iter()
            .find(|s| ua_lower.contains(*s) || sec_ch_ua.contains(*s))
        {
            card.add(HEADLESS_SCORE, BotCategory::Headless, format!("headless:{signature}"));
        }

        if self.is_datacenter(asn, as_org) {
            card.add(DATACENTER_SCORE, BotCategory::Datacenter, "datacenter_asn");
        }

        if country == Some("T1") || self.tor_exit_ranges.iter().any(|net| net.contains(&request.client_ip)) {
            card.add(TOR_SCORE, BotCategory::Tor, "tor_exit");
        }

        for header in ["accept", "user-agent"] {
            if !request.has_header(header) {
                card.add(
                    MISSING_STANDARD_HEADER_SCORE,
                    BotCategory::IncompleteHeaders,
                    format!("missing_header:{header}"),
                );
            }
        }

        if let Some(reason) = implausible_platform(&ua_lower, request.header("sec-ch-ua-platform")) {
            card.add(IMPLAUSIBLE_PLATFORM_SCORE, BotCategory::SpoofedClient, reason);
        }

        if !request.has_header("accept-language") {
            card.add(
                MISSING_LANGUAGE_SCORE,
                BotCategory::IncompleteHeaders,
                "missing_header:accept-language",
            );
        }
        if !request.has_header("accept-encoding") {
            card.add(
                MISSING_ENCODING_SCORE,
                BotCategory::IncompleteHeaders,
                "missing_header:accept-encoding",
            );
        }
        if !request.has_header("connection") {
            card.add(
                MISSING_CONNECTION_SCORE,
                BotCategory::IncompleteHeaders,
                "missing_header:connection",
            );
        }

        let risk_score = card.risk.min(100) as u8;
        BotDetection {
            is_bot: risk_score >= BOT_THRESHOLD,
            confidence: f64::from(risk_score) / 100.0,
            risk_score,
            indicators: card.indicators,
            category: card.strongest.map(|(_, category)| category),
        }
    }

    fn is_datacenter(&self, asn: Option<u32>, as_org: Option<&str>) -> bool {
        if let Some(asn) = asn {
            if DATACENTER_ASNS.contains(&asn) || self.extra_datacenter_asns.contains(&asn) {
                return true;
            }
        }
        as_org.is_some_and(|org| {
            let org = org.to_lowercase();
            DATACENTER_ORG_HINTS.iter().any(|hint| org.contains(hint))
        })
    }
}

/// Browser/OS combinations no shipping client produces
fn implausible_platform(ua: &str, platform_hint: Option<&str>) -> Option<String> {
    if ua.contains("safari") && !ua.contains("chrome") && !ua.contains("chromium") && ua.contains("windows nt") {
        return Some("implausible:safari_on_windows".to_string());
    }
    if ua.contains("msie") && (ua.contains("android") || ua.contains("iphone") || ua.contains("mac os x")) {
        return Some("implausible:ie_on_non_windows".to_string());
    }
    if ua.contains("iphone") && ua.contains("windows nt") {
        return Some("implausible:iphone_on_windows".to_string());
    }
    if ua.contains("android") && (ua.contains("windows nt") || ua.contains("macintosh")) {
        return Some("implausible:android_on_desktop_os".to_string());
    }

    let platform = platform_hint?.trim_matches('"').to_lowercase();
    let claimed = if ua.contains("windows") {
        "windows"
    } else if ua.contains("android") {
        "android"
    } else if ua.contains("iphone") || ua.contains("ipad") {
        "ios"
    } else if ua.contains("mac os x") || ua.contains("macintosh") {
        "macos"
    } else if ua.contains("linux") {
        "linux"
    } else {
        return None;
    };
    let consistent = match claimed {
        "macos" => platform == "macos",
        "ios" => platform == "ios" || platform.is_empty(),
        // Android UAs carry `Linux` too
        "linux" => platform == "linux" || platform == "chrome os" || platform == "chromeos",
        other => platform == other,
    };
    (!consistent && !platform.is_empty() && platform != "unknown")
        .then(|| format!("implausible:{claimed}_ua_with_{platform}_platform"))
}
