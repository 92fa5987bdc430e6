pub mod bot;
pub mod device;
pub mod geo;
pub mod geoip;
pub mod ip_extractor;
pub mod rules;

pub use bot::{BotCategory, BotDetection, BotDetector};
pub use device::{DeviceDecision, DeviceDetector, DeviceInfo};
pub use geo::{normalize_country, GeoDecision, GeoInfo, GeoValidator};
pub use geoip::GeoIpService;
pub use ip_extractor::extract_client_ip;
pub use rules::{RuleResolver, RuleTarget};
