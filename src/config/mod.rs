use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

const DEV_SIGNING_SECRET: &str = "clickedge-development-signing-secret-change-me";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub environment: String,
    pub edge_location: String,
    pub backend: BackendConfig,
    pub signing: SigningConfig,
    pub features: FeatureFlags,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub default_fallback_url: String,
    pub bot_block_threshold: u8,
    #[serde(skip_serializing)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(skip_serializing)]
    pub secret: String,
    pub link_ttl_secs: i64,
    pub allow_legacy_codes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub bot_detection: bool,
    pub geo_validation: bool,
    pub device_detection: bool,
    pub failover: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub max_attempts: u32,
    /// Hard cap on persisted entries before new clicks spill to overflow storage
    pub durable_max_entries: usize,
    pub durable_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub url: String,
    pub overflow_dir: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrustedProxyMode {
    /// Trust the `CF-Connecting-IP` header set by the edge
    Cloudflare,
    /// Walk `Forwarded` / `X-Forwarded-For` with trust validation
    Standard,
    /// Use the socket address only
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub trusted_proxy_mode: TrustedProxyMode,
    pub trusted_proxies: Vec<IpNet>,
    pub num_trusted_proxies: Option<usize>,
    pub geoip_city_db_path: Option<String>,
    pub geoip_asn_db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8787,
            },
            environment: "production".to_string(),
            edge_location: "local".to_string(),
            backend: BackendConfig {
                url: "http://127.0.0.1:8080".to_string(),
                timeout_secs: 5,
            },
            signing: SigningConfig {
                secret: DEV_SIGNING_SECRET.to_string(),
                link_ttl_secs: 86_400,
                allow_legacy_codes: false,
            },
            features: FeatureFlags {
                bot_detection: true,
                geo_validation: true,
                device_detection: true,
                failover: true,
            },
            queue: QueueConfig {
                batch_size: 50,
                flush_interval_secs: 10,
                max_attempts: 5,
                durable_max_entries: 10_000,
                durable_ttl_secs: 3 * 86_400,
            },
            storage: StorageConfig {
                backend: StorageBackend::Sqlite,
                url: "sqlite://./clickedge.db?mode=rwc".to_string(),
                overflow_dir: "./overflow".to_string(),
            },
            network: NetworkConfig {
                trusted_proxy_mode: TrustedProxyMode::Cloudflare,
                trusted_proxies: Vec::new(),
                num_trusted_proxies: None,
                geoip_city_db_path: None,
                geoip_asn_db_path: None,
            },
            default_fallback_url: "https://example.com/".to_string(),
            bot_block_threshold: 70,
            admin_token: None,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let host = std::env::var("EDGE_HOST").unwrap_or(defaults.server.host);
        let port = env_parse("EDGE_PORT", defaults.server.port)?;

        let secret = match std::env::var("LINK_SIGNING_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!(
                    "LINK_SIGNING_SECRET is not set, using the development secret. Signed links will not be portable"
                );
                defaults.signing.secret
            }
        };

        let link_ttl_secs = env_parse("LINK_TTL_SECONDS", defaults.signing.link_ttl_secs)?;
        if link_ttl_secs <= 0 {
            anyhow::bail!("LINK_TTL_SECONDS must be positive");
        }

        let storage_backend = match std::env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "sqlite".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => StorageBackend::Memory,
            "sqlite" => StorageBackend::Sqlite,
            other => {
                tracing::warn!(
                    "Unknown STORAGE_BACKEND '{other}', falling back to 'sqlite'. Supported values: memory, sqlite"
                );
                StorageBackend::Sqlite
            }
        };

        let trusted_proxy_mode = match std::env::var("TRUSTED_PROXY_MODE")
            .unwrap_or_else(|_| "cloudflare".to_string())
            .to_lowercase()
            .as_str()
        {
            "cloudflare" => TrustedProxyMode::Cloudflare,
            "standard" => TrustedProxyMode::Standard,
            "none" => TrustedProxyMode::None,
            other => {
                tracing::warn!(
                    "Unknown TRUSTED_PROXY_MODE '{other}', falling back to 'cloudflare'"
                );
                TrustedProxyMode::Cloudflare
            }
        };

        let trusted_proxies = std::env::var("TRUSTED_PROXIES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpNet>()
                    .with_context(|| format!("TRUSTED_PROXIES entry '{s}' is not a CIDR range"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let num_trusted_proxies = std::env::var("NUM_TRUSTED_PROXIES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok());

        let batch_size = env_parse("QUEUE_BATCH_SIZE", defaults.queue.batch_size)?.max(1);

        Ok(Config {
            server: ServerConfig { host, port },
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            edge_location: std::env::var("EDGE_LOCATION").unwrap_or(defaults.edge_location),
            backend: BackendConfig {
                url: std::env::var("BACKEND_URL")
                    .unwrap_or(defaults.backend.url)
                    .trim_end_matches('/')
                    .to_string(),
                timeout_secs: env_parse("BACKEND_TIMEOUT_SECS", defaults.backend.timeout_secs)?,
            },
            signing: SigningConfig {
                secret,
                link_ttl_secs,
                allow_legacy_codes: env_flag(
                    "ALLOW_LEGACY_TRACKING_CODES",
                    defaults.signing.allow_legacy_codes,
                ),
            },
            features: FeatureFlags {
                bot_detection: env_flag("ENABLE_BOT_DETECTION", true),
                geo_validation: env_flag("ENABLE_GEO_VALIDATION", true),
                device_detection: env_flag("ENABLE_DEVICE_DETECTION", true),
                failover: env_flag("ENABLE_FAILOVER", true),
            },
            queue: QueueConfig {
                batch_size,
                flush_interval_secs: env_parse(
                    "QUEUE_FLUSH_INTERVAL_SECS",
                    defaults.queue.flush_interval_secs,
                )?,
                max_attempts: env_parse("QUEUE_MAX_ATTEMPTS", defaults.queue.max_attempts)?,
                durable_max_entries: env_parse(
                    "DURABLE_MAX_ENTRIES",
                    defaults.queue.durable_max_entries,
                )?,
                durable_ttl_secs: env_parse("DURABLE_TTL_SECS", defaults.queue.durable_ttl_secs)?,
            },
            storage: StorageConfig {
                backend: storage_backend,
                url: std::env::var("STORAGE_URL").unwrap_or(defaults.storage.url),
                overflow_dir: std::env::var("OVERFLOW_DIR").unwrap_or(defaults.storage.overflow_dir),
            },
            network: NetworkConfig {
                trusted_proxy_mode,
                trusted_proxies,
                num_trusted_proxies,
                geoip_city_db_path: std::env::var("GEOIP_CITY_DB_PATH").ok(),
                geoip_asn_db_path: std::env::var("GEOIP_ASN_DB_PATH").ok(),
            },
            default_fallback_url: std::env::var("DEFAULT_FALLBACK_URL")
                .unwrap_or(defaults.default_fallback_url),
            bot_block_threshold: env_parse("BOT_BLOCK_THRESHOLD", defaults.bot_block_threshold)?
                .min(100),
            admin_token: std::env::var("EDGE_ADMIN_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
        })
    }
}
