use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::allocator::{
    self, DEFAULT_BLOCK_SIZE, DEFAULT_CODE_WIDTH, DEFAULT_COUNTER_KEY, DEFAULT_COUNTER_START,
    MAX_CODE_WIDTH,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api_server: ServerConfig,
    pub redirect_server: ServerConfig,
    pub redirect: RedirectConfig,
    pub cache: CacheConfig,
    pub allocator: AllocatorConfig,
    pub analytics: AnalyticsConfig,
    pub access_token: AccessTokenConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectConfig {
    /// HTTP status used for redirects (301, 302, 303, 307 or 308)
    pub status_code: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    pub counter_key: String,
    pub block_size: i64,
    /// Initial counter value, chosen so every code has the full width
    pub start: i64,
    pub code_width: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustedProxyMode {
    /// Use the socket address only
    None,
    /// Forwarded / X-Forwarded-For with trust validation
    Standard,
    /// CF-Connecting-IP
    Cloudflare,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub enabled: bool,
    /// Path to a GeoLite2/GeoIP2 City database
    pub geoip_city_db: Option<String>,
    /// Base URL of the remote geolocation fallback
    pub remote_geo_url: Option<String>,
    pub remote_geo_timeout_ms: u64,
    pub ip_anonymization: bool,
    pub trusted_proxy_mode: TrustedProxyMode,
    pub trusted_proxies: Vec<IpNet>,
    pub num_trusted_proxies: Option<usize>,
    pub worker_interval_secs: u64,
    pub claim_lease_secs: u64,
    pub query_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenConfig {
    /// HMAC secret; a random per-process key is used when unset
    pub secret: Option<String>,
    pub ttl_secs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            geoip_city_db: None,
            remote_geo_url: None,
            remote_geo_timeout_ms: 2000,
            ip_anonymization: false,
            trusted_proxy_mode: TrustedProxyMode::None,
            trusted_proxies: Vec::new(),
            num_trusted_proxies: None,
            worker_interval_secs: 5,
            claim_lease_secs: 60,
            query_timeout_ms: 5000,
        }
    }
}

impl AnalyticsConfig {
    pub fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval_secs.max(1))
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                backend: DatabaseBackend::Sqlite,
                url: "sqlite://./linkpulse.db?mode=rwc".to_string(),
                max_connections: 10,
            },
            api_server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            redirect_server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            redirect: RedirectConfig { status_code: 301 },
            cache: CacheConfig {
                max_entries: 100_000,
                ttl_secs: 300,
            },
            allocator: AllocatorConfig {
                counter_key: DEFAULT_COUNTER_KEY.to_string(),
                block_size: DEFAULT_BLOCK_SIZE,
                start: DEFAULT_COUNTER_START,
                code_width: DEFAULT_CODE_WIDTH,
            },
            analytics: AnalyticsConfig::default(),
            access_token: AccessTokenConfig {
                secret: None,
                ttl_secs: 60,
            },
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{v}'")),
        _ => Ok(default),
    }
}

/// Default counter start for `SHORT_CODE_WIDTH`; widths whose first full
/// value does not fit the signed counter are rejected.
fn start_for_width(width: usize) -> anyhow::Result<i64> {
    match allocator::counter_start(width) {
        Some(start) => Ok(start),
        None => anyhow::bail!("SHORT_CODE_WIDTH must be between 1 and {MAX_CODE_WIDTH}, got {width}"),
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        let backend_str =
            std::env::var("DATABASE_BACKEND").unwrap_or_else(|_| "sqlite".to_string());

        let backend = match backend_str.to_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            "memory" => DatabaseBackend::Memory,
            "sqlite" => DatabaseBackend::Sqlite,
            other => {
                tracing::warn!(
                    "Unknown DATABASE_BACKEND '{other}', falling back to 'sqlite'. Supported values: sqlite, postgres, memory"
                );
                DatabaseBackend::Sqlite
            }
        };

        let database_url = std::env::var("DATABASE_URL").unwrap_or(defaults.database.url);
        let max_connections =
            env_parse("DATABASE_MAX_CONNECTIONS", defaults.database.max_connections)?;

        let api_host = std::env::var("API_HOST").unwrap_or(defaults.api_server.host);
        let api_port = env_parse("API_PORT", defaults.api_server.port)?;

        let redirect_host = std::env::var("REDIRECT_HOST").unwrap_or(defaults.redirect_server.host);
        let redirect_port = env_parse("REDIRECT_PORT", defaults.redirect_server.port)?;

        let status_code = env_parse("REDIRECT_STATUS", defaults.redirect.status_code)?;
        if !matches!(status_code, 301 | 302 | 303 | 307 | 308) {
            anyhow::bail!("REDIRECT_STATUS must be one of 301, 302, 303, 307, 308");
        }

        let code_width = env_parse("SHORT_CODE_WIDTH", defaults.allocator.code_width)?;
        let default_start = start_for_width(code_width)?;
        let allocator = AllocatorConfig {
            counter_key: std::env::var("COUNTER_KEY").unwrap_or(defaults.allocator.counter_key),
            block_size: env_parse("COUNTER_BLOCK_SIZE", defaults.allocator.block_size)?,
            start: env_parse("COUNTER_START", default_start)?,
            code_width,
        };

        let trusted_proxy_mode = match std::env::var("ANALYTICS_TRUSTED_PROXY_MODE")
            .unwrap_or_else(|_| "none".to_string())
            .to_lowercase()
            .as_str()
        {
            "standard" => TrustedProxyMode::Standard,
            "cloudflare" => TrustedProxyMode::Cloudflare,
            "none" => TrustedProxyMode::None,
            other => {
                tracing::warn!(
                    "Unknown ANALYTICS_TRUSTED_PROXY_MODE '{other}', falling back to 'none'. Supported values: none, standard, cloudflare"
                );
                TrustedProxyMode::None
            }
        };

        let trusted_proxies = env_opt("ANALYTICS_TRUSTED_PROXIES")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<IpNet>()
                            .with_context(|| format!("invalid trusted proxy range '{s}'"))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let analytics_defaults = defaults.analytics;
        let analytics = AnalyticsConfig {
            enabled: env_flag("ANALYTICS_ENABLED", analytics_defaults.enabled),
            geoip_city_db: env_opt("ANALYTICS_GEOIP_CITY_DB"),
            remote_geo_url: env_opt("ANALYTICS_REMOTE_GEO_URL"),
            remote_geo_timeout_ms: env_parse(
                "ANALYTICS_REMOTE_GEO_TIMEOUT_MS",
                analytics_defaults.remote_geo_timeout_ms,
            )?,
            ip_anonymization: env_flag(
                "ANALYTICS_IP_ANONYMIZATION",
                analytics_defaults.ip_anonymization,
            ),
            trusted_proxy_mode,
            trusted_proxies,
            num_trusted_proxies: env_opt("ANALYTICS_NUM_TRUSTED_PROXIES")
                .map(|v| v.parse::<usize>())
                .transpose()
                .context("ANALYTICS_NUM_TRUSTED_PROXIES must be a number")?,
            worker_interval_secs: env_parse(
                "ANALYTICS_WORKER_INTERVAL_SECS",
                analytics_defaults.worker_interval_secs,
            )?,
            claim_lease_secs: env_parse(
                "ANALYTICS_CLAIM_LEASE_SECS",
                analytics_defaults.claim_lease_secs,
            )?,
            query_timeout_ms: env_parse(
                "ANALYTICS_QUERY_TIMEOUT_MS",
                analytics_defaults.query_timeout_ms,
            )?,
        };

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections,
            },
            api_server: ServerConfig {
                host: api_host,
                port: api_port,
            },
            redirect_server: ServerConfig {
                host: redirect_host,
                port: redirect_port,
            },
            redirect: RedirectConfig { status_code },
            cache: CacheConfig {
                max_entries: env_parse("LINK_CACHE_MAX_ENTRIES", defaults.cache.max_entries)?,
                ttl_secs: env_parse("LINK_CACHE_TTL_SECS", defaults.cache.ttl_secs)?,
            },
            allocator,
            analytics,
            access_token: AccessTokenConfig {
                secret: env_opt("ACCESS_TOKEN_SECRET"),
                ttl_secs: env_parse("ACCESS_TOKEN_TTL_SECS", defaults.access_token.ttl_secs)?,
            },
        })
    }
}
