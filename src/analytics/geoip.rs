//! IP geolocation: an offline MaxMind City database, an optional remote
//! lookup service, and a resolver that only asks the remote side when the
//! offline database has no country for the address.

use anyhow::{Context, Result};
use async_trait::async_trait;
use maxminddb::{geoip2, Mmap, Reader};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::analytics::models::GeoLocation;
use crate::config::AnalyticsConfig;

/// A source of IP geolocation.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation>;
}

/// GeoIP lookup service backed by a memory-mapped GeoLite2/GeoIP2 City database
pub struct GeoIpService {
    city_reader: Arc<Reader<Mmap>>,
}

impl GeoIpService {
    /// Open the City database at `city_path`
    pub fn new(city_path: &str) -> Result<Self> {
        let reader = unsafe { Reader::open_mmap(city_path) }
            .with_context(|| format!("Failed to open GeoIP City database at {}", city_path))?;
        Ok(Self {
            city_reader: Arc::new(reader),
        })
    }

    /// Lookup geographic location for an IP address
    ///
    /// Returns the default (all unknown) location when the address is not in
    /// the database.
    pub fn lookup_city(&self, ip: IpAddr) -> GeoLocation {
        let mut geo_location = GeoLocation::default();

        if let Ok(result) = self.city_reader.lookup(ip) {
            if let Ok(Some(city)) = result.decode::<geoip2::City>() {
                extract_from_city(&city, &mut geo_location);
            }
        }

        geo_location
    }
}

fn set_if_present(target: &mut String, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        *target = v.to_string();
    }
}

fn extract_from_city(city: &geoip2::City, geo_location: &mut GeoLocation) {
    set_if_present(&mut geo_location.country_code, city.country.iso_code);
    set_if_present(&mut geo_location.country, city.country.names.english);
    set_if_present(&mut geo_location.city, city.city.names.english);

    if let Some(subdivision) = city.subdivisions.first() {
        set_if_present(&mut geo_location.region, subdivision.names.english);
    }

    set_if_present(&mut geo_location.timezone, city.location.time_zone);
    geo_location.latitude = city.location.latitude.unwrap_or_default();
    geo_location.longitude = city.location.longitude.unwrap_or_default();
}

impl Clone for GeoIpService {
    fn clone(&self) -> Self {
        Self {
            city_reader: self.city_reader.clone(),
        }
    }
}

#[async_trait]
impl GeoLookup for GeoIpService {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation> {
        Ok(self.lookup_city(ip))
    }
}

#[derive(Debug, Deserialize)]
struct RemoteGeoResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    reason: Option<String>,
    country_name: Option<String>,
    country_code: Option<String>,
    city: Option<String>,
    region: Option<String>,
    timezone: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// HTTP geolocation service speaking the ipapi.co JSON format
/// (`GET {base_url}/{ip}/json/`).
pub struct RemoteGeoLookup {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteGeoLookup {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("linkpulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build geolocation HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLookup for RemoteGeoLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation> {
        let url = format!("{}/{}/json/", self.base_url, ip);
        let body: RemoteGeoResponse = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("geolocation request for {} failed", ip))?
            .error_for_status()?
            .json()
            .await
            .context("invalid geolocation response")?;

        if body.error {
            anyhow::bail!(
                "geolocation service refused {}: {}",
                ip,
                body.reason.unwrap_or_default()
            );
        }

        let mut location = GeoLocation::default();
        set_if_present(&mut location.country, body.country_name.as_deref());
        set_if_present(&mut location.country_code, body.country_code.as_deref());
        set_if_present(&mut location.city, body.city.as_deref());
        set_if_present(&mut location.region, body.region.as_deref());
        set_if_present(&mut location.timezone, body.timezone.as_deref());
        location.latitude = body.latitude.unwrap_or_default();
        location.longitude = body.longitude.unwrap_or_default();
        Ok(location)
    }
}

/// Chains the offline database with the remote fallback.
#[derive(Clone, Default)]
pub struct GeoResolver {
    primary: Option<Arc<dyn GeoLookup>>,
    fallback: Option<Arc<dyn GeoLookup>>,
}

impl GeoResolver {
    pub fn new(primary: Option<Arc<dyn GeoLookup>>, fallback: Option<Arc<dyn GeoLookup>>) -> Self {
        Self { primary, fallback }
    }

    /// Build from configuration. A database that fails to open is logged and
    /// skipped so clicks still flow with unknown locations.
    pub fn from_config(config: &AnalyticsConfig) -> Self {
        let primary = config.geoip_city_db.as_deref().and_then(|path| {
            match GeoIpService::new(path) {
                Ok(service) => {
                    info!("🌍 GeoIP City database loaded from {}", path);
                    Some(Arc::new(service) as Arc<dyn GeoLookup>)
                }
                Err(e) => {
                    warn!("GeoIP database unavailable, locations will be unknown: {:#}", e);
                    None
                }
            }
        });

        let fallback = config.remote_geo_url.as_deref().and_then(|url| {
            let timeout = Duration::from_millis(config.remote_geo_timeout_ms);
            match RemoteGeoLookup::new(url, timeout) {
                Ok(remote) => {
                    info!("🌍 Remote geolocation fallback: {}", url);
                    Some(Arc::new(remote) as Arc<dyn GeoLookup>)
                }
                Err(e) => {
                    warn!("Remote geolocation disabled: {:#}", e);
                    None
                }
            }
        });

        Self::new(primary, fallback)
    }

    /// Resolve `ip`. Never fails: anything unresolvable is reported as unknown.
    pub async fn resolve(&self, ip: &str) -> GeoLocation {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return GeoLocation::default();
        };

        let mut location = GeoLocation::default();
        if let Some(primary) = &self.primary {
            match primary.lookup(addr).await {
                Ok(found) if found.has_country() => return found,
                Ok(found) => location = found,
                Err(e) => debug!(ip = %addr, error = %e, "offline geolocation failed"),
            }
        }

        if let Some(fallback) = &self.fallback {
            if is_public(addr) {
                match fallback.lookup(addr).await {
                    Ok(found) if found.has_country() => return found,
                    Ok(_) => {}
                    Err(e) => debug!(ip = %addr, error = %e, "remote geolocation failed"),
                }
            }
        }

        location
    }
}

fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}
