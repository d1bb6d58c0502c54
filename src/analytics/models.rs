//! Data models for the click pipeline

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Placeholder stored for any attribute that could not be resolved.
pub const UNKNOWN: &str = "Unknown";

/// A click exactly as observed on the redirect path, before enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawClickEvent {
    /// Identity used to make re-delivered events idempotent at insert time
    pub event_id: Uuid,
    pub short_code: String,
    pub ip: String,
    #[serde(rename = "ua")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default)]
    pub is_qr: bool,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
}

impl RawClickEvent {
    /// Build an event stamped with the current UTC instant.
    pub fn new(
        short_code: impl Into<String>,
        ip: impl Into<String>,
        user_agent: impl Into<String>,
        referrer: Option<String>,
        is_qr: bool,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            short_code: short_code.into(),
            ip: ip.into(),
            user_agent: user_agent.into(),
            referrer: referrer.filter(|r| !r.is_empty()),
            is_qr,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "Desktop",
            DeviceType::Mobile => "Mobile",
            DeviceType::Tablet => "Tablet",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic location information derived from IP address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// Country name
    pub country: String,

    /// ISO country code (e.g., "US", "GB")
    pub country_code: String,

    pub city: String,

    /// Region/state/province
    pub region: String,

    /// IANA timezone name
    pub timezone: String,

    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    /// Whether a lookup produced a usable country.
    pub fn has_country(&self) -> bool {
        is_known(&self.country_code)
    }
}

impl Default for GeoLocation {
    fn default() -> Self {
        Self {
            country: UNKNOWN.to_string(),
            country_code: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
            region: UNKNOWN.to_string(),
            timezone: UNKNOWN.to_string(),
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

/// One persisted analytics row. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedClickRecord {
    pub event_id: Uuid,
    pub short_code: String,
    /// Owner of the link at enrichment time; absent if the link was gone
    pub owner_user_id: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub referrer: Option<String>,
    pub is_qr: bool,

    pub browser: String,
    pub browser_version: String,
    pub os: String,
    pub os_version: String,
    pub device_type: DeviceType,

    pub country: String,
    pub country_code: String,
    pub city: String,
    pub region: String,
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,

    pub click_timestamp: DateTime<Utc>,
    pub click_date: NaiveDate,
    /// 0 = Sunday .. 6 = Saturday
    pub day_of_week: u32,
    pub hour_of_day: u32,
    /// ISO 8601 week number
    pub week_of_year: u32,
    pub month: u32,
    pub year: i32,
}

impl EnrichedClickRecord {
    pub fn is_direct(&self) -> bool {
        self.referrer.as_deref().map_or(true, str::is_empty)
    }

    pub fn source_label(&self) -> &'static str {
        if self.is_qr {
            QR_SOURCE
        } else {
            DIRECT_SOURCE
        }
    }
}

pub const QR_SOURCE: &str = "QR Code";
pub const DIRECT_SOURCE: &str = "Direct Link";

/// `true` for values that are neither empty nor the [`UNKNOWN`] placeholder.
pub fn is_known(value: &str) -> bool {
    !value.is_empty() && value != UNKNOWN
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// The `days` days ending today (UTC), inclusive.
    pub fn last_days(days: u32) -> Self {
        let end = Utc::now().date_naive();
        let start = end - chrono::Duration::days(i64::from(days));
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Which slice of the analytics table an aggregate query covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyticsScope {
    Owner { owner_id: String, range: DateRange },
    /// Every click on the owner's links, regardless of date
    OwnerLifetime { owner_id: String },
    Link { short_code: String },
}

impl AnalyticsScope {
    pub fn matches(&self, record: &EnrichedClickRecord) -> bool {
        match self {
            AnalyticsScope::Owner { owner_id, range } => {
                record.owner_user_id.as_deref() == Some(owner_id.as_str())
                    && range.contains(record.click_date)
            }
            AnalyticsScope::OwnerLifetime { owner_id } => {
                record.owner_user_id.as_deref() == Some(owner_id.as_str())
            }
            AnalyticsScope::Link { short_code } => record.short_code == *short_code,
        }
    }
}

/// A grouped-count dimension of the analytics table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Browser,
    OperatingSystem,
    Device,
    HourOfDay,
    DayOfWeek,
    Month,
    Day,
    Source,
    City,
    Country,
}

impl Dimension {
    pub const fn name(&self) -> &'static str {
        match self {
            Dimension::Browser => "browser",
            Dimension::OperatingSystem => "operating_system",
            Dimension::Device => "device",
            Dimension::HourOfDay => "hour_of_day",
            Dimension::DayOfWeek => "day_of_week",
            Dimension::Month => "month",
            Dimension::Day => "day",
            Dimension::Source => "source",
            Dimension::City => "city",
            Dimension::Country => "country",
        }
    }

    /// Dimensions whose "Unknown" bucket is left out of the counts.
    pub const fn skips_unknown(&self) -> bool {
        matches!(self, Dimension::Browser | Dimension::OperatingSystem)
    }

    /// Group key of `record` for this dimension.
    pub fn key_of(&self, record: &EnrichedClickRecord) -> String {
        match self {
            Dimension::Browser => record.browser.clone(),
            Dimension::OperatingSystem => record.os.clone(),
            Dimension::Device => record.device_type.as_str().to_string(),
            Dimension::HourOfDay => record.hour_of_day.to_string(),
            Dimension::DayOfWeek => record.day_of_week.to_string(),
            Dimension::Month => record.month.to_string(),
            Dimension::Day => record.click_date.format("%Y-%m-%d").to_string(),
            Dimension::Source => record.source_label().to_string(),
            Dimension::City => record.city.clone(),
            Dimension::Country => record.country.clone(),
        }
    }
}

/// One row of a grouped COUNT query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupCount {
    #[sqlx(rename = "group_key")]
    pub key: String,
    pub clicks: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClickTotals {
    pub total_clicks: i64,
    /// Distinct client IPs
    pub unique_visitors: i64,
    pub qr_clicks: i64,
    /// Clicks without a referrer
    pub direct_clicks: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GeographicCount {
    pub country: String,
    pub country_code: String,
    pub clicks: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TopLink {
    pub short_code: String,
    pub original_url: String,
    pub total_clicks: i64,
    pub qr_clicks: i64,
    pub direct_clicks: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentActivity {
    pub short_code: String,
    pub original_url: String,
    /// "City, Country" or "N/A"
    pub location: String,
    /// "Browser (Device)"
    pub device: String,
    /// "QR Code", "Direct Visit" or "External Source"
    pub click_source: String,
    pub clicked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastClick {
    pub clicked_at: DateTime<Utc>,
    pub browser: String,
    /// "OS, Device" with unknown parts dropped
    pub device: String,
    /// "City, Country" with unknown parts dropped
    pub location: String,
}

/// Request-scoped merge of every per-dimension query. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateView {
    pub totals: ClickTotals,
    pub browsers: BTreeMap<String, i64>,
    pub operating_systems: BTreeMap<String, i64>,
    pub devices: BTreeMap<String, i64>,
    pub hourly: BTreeMap<u32, i64>,
    pub weekly: BTreeMap<u32, i64>,
    pub monthly: BTreeMap<u32, i64>,
    pub daily: BTreeMap<String, i64>,
    pub sources: BTreeMap<String, i64>,
    pub geographic: Vec<GeographicCount>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub top_links: Vec<TopLink>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_activity: Vec<RecentActivity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_click: Option<LastClick>,
}

/// The owner's most recently clicked link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestLink {
    pub short_code: String,
    pub original_url: String,
    pub clicked_at: DateTime<Utc>,
}

/// Lifetime profile of one link: its click count and the most common value of
/// each attribute. Ties go to the smallest key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub short_code: String,
    pub original_url: String,
    pub last_clicked_at: DateTime<Utc>,
    pub total_clicks: i64,
    /// 0 = Sunday .. 6 = Saturday
    pub top_day_of_week: Option<u32>,
    pub top_city: Option<String>,
    pub top_country: Option<String>,
    pub top_browser: Option<String>,
    pub top_os: Option<String>,
    pub top_device: Option<String>,
}

/// Owner landing page: all-time totals plus the most recently clicked link.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardView {
    pub totals: ClickTotals,
    pub recent_link: Option<LinkSnapshot>,
}

/// Join the known parts of a label, e.g. `"Paris, France"`.
pub(crate) fn join_known(parts: &[&str]) -> String {
    parts
        .iter()
        .copied()
        .filter(|p| is_known(p))
        .collect::<Vec<_>>()
        .join(", ")
}
