//! Query text shared by the SQLite and PostgreSQL backends.
//!
//! Everything here goes through [`QueryBuilder`], which renders the right
//! placeholder style for each driver. Dates are stored as `YYYY-MM-DD` text and
//! instants as unix seconds so the same statements run on both databases.

use chrono::{DateTime, Utc};
use sqlx::{Database, Encode, FromRow, QueryBuilder, Type};

use crate::analytics::models::{
    join_known, AnalyticsScope, Dimension, EnrichedClickRecord, LastClick, LatestLink,
    RecentActivity, UNKNOWN,
};

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

/// Group key expression for a dimension, over the `click_analytics a` alias.
pub(crate) const fn dimension_expr(dimension: Dimension) -> &'static str {
    match dimension {
        Dimension::Browser => "a.browser",
        Dimension::OperatingSystem => "a.operating_system",
        Dimension::Device => "a.device_type",
        Dimension::HourOfDay => "CAST(a.hour_of_day AS TEXT)",
        Dimension::DayOfWeek => "CAST(a.day_of_week AS TEXT)",
        Dimension::Month => "CAST(a.month AS TEXT)",
        Dimension::Day => "a.click_date",
        Dimension::Source => "CASE WHEN a.is_qr_code THEN 'QR Code' ELSE 'Direct Link' END",
        Dimension::City => "a.city",
        Dimension::Country => "a.country",
    }
}

pub(crate) fn push_scope<'a, DB>(qb: &mut QueryBuilder<'a, DB>, scope: &AnalyticsScope)
where
    DB: Database,
    String: Encode<'a, DB> + Type<DB>,
{
    match scope {
        AnalyticsScope::Owner { owner_id, range } => {
            qb.push(" WHERE a.owner_id = ");
            qb.push_bind(owner_id.clone());
            qb.push(" AND a.click_date BETWEEN ");
            qb.push_bind(range.start.format(DATE_FORMAT).to_string());
            qb.push(" AND ");
            qb.push_bind(range.end.format(DATE_FORMAT).to_string());
        }
        AnalyticsScope::OwnerLifetime { owner_id } => {
            qb.push(" WHERE a.owner_id = ");
            qb.push_bind(owner_id.clone());
        }
        AnalyticsScope::Link { short_code } => {
            qb.push(" WHERE a.short_code = ");
            qb.push_bind(short_code.clone());
        }
    }
}

fn push_known<DB: Database>(qb: &mut QueryBuilder<'_, DB>, column: &str) {
    qb.push(format!(
        " AND {column} IS NOT NULL AND {column} <> '' AND {column} <> '{UNKNOWN}'"
    ));
}

pub(crate) fn totals_query<'a, DB>(scope: &AnalyticsScope) -> QueryBuilder<'a, DB>
where
    DB: Database,
    String: Encode<'a, DB> + Type<DB>,
{
    let mut qb = QueryBuilder::new(
        r#"
        SELECT
            COUNT(*) AS total_clicks,
            COUNT(DISTINCT a.ip_address) AS unique_visitors,
            COUNT(*) FILTER (WHERE a.is_qr_code) AS qr_clicks,
            COUNT(*) FILTER (WHERE COALESCE(a.referrer, '') = '') AS direct_clicks
        FROM click_analytics a
        "#,
    );
    push_scope(&mut qb, scope);
    qb
}

pub(crate) fn group_counts_query<'a, DB>(
    scope: &AnalyticsScope,
    dimension: Dimension,
) -> QueryBuilder<'a, DB>
where
    DB: Database,
    String: Encode<'a, DB> + Type<DB>,
{
    let expr = dimension_expr(dimension);
    let mut qb = QueryBuilder::new(format!(
        "SELECT {expr} AS group_key, COUNT(*) AS clicks FROM click_analytics a"
    ));
    push_scope(&mut qb, scope);
    if dimension.skips_unknown() {
        push_known(&mut qb, expr);
    }
    qb.push(" GROUP BY 1 ORDER BY clicks DESC, group_key ASC");
    qb
}

pub(crate) fn geographic_query<'a, DB>(scope: &AnalyticsScope) -> QueryBuilder<'a, DB>
where
    DB: Database,
    String: Encode<'a, DB> + Type<DB>,
{
    let mut qb = QueryBuilder::new(
        "SELECT a.country, a.country_code, COUNT(*) AS clicks FROM click_analytics a",
    );
    push_scope(&mut qb, scope);
    push_known(&mut qb, "a.country");
    qb.push(" GROUP BY a.country, a.country_code ORDER BY clicks DESC, a.country ASC");
    qb
}

pub(crate) fn top_links_query<'a, DB>(scope: &AnalyticsScope, limit: i64) -> QueryBuilder<'a, DB>
where
    DB: Database,
    String: Encode<'a, DB> + Type<DB>,
    i64: Encode<'a, DB> + Type<DB>,
{
    let mut qb = QueryBuilder::new(
        r#"
        SELECT
            a.short_code,
            COALESCE(l.original_url, '') AS original_url,
            COUNT(*) AS total_clicks,
            COUNT(*) FILTER (WHERE a.is_qr_code) AS qr_clicks,
            COUNT(*) FILTER (WHERE COALESCE(a.referrer, '') = '') AS direct_clicks
        FROM click_analytics a
        LEFT JOIN links l ON l.short_code = a.short_code
        "#,
    );
    push_scope(&mut qb, scope);
    qb.push(" GROUP BY a.short_code, l.original_url ORDER BY total_clicks DESC, a.short_code ASC LIMIT ");
    qb.push_bind(limit);
    qb
}

pub(crate) fn recent_activity_query<'a, DB>(
    scope: &AnalyticsScope,
    limit: i64,
) -> QueryBuilder<'a, DB>
where
    DB: Database,
    String: Encode<'a, DB> + Type<DB>,
    i64: Encode<'a, DB> + Type<DB>,
{
    let mut qb = QueryBuilder::new(
        r#"
        SELECT
            a.short_code,
            COALESCE(l.original_url, '') AS original_url,
            a.city,
            a.country,
            a.browser,
            a.device_type,
            a.is_qr_code,
            a.referrer,
            a.click_timestamp
        FROM click_analytics a
        LEFT JOIN links l ON l.short_code = a.short_code
        "#,
    );
    push_scope(&mut qb, scope);
    qb.push(" ORDER BY a.click_timestamp DESC, a.id DESC LIMIT ");
    qb.push_bind(limit);
    qb
}

pub(crate) fn last_click_query<'a, DB>(short_code: &str) -> QueryBuilder<'a, DB>
where
    DB: Database,
    String: Encode<'a, DB> + Type<DB>,
{
    let mut qb = QueryBuilder::new(
        r#"
        SELECT a.browser, a.operating_system, a.device_type, a.city, a.country, a.click_timestamp
        FROM click_analytics a
        WHERE a.short_code = "#,
    );
    qb.push_bind(short_code.to_string());
    qb.push(format!(
        r#"
        AND (
            (a.operating_system <> '' AND a.operating_system <> '{UNKNOWN}') OR
            (a.device_type <> '' AND a.device_type <> '{UNKNOWN}') OR
            (a.city <> '' AND a.city <> '{UNKNOWN}') OR
            (a.country <> '' AND a.country <> '{UNKNOWN}')
        )
        ORDER BY a.click_timestamp DESC, a.id DESC
        LIMIT 1
        "#
    ));
    qb
}

pub(crate) fn latest_link_query<'a, DB>(owner_id: &str) -> QueryBuilder<'a, DB>
where
    DB: Database,
    String: Encode<'a, DB> + Type<DB>,
{
    let mut qb = QueryBuilder::new(
        r#"
        SELECT a.short_code, COALESCE(l.original_url, '') AS original_url, a.click_timestamp
        FROM click_analytics a
        LEFT JOIN links l ON l.short_code = a.short_code
        WHERE a.owner_id = "#,
    );
    qb.push_bind(owner_id.to_string());
    qb.push(" ORDER BY a.click_timestamp DESC, a.id DESC LIMIT 1");
    qb
}

pub(crate) fn insert_click_query<'a, DB>(record: &EnrichedClickRecord) -> QueryBuilder<'a, DB>
where
    DB: Database,
    String: Encode<'a, DB> + Type<DB>,
    Option<String>: Encode<'a, DB> + Type<DB>,
    bool: Encode<'a, DB> + Type<DB>,
    i32: Encode<'a, DB> + Type<DB>,
    i64: Encode<'a, DB> + Type<DB>,
    f64: Encode<'a, DB> + Type<DB>,
{
    let mut qb = QueryBuilder::new(
        r#"
        INSERT INTO click_analytics (
            event_id, short_code, owner_id, ip_address, user_agent, referrer, is_qr_code,
            browser, browser_version, operating_system, os_version, device_type,
            country, country_code, city, region, timezone, latitude, longitude,
            click_timestamp, click_date, day_of_week, hour_of_day, week_of_year, month, year,
            created_at
        ) VALUES ("#,
    );

    let mut values = qb.separated(", ");
    values.push_bind(record.event_id.to_string());
    values.push_bind(record.short_code.clone());
    values.push_bind(record.owner_user_id.clone());
    values.push_bind(record.ip.clone());
    values.push_bind(record.user_agent.clone());
    values.push_bind(record.referrer.clone());
    values.push_bind(record.is_qr);
    values.push_bind(record.browser.clone());
    values.push_bind(record.browser_version.clone());
    values.push_bind(record.os.clone());
    values.push_bind(record.os_version.clone());
    values.push_bind(record.device_type.as_str().to_string());
    values.push_bind(record.country.clone());
    values.push_bind(record.country_code.clone());
    values.push_bind(record.city.clone());
    values.push_bind(record.region.clone());
    values.push_bind(record.timezone.clone());
    values.push_bind(record.latitude);
    values.push_bind(record.longitude);
    values.push_bind(record.click_timestamp.timestamp());
    values.push_bind(record.click_date.format(DATE_FORMAT).to_string());
    values.push_bind(small(record.day_of_week));
    values.push_bind(small(record.hour_of_day));
    values.push_bind(small(record.week_of_year));
    values.push_bind(small(record.month));
    values.push_bind(record.year);
    values.push_bind(Utc::now().timestamp());

    qb.push(") ON CONFLICT (event_id) DO NOTHING");
    qb
}

// Calendar fields are all well below i32::MAX.
fn small(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[derive(Debug, FromRow)]
pub(crate) struct RecentActivityRow {
    pub short_code: String,
    pub original_url: String,
    pub city: String,
    pub country: String,
    pub browser: String,
    pub device_type: String,
    pub is_qr_code: bool,
    pub referrer: Option<String>,
    pub click_timestamp: i64,
}

impl From<RecentActivityRow> for RecentActivity {
    fn from(row: RecentActivityRow) -> Self {
        let location = recent_location(&row.city, &row.country);
        let click_source = click_source(row.is_qr_code, row.referrer.as_deref());
        Self {
            short_code: row.short_code,
            original_url: row.original_url,
            location,
            device: format!("{} ({})", row.browser, row.device_type),
            click_source: click_source.to_string(),
            clicked_at: from_unix(row.click_timestamp),
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct LastClickRow {
    pub browser: String,
    pub operating_system: String,
    pub device_type: String,
    pub city: String,
    pub country: String,
    pub click_timestamp: i64,
}

impl From<LastClickRow> for LastClick {
    fn from(row: LastClickRow) -> Self {
        Self {
            clicked_at: from_unix(row.click_timestamp),
            browser: row.browser,
            device: join_known(&[&row.operating_system, &row.device_type]),
            location: join_known(&[&row.city, &row.country]),
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct LatestLinkRow {
    pub short_code: String,
    pub original_url: String,
    pub click_timestamp: i64,
}

impl From<LatestLinkRow> for LatestLink {
    fn from(row: LatestLinkRow) -> Self {
        Self {
            short_code: row.short_code,
            original_url: row.original_url,
            clicked_at: from_unix(row.click_timestamp),
        }
    }
}

pub(crate) fn recent_location(city: &str, country: &str) -> String {
    let location = join_known(&[city, country]);
    if location.contains(", ") {
        location
    } else {
        "N/A".to_string()
    }
}

pub(crate) fn click_source(is_qr: bool, referrer: Option<&str>) -> &'static str {
    match (is_qr, referrer) {
        (true, _) => "QR Code",
        (false, None) => "Direct Visit",
        (false, Some(r)) if r.is_empty() => "Direct Visit",
        (false, Some(_)) => "External Source",
    }
}

pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_location_requires_city_and_country() {
        assert_eq!(recent_location("Paris", "France"), "Paris, France");
        assert_eq!(recent_location(UNKNOWN, "France"), "N/A");
        assert_eq!(recent_location("", ""), "N/A");
    }

    #[test]
    fn test_click_source_labels() {
        assert_eq!(click_source(true, Some("https://t.co")), "QR Code");
        assert_eq!(click_source(false, None), "Direct Visit");
        assert_eq!(click_source(false, Some("")), "Direct Visit");
        assert_eq!(click_source(false, Some("https://t.co")), "External Source");
    }

    #[test]
    fn test_group_query_filters_unknown_browsers() {
        let scope = AnalyticsScope::Link {
            short_code: "abc".to_string(),
        };
        let qb = group_counts_query::<sqlx::Sqlite>(&scope, Dimension::Browser);
        let sql = qb.sql();
        assert!(sql.contains("a.browser <> 'Unknown'"));
        assert!(sql.contains("GROUP BY 1"));

        let qb = group_counts_query::<sqlx::Sqlite>(&scope, Dimension::Device);
        assert!(!qb.sql().contains("'Unknown'"));
    }

    #[test]
    fn test_lifetime_scope_has_no_date_filter() {
        let scope = AnalyticsScope::OwnerLifetime {
            owner_id: "u1".to_string(),
        };
        let qb = totals_query::<sqlx::Sqlite>(&scope);
        let sql = qb.sql();
        assert!(sql.contains("a.owner_id = ?"));
        assert!(!sql.contains("click_date"));
    }

    #[test]
    fn test_postgres_placeholders() {
        let scope = AnalyticsScope::Owner {
            owner_id: "u1".to_string(),
            range: crate::analytics::models::DateRange::last_days(30),
        };
        let qb = totals_query::<sqlx::Postgres>(&scope);
        let sql = qb.sql();
        assert!(sql.contains("$1"));
        assert!(sql.contains("$3"));
    }
}
