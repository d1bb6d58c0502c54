//! Turns a raw click into the persisted analytics row.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::analytics::models::{EnrichedClickRecord, GeoLocation, RawClickEvent};
use crate::analytics::user_agent;

/// Calendar breakdown of a click instant, all in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarFields {
    /// 0 = Sunday .. 6 = Saturday
    pub day_of_week: u32,
    pub hour_of_day: u32,
    pub week_of_year: u32,
    pub month: u32,
    pub year: i32,
}

impl From<DateTime<Utc>> for CalendarFields {
    fn from(ts: DateTime<Utc>) -> Self {
        Self {
            day_of_week: ts.weekday().num_days_from_sunday(),
            hour_of_day: ts.hour(),
            week_of_year: ts.iso_week().week(),
            month: ts.month(),
            year: ts.year(),
        }
    }
}

/// Combine a raw event with its resolved owner and location.
pub fn enrich(
    event: &RawClickEvent,
    owner_user_id: Option<String>,
    geo: GeoLocation,
) -> EnrichedClickRecord {
    let ua = user_agent::parse(&event.user_agent);
    let calendar = CalendarFields::from(event.timestamp);

    EnrichedClickRecord {
        event_id: event.event_id,
        short_code: event.short_code.clone(),
        owner_user_id,
        ip: event.ip.clone(),
        user_agent: event.user_agent.clone(),
        referrer: event.referrer.clone().filter(|r| !r.is_empty()),
        is_qr: event.is_qr,

        browser: ua.browser,
        browser_version: ua.browser_version,
        os: ua.os,
        os_version: ua.os_version,
        device_type: ua.device_type,

        country: geo.country,
        country_code: geo.country_code,
        city: geo.city,
        region: geo.region,
        timezone: geo.timezone,
        latitude: geo.latitude,
        longitude: geo.longitude,

        click_timestamp: event.timestamp,
        click_date: event.timestamp.date_naive(),
        day_of_week: calendar.day_of_week,
        hour_of_day: calendar.hour_of_day,
        week_of_year: calendar.week_of_year,
        month: calendar.month,
        year: calendar.year,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::models::{DeviceType, UNKNOWN};
    use chrono::{Duration, NaiveDate, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 30, 0).unwrap()
    }

    #[test]
    fn test_calendar_fields_at_year_boundary() {
        // Sunday, ISO week 52 of 2023
        let sunday = CalendarFields::from(at(2023, 12, 31, 23));
        assert_eq!(sunday.day_of_week, 0);
        assert_eq!(sunday.hour_of_day, 23);
        assert_eq!(sunday.week_of_year, 52);
        assert_eq!(sunday.month, 12);
        assert_eq!(sunday.year, 2023);

        // Monday, ISO week 1 of 2024
        let monday = CalendarFields::from(at(2024, 1, 1, 0));
        assert_eq!(monday.day_of_week, 1);
        assert_eq!(monday.hour_of_day, 0);
        assert_eq!(monday.week_of_year, 1);
        assert_eq!(monday.month, 1);
    }

    #[test]
    fn test_calendar_fields_stay_in_range() {
        let mut ts = at(2024, 1, 1, 0);
        for _ in 0..(24 * 400) {
            let fields = CalendarFields::from(ts);
            assert!(fields.hour_of_day <= 23);
            assert!(fields.day_of_week <= 6);
            assert!((1..=12).contains(&fields.month));
            assert!((1..=53).contains(&fields.week_of_year));
            ts += Duration::minutes(61);
        }
    }

    #[test]
    fn test_enrich_chrome_windows_click() {
        let mut event = RawClickEvent::new(
            "ab12cd3",
            "8.8.8.8",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
            None,
            false,
        );
        event.timestamp = at(2024, 3, 15, 14);

        let geo = GeoLocation {
            country: "United States".to_string(),
            country_code: "US".to_string(),
            ..GeoLocation::default()
        };
        let record = enrich(&event, Some("owner-1".to_string()), geo);

        assert_eq!(record.event_id, event.event_id);
        assert_eq!(record.browser, "Chrome");
        assert_eq!(record.browser_version, "119.0");
        assert_eq!(record.os, "Windows");
        assert_eq!(record.device_type, DeviceType::Desktop);
        assert_eq!(record.country, "United States");
        assert_eq!(record.city, UNKNOWN);
        assert_eq!(record.owner_user_id.as_deref(), Some("owner-1"));
        assert_eq!(record.click_date, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        assert_eq!(record.hour_of_day, 14);
        // 2024-03-15 was a Friday
        assert_eq!(record.day_of_week, 5);
        assert!(record.is_direct());
    }

    #[test]
    fn test_enrich_without_owner() {
        let event = RawClickEvent::new("gone", "1.1.1.1", "", Some("https://t.co".into()), true);
        let record = enrich(&event, None, GeoLocation::default());
        assert!(record.owner_user_id.is_none());
        assert!(record.is_qr);
        assert!(!record.is_direct());
        assert_eq!(record.source_label(), "QR Code");
    }
}
